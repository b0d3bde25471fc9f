//! One session over one connection.
//!
//! After the handshake, the transport splits and two tasks cooperate: the
//! writer serializes every outbound event (requests drawn from the channel's
//! call queue under concurrency credits, responses and hangups from the
//! control queue, keepalives from its idle timer, deadline sweeps from the
//! pending table), and the reader parses inbound packets in batches and
//! dispatches them. Stream lifetime is bounded by handshake success on one
//! end and hangup, close or breakage on the other; re-entry means a new
//! stream.

pub mod event;
pub mod handshake;

pub use event::{Event, EventAction, EventDirection, EventFilter};
pub use handshake::{DefaultHandshaker, Handshaker, Negotiated};

use crate::channel::pending::PendingCall;
use crate::channel::{ChannelCore, OutgoingCall};
use crate::error::{CallError, HangupCode, HangupError, TransportError};
use crate::net::Conn;
use crate::transport::{Transport, TransportReader, TransportWriter};
use crate::wire::{EventType, ExtraData, HangupBody, RequestHeader, ResponseHeader};
use captains_log::LogFilter;
use crossfire::*;
use event::{encode_event_frame, parse_event};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// How long the active-hangup side keeps draining responses before giving
/// up on stragglers.
const HANGUP_DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// Items the reader and handler tasks hand to the writer.
pub(crate) enum CtrlItem {
    Response { header: ResponseHeader, payload: Option<Vec<u8>> },
    Hangup { code: HangupCode, extra_data: ExtraData },
}

/// How a stream ended; the channel classifies reconnection from this.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    /// Unexpected failure: peer disappeared, I/O error, keepalive starvation.
    Broken(io::Error),
    /// The peer hung up on us.
    PeerHangup(HangupError),
    /// We hung up on the peer and finished draining.
    LocalHangup(HangupError),
    /// Deliberate local close.
    Closed,
}

/// A negotiated session, ready to run.
pub(crate) struct Stream<C: Conn> {
    transport: Transport<C>,
    pub(crate) negotiated: Negotiated,
}

impl<C: Conn> Stream<C> {
    /// Performs the handshake on a fresh connection.
    pub(crate) async fn establish(
        conn: C,
        core: &ChannelCore,
        is_client: bool,
    ) -> Result<Self, handshake::HandshakeError> {
        let mut transport = Transport::new(conn, &core.options.stream.transport);
        let negotiated = handshake::exchange(
            &mut transport,
            &core.options.stream,
            core.options.handshaker.as_ref(),
            is_client,
        )
        .await?;
        transport.set_max_outgoing_payload(negotiated.max_outgoing_payload);
        logger_debug!(
            core.logger,
            "stream {} established with peer {}: out_credits={} keepalive={:?}",
            negotiated.local_id,
            negotiated.peer_id,
            negotiated.outgoing_concurrency,
            negotiated.outgoing_keepalive,
        );
        Ok(Self { transport, negotiated })
    }

    /// Drives the session to termination and drains the pending-call table
    /// according to how it ended.
    pub(crate) async fn run(self, core: Arc<ChannelCore>) -> StreamEnd {
        let negotiated = self.negotiated;
        let (tr, tw) = self.transport.split();

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_async::<CtrlItem>();
        let ctrl_tx: MTx<CtrlItem> = ctrl_tx.into();
        let (stream_close_tx, stream_close_rx) = mpmc::unbounded_async::<()>();
        let (hangup_done_tx, hangup_done_rx) = mpmc::unbounded_async::<HangupCode>();
        let hangup_sent = Arc::new(AtomicBool::new(false));
        let active_hangup = Arc::new(Mutex::new(None));
        let out_sem = Arc::new(Semaphore::new(negotiated.outgoing_concurrency));
        let in_sem = Arc::new(Semaphore::new(negotiated.incoming_concurrency));

        *core.ctrl_tx.lock().unwrap() = Some(ctrl_tx.clone());

        let filters = &core.options.stream.filters;
        let writer = StreamWriter {
            tw,
            core: core.clone(),
            ctrl_rx,
            call_rx: core.call_rx.clone(),
            out_sem,
            keepalive: negotiated.outgoing_keepalive,
            write_timeout: core.options.stream.write_timeout,
            stream_close_rx,
            close_rx: core.close_rx.clone(),
            hangup_sent: hangup_sent.clone(),
            active_hangup: active_hangup.clone(),
            hangup_done_tx: hangup_done_tx.into(),
            out_request_filters: partition(filters, EventDirection::Outgoing, EventType::Request),
            out_response_filters: partition(filters, EventDirection::Outgoing, EventType::Response),
            scratch: Vec::with_capacity(1024),
            unflushed: Vec::new(),
            logger: core.logger.clone(),
        };
        let writer_task = tokio::spawn(writer.run());

        let mut reader = StreamReader {
            tr,
            core: core.clone(),
            ctrl_tx,
            in_sem,
            incoming_keepalive: negotiated.incoming_keepalive,
            close_rx: core.close_rx.clone(),
            hangup_done_rx,
            hangup_requested: false,
            draining: None,
            in_request_filters: partition(filters, EventDirection::Incoming, EventType::Request),
            in_response_filters: partition(filters, EventDirection::Incoming, EventType::Response),
            in_hangup_filters: partition(filters, EventDirection::Incoming, EventType::Hangup),
            logger: core.logger.clone(),
        };
        let end = reader.run().await;

        *core.ctrl_tx.lock().unwrap() = None;
        drop(reader);
        drop(stream_close_tx);
        let _ = writer_task.await;

        logger_debug!(core.logger, "stream {} ended: {:?}", negotiated.local_id, end);
        drain_pending(&core, &end);
        end
    }
}

fn partition(
    filters: &[(EventDirection, EventType, EventFilter)],
    direction: EventDirection,
    event_type: EventType,
) -> Vec<EventFilter> {
    filters
        .iter()
        .filter(|(d, t, _)| *d == direction && *t == event_type)
        .map(|(_, _, f)| f.clone())
        .collect()
}

/// Resolves every call still in the table when the stream dies. Transmitted
/// calls with `auto_retry` go back on the queue if the channel will
/// reconnect and their deadline still holds.
fn drain_pending(core: &ChannelCore, end: &StreamEnd) {
    let drained = core.pending.lock().unwrap().drain_all();
    for pending in drained {
        let PendingCall { call, permit, .. } = pending;
        drop(permit);
        match end {
            StreamEnd::Broken(_) => {
                if call.auto_retry
                    && core.reconnect_enabled()
                    && Instant::now() < call.deadline
                {
                    core.resubmit(call);
                } else {
                    call.resolve(Err(CallError::Broken));
                }
            }
            StreamEnd::PeerHangup(h) | StreamEnd::LocalHangup(h) => {
                call.resolve(Err(CallError::Hangup(h.clone())));
            }
            StreamEnd::Closed => call.resolve(Err(CallError::Closed)),
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

enum WriterWake {
    Stop,
    Ctrl(Option<CtrlItem>),
    Credit(Option<OwnedSemaphorePermit>),
    Call(Option<OutgoingCall>),
    Tick,
    Expiry,
}

struct StreamWriter<C: Conn> {
    tw: TransportWriter<C>,
    core: Arc<ChannelCore>,
    ctrl_rx: AsyncRx<CtrlItem>,
    call_rx: MAsyncRx<OutgoingCall>,
    out_sem: Arc<Semaphore>,
    keepalive: Duration,
    write_timeout: Duration,
    stream_close_rx: MAsyncRx<()>,
    close_rx: MAsyncRx<()>,
    hangup_sent: Arc<AtomicBool>,
    active_hangup: Arc<Mutex<Option<HangupCode>>>,
    hangup_done_tx: MTx<HangupCode>,
    out_request_filters: Vec<EventFilter>,
    out_response_filters: Vec<EventFilter>,
    scratch: Vec<u8>,
    /// Requests buffered since the last successful flush; a flush failure
    /// fails exactly these as transmission failures.
    unflushed: Vec<i32>,
    logger: Arc<LogFilter>,
}

impl<C: Conn> StreamWriter<C> {
    async fn run(mut self) {
        let mut tick =
            tokio::time::interval_at(Instant::now() + self.keepalive, self.keepalive);
        let mut waiting: Option<OutgoingCall> = None;
        let mut last_write = Instant::now();

        let result = loop {
            let next_expiry = self.core.pending.lock().unwrap().next_deadline();
            let wake = tokio::select! {
                biased;
                _ = self.stream_close_rx.recv() => WriterWake::Stop,
                _ = self.close_rx.recv() => WriterWake::Stop,
                item = self.ctrl_rx.recv() => WriterWake::Ctrl(item.ok()),
                permit = self.out_sem.clone().acquire_owned(), if waiting.is_some() => {
                    WriterWake::Credit(permit.ok())
                }
                call = self.call_rx.recv(), if waiting.is_none()
                    && !self.hangup_sent.load(Ordering::Relaxed) =>
                {
                    WriterWake::Call(call.ok())
                }
                _ = tick.tick() => WriterWake::Tick,
                _ = tokio::time::sleep_until(next_expiry.unwrap_or_else(far_future)),
                    if next_expiry.is_some() => WriterWake::Expiry,
            };
            match self.handle_wake(wake, &mut waiting, &mut last_write).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // an untransmitted call goes back on the queue; channel teardown
        // drains it with Closed if nothing reconnects
        if let Some(call) = waiting.take() {
            self.core.resubmit(call);
        }
        match result {
            Ok(()) => {
                // a hangup requested in the same instant the stream stopped
                // still goes out ahead of the close
                if !self.hangup_sent.load(Ordering::Relaxed) {
                    while let Ok(item) = self.ctrl_rx.try_recv() {
                        if let CtrlItem::Hangup { .. } = item {
                            if self.write_item(item).is_ok() {
                                let _ = self.flush().await;
                                self.signal_hangup_done();
                            }
                            break;
                        }
                    }
                }
                let _ = self.tw.close(false);
            }
            Err(e) => {
                logger_warn!(self.logger, "stream writer error: {}", e);
                let _ = self.tw.close(true);
            }
        }
    }

    /// Returns Ok(true) to keep running, Ok(false) on clean exit.
    async fn handle_wake(
        &mut self,
        wake: WriterWake,
        waiting: &mut Option<OutgoingCall>,
        last_write: &mut Instant,
    ) -> Result<bool, TransportError> {
        match wake {
            WriterWake::Stop => Ok(false),
            WriterWake::Ctrl(None) => Ok(false),
            WriterWake::Ctrl(Some(item)) => {
                let mut hangup = self.write_item(item)?;
                if !hangup {
                    while let Ok(item) = self.ctrl_rx.try_recv() {
                        hangup = self.write_item(item)?;
                        if hangup {
                            break;
                        }
                    }
                }
                self.flush().await?;
                *last_write = Instant::now();
                if hangup {
                    self.signal_hangup_done();
                    return Ok(false);
                }
                Ok(true)
            }
            WriterWake::Credit(None) => Ok(false),
            WriterWake::Credit(Some(permit)) => {
                // snapshot the batch before serializing anything: calls that
                // arrive during a slow encode wait for the next round, and
                // one flush covers the whole batch
                let mut batch = Vec::new();
                if let Some(call) = waiting.take() {
                    batch.push((call, permit));
                }
                loop {
                    match self.call_rx.try_recv() {
                        Ok(call) => match self.out_sem.clone().try_acquire_owned() {
                            Ok(p) => batch.push((call, p)),
                            Err(_) => {
                                *waiting = Some(call);
                                break;
                            }
                        },
                        Err(_) => break,
                    }
                }
                for (call, permit) in batch {
                    self.transmit(call, permit)?;
                }
                self.flush().await?;
                *last_write = Instant::now();
                Ok(true)
            }
            WriterWake::Call(None) => Ok(false),
            WriterWake::Call(Some(call)) => {
                *waiting = Some(call);
                Ok(true)
            }
            WriterWake::Tick => {
                if last_write.elapsed() >= self.keepalive
                    && !self.hangup_sent.load(Ordering::Relaxed)
                {
                    let tw = &mut self.tw;
                    tw.write(|out| {
                        let mut head = Vec::with_capacity(8);
                        encode_event_frame(EventType::Keepalive, None, &mut head);
                        out.write_bytes(&head);
                        Ok(())
                    })?;
                    self.flush().await?;
                    *last_write = Instant::now();
                }
                Ok(true)
            }
            WriterWake::Expiry => {
                let due = self.core.pending.lock().unwrap().expire_due(Instant::now());
                for pending in due {
                    let PendingCall { call, permit, .. } = pending;
                    drop(permit);
                    call.resolve(Err(CallError::DeadlineExceeded));
                }
                Ok(true)
            }
        }
    }

    fn write_item(&mut self, item: CtrlItem) -> Result<bool, TransportError> {
        match item {
            CtrlItem::Response { header, payload } => self.write_response(header, payload),
            CtrlItem::Hangup { code, extra_data } => {
                self.write_hangup(code, extra_data)?;
                Ok(true)
            }
        }
    }

    /// Serializes one request off the call queue. Local failures resolve the
    /// call here; only I/O failures propagate and kill the stream.
    fn transmit(
        &mut self,
        call: OutgoingCall,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), TransportError> {
        if Instant::now() >= call.deadline {
            call.resolve(Err(CallError::DeadlineExceeded));
            return Ok(());
        }
        let seq = self.core.allocate_seq();
        let mut header = RequestHeader {
            sequence_number: seq,
            service_name: call.service_name.clone(),
            method_name: call.method_name.clone(),
            extra_data: call.extra_data.clone(),
            deadline: call.wire_deadline_ns,
            trace_id: call.trace_id,
        };
        let mut payload = std::mem::take(&mut self.scratch);
        payload.clear();
        call.request.encode(&mut payload);

        if !self.out_request_filters.is_empty() {
            let mut ev = Event::request(header, payload);
            for f in self.out_request_filters.iter() {
                f(&mut ev);
            }
            match ev.request_header {
                Some(h) => {
                    header = h;
                    payload = ev.payload;
                }
                None => {
                    call.resolve(Err(CallError::Closed));
                    return Ok(());
                }
            }
        }

        let tw = &mut self.tw;
        let result = tw.write(|out| {
            let mut head = Vec::with_capacity(96 + header.service_name.len());
            encode_event_frame(
                EventType::Request,
                Some(&|b: &mut Vec<u8>| header.encode(b)),
                &mut head,
            );
            out.write_bytes(&head);
            out.write_bytes(&payload);
            Ok(())
        });
        self.scratch = payload;
        match result {
            Ok(()) => {
                logger_trace!(self.logger, "sent request seq={} {:?}", seq, header.trace_id);
                if call.response_factory.is_some() {
                    self.core
                        .pending
                        .lock()
                        .unwrap()
                        .insert(PendingCall { seq, call, permit: Some(permit) });
                    self.unflushed.push(seq);
                }
                Ok(())
            }
            Err(TransportError::PayloadTooLarge) => {
                call.resolve(Err(CallError::PayloadTooLarge));
                Ok(())
            }
            Err(e) => {
                // failed mid-transmission: never retried, even with auto_retry
                call.resolve(Err(CallError::Broken));
                Err(e)
            }
        }
    }

    fn write_response(
        &mut self,
        mut header: ResponseHeader,
        mut payload: Option<Vec<u8>>,
    ) -> Result<bool, TransportError> {
        if self.hangup_sent.load(Ordering::Relaxed) {
            return Ok(false);
        }
        if !self.out_response_filters.is_empty() {
            let mut ev = Event::response(header, payload.take().unwrap_or_default());
            for f in self.out_response_filters.iter() {
                f(&mut ev);
            }
            match ev.response_header {
                Some(h) => {
                    header = h;
                    payload = Some(ev.payload);
                }
                None => return Ok(false),
            }
        }
        let tw = &mut self.tw;
        let result = tw.write(|out| {
            let mut head = Vec::with_capacity(64);
            encode_event_frame(
                EventType::Response,
                Some(&|b: &mut Vec<u8>| header.encode(b)),
                &mut head,
            );
            out.write_bytes(&head);
            if let Some(p) = payload.as_ref() {
                out.write_bytes(p);
            }
            Ok(())
        });
        match result {
            Ok(()) => Ok(false),
            Err(TransportError::PayloadTooLarge) => {
                logger_warn!(
                    self.logger,
                    "response seq={} exceeds negotiated packet size, hanging up",
                    header.sequence_number,
                );
                self.write_hangup(HangupCode::OutgoingPacketTooLarge, ExtraData::default())?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn write_hangup(
        &mut self,
        code: HangupCode,
        extra_data: ExtraData,
    ) -> Result<(), TransportError> {
        if self.hangup_sent.swap(true, Ordering::SeqCst) {
            // repeated hangup emission is suppressed
            return Ok(());
        }
        *self.active_hangup.lock().unwrap() = Some(code);
        let body = HangupBody { code: code as i32, extra_data };
        let tw = &mut self.tw;
        tw.write(|out| {
            let mut head = Vec::with_capacity(32);
            encode_event_frame(
                EventType::Hangup,
                Some(&|b: &mut Vec<u8>| body.encode(b)),
                &mut head,
            );
            out.write_bytes(&head);
            Ok(())
        })
    }

    fn signal_hangup_done(&self) {
        let code = self.active_hangup.lock().unwrap().unwrap_or(HangupCode::Aborted);
        let _ = self.hangup_done_tx.send(code);
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        match self.tw.flush(Some(Instant::now() + self.write_timeout)).await {
            Ok(()) => {
                self.unflushed.clear();
                Ok(())
            }
            Err(e) => {
                // requests buffered since the last good flush never reached
                // the wire; they fail here and are never retried
                let mut pending = self.core.pending.lock().unwrap();
                for seq in self.unflushed.drain(..) {
                    if let Some(p) = pending.resolve(seq) {
                        let PendingCall { call, permit, .. } = p;
                        drop(permit);
                        call.resolve(Err(CallError::Broken));
                    }
                }
                Err(e)
            }
        }
    }
}

enum ReaderWake {
    Stop,
    HangupFlushed(Option<HangupCode>),
    Batch(Result<(Vec<Event>, Vec<usize>, bool), TransportError>),
}

struct StreamReader<C: Conn> {
    tr: TransportReader<C>,
    core: Arc<ChannelCore>,
    ctrl_tx: MTx<CtrlItem>,
    in_sem: Arc<Semaphore>,
    incoming_keepalive: Duration,
    close_rx: MAsyncRx<()>,
    hangup_done_rx: MAsyncRx<HangupCode>,
    hangup_requested: bool,
    draining: Option<HangupCode>,
    in_request_filters: Vec<EventFilter>,
    in_response_filters: Vec<EventFilter>,
    in_hangup_filters: Vec<EventFilter>,
    logger: Arc<LogFilter>,
}

impl<C: Conn> StreamReader<C> {
    async fn run(&mut self) -> StreamEnd {
        loop {
            if let Some(code) = self.draining {
                // active hangup flushed: we only stay to collect responses
                // for requests we initiated
                if self.core.pending.lock().unwrap().is_empty() {
                    return StreamEnd::LocalHangup(self.local_hangup(code));
                }
            }
            let deadline = match self.draining {
                Some(_) => Instant::now() + HANGUP_DRAIN_WINDOW,
                None => Instant::now() + self.incoming_keepalive * 2,
            };
            let wake = tokio::select! {
                biased;
                _ = self.close_rx.recv() => ReaderWake::Stop,
                code = self.hangup_done_rx.recv() => ReaderWake::HangupFlushed(code.ok()),
                r = self.tr.peek_batch(Some(deadline)) => ReaderWake::Batch(r.map(decode_batch)),
            };
            match wake {
                ReaderWake::Stop => return StreamEnd::Closed,
                ReaderWake::HangupFlushed(code) => {
                    self.draining = Some(code.unwrap_or(HangupCode::Aborted));
                }
                ReaderWake::Batch(Err(e)) => match e {
                    TransportError::Closed => return StreamEnd::Closed,
                    TransportError::Timeout => match self.draining {
                        Some(code) => return StreamEnd::LocalHangup(self.local_hangup(code)),
                        None => {
                            // no packet for 2x the keepalive interval
                            logger_warn!(self.logger, "peer keepalive starved, stream broken");
                            return StreamEnd::Broken(io::Error::from(io::ErrorKind::TimedOut));
                        }
                    },
                    TransportError::PayloadTooLarge => {
                        self.request_hangup(HangupCode::BadIncomingPacket);
                        return StreamEnd::LocalHangup(
                            self.local_hangup(HangupCode::BadIncomingPacket),
                        );
                    }
                    TransportError::Io(e) => match self.draining {
                        Some(code) => return StreamEnd::LocalHangup(self.local_hangup(code)),
                        None => return StreamEnd::Broken(e),
                    },
                },
                ReaderWake::Batch(Ok((events, lens, bad))) => {
                    self.tr.skip_batch(&lens);
                    for ev in events {
                        if let Some(end) = self.handle_event(ev) {
                            return end;
                        }
                    }
                    if bad {
                        self.request_hangup(HangupCode::BadIncomingPacket);
                        return StreamEnd::LocalHangup(
                            self.local_hangup(HangupCode::BadIncomingPacket),
                        );
                    }
                }
            }
        }
    }

    fn local_hangup(&self, code: HangupCode) -> HangupError {
        HangupError { code, passive: false, extra_data: ExtraData::default() }
    }

    fn handle_event(&mut self, mut ev: Event) -> Option<StreamEnd> {
        let filters = match ev.event_type {
            EventType::Request => &self.in_request_filters,
            EventType::Response => &self.in_response_filters,
            EventType::Hangup => &self.in_hangup_filters,
            EventType::Keepalive => return None,
        };
        for f in filters.iter() {
            f(&mut ev);
        }
        match ev.event_type {
            EventType::Keepalive => None,
            EventType::Hangup => {
                let body =
                    ev.hangup.take().unwrap_or(HangupBody { code: 0, extra_data: ExtraData::default() });
                Some(StreamEnd::PeerHangup(HangupError {
                    code: HangupCode::from_i32(body.code).unwrap_or(HangupCode::System),
                    passive: true,
                    extra_data: body.extra_data,
                }))
            }
            EventType::Response => {
                if let Some(header) = ev.response_header.take() {
                    self.core.resolve_response(header, ev.payload);
                }
                None
            }
            EventType::Request => {
                self.handle_request(ev);
                None
            }
        }
    }

    fn handle_request(&mut self, mut ev: Event) {
        let Some(header) = ev.request_header.take() else { return };
        if self.hangup_requested || self.draining.is_some() {
            // our side is going silent; the peer's request can never be
            // answered
            return;
        }
        if ev.action == EventAction::DirectResponse {
            let mut rh = ev.response_header.take().unwrap_or(ResponseHeader {
                sequence_number: 0,
                extra_data: ExtraData::default(),
                rpc_error: None,
            });
            rh.sequence_number = header.sequence_number;
            let _ = self
                .ctrl_tx
                .send(CtrlItem::Response { header: rh, payload: Some(ev.payload) });
            return;
        }
        match self.in_sem.clone().try_acquire_owned() {
            Err(_) => {
                logger_warn!(
                    self.logger,
                    "incoming concurrency limit hit at seq={}, hanging up",
                    header.sequence_number,
                );
                self.request_hangup(HangupCode::TooManyIncomingRequests);
            }
            Ok(permit) => {
                let core = self.core.clone();
                let ctrl = self.ctrl_tx.clone();
                let payload = ev.payload;
                tokio::spawn(async move {
                    let _permit = permit;
                    let (rh, body) = core.handle_incoming(header, payload).await;
                    let _ = ctrl.send(CtrlItem::Response { header: rh, payload: body });
                });
            }
        }
    }

    fn request_hangup(&mut self, code: HangupCode) {
        if self.hangup_requested {
            return;
        }
        self.hangup_requested = true;
        let _ = self.ctrl_tx.send(CtrlItem::Hangup { code, extra_data: ExtraData::default() });
    }
}

fn decode_batch(payloads: Vec<&[u8]>) -> (Vec<Event>, Vec<usize>, bool) {
    let mut lens = Vec::with_capacity(payloads.len());
    let mut events = Vec::with_capacity(payloads.len());
    let mut bad = false;
    for p in payloads {
        match parse_event(p) {
            Ok(ev) => {
                lens.push(p.len());
                events.push(ev);
            }
            Err(_) => {
                bad = true;
                break;
            }
        }
    }
    (events, lens, bad)
}
