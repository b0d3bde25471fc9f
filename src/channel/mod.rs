//! The long-lived logical connection.
//!
//! A channel outlives its streams: the client side dials, handshakes and
//! re-dials through an address pool, while calls queue against the channel
//! and transmit on whichever stream is current. Correlation, deadlines,
//! retry and the interceptor pipelines all live here.

pub(crate) mod pending;

mod interceptor;
mod listener;
mod vars;

pub use interceptor::{
    IncomingInterceptor, IncomingNext, OutgoingInterceptor, OutgoingNext, ServiceHandler,
};
pub use listener::{ChannelEvent, ChannelListener};
pub use vars::CallVars;

use crate::address_pool::AddressPool;
use crate::config::StreamOptions;
use crate::error::{
    is_retryable_io, CallError, ChannelError, HangupCode, RpcError, RpcErrorType, TransportError,
};
use crate::message::{Message, MessageFactory, NullMessage};
use crate::net::{Conn, Connector};
use crate::stream::handshake::HandshakeError;
use crate::stream::{CtrlItem, DefaultHandshaker, Handshaker, Stream, StreamEnd};
use crate::wire::{ExtraData, RequestHeader, ResponseHeader};
use captains_log::LogFilter;
use crossfire::*;
use interceptor::{compose_incoming, compose_outgoing};
use listener::ListenerQueue;
use pending::{PendingCall, PendingCallTable};
use rustc_hash::FxHashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Channel lifecycle. Transitions are one-way except Running → Reconnecting
/// → Connecting on client channels.
#[derive(strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    #[strum(serialize = "new")]
    New = 0,
    #[strum(serialize = "connecting")]
    Connecting = 1,
    #[strum(serialize = "handshaking")]
    Handshaking = 2,
    #[strum(serialize = "running")]
    Running = 3,
    #[strum(serialize = "reconnecting")]
    Reconnecting = 4,
    #[strum(serialize = "closed")]
    Closed = 5,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Handshaking,
            3 => Self::Running,
            4 => Self::Reconnecting,
            5 => Self::Closed,
            _ => Self::New,
        }
    }
}

/// A call or request moving through an interceptor pipeline.
pub struct Rpc {
    pub vars: CallVars,
    pub extra_data: ExtraData,
    pub request: Box<dyn Message>,
    /// Deadline a handler can observe and wait against; `None` when the
    /// caller set none.
    pub deadline: Option<Instant>,
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rpc {:?} {:?}", self.vars, self.request)
    }
}

/// What a successful call yields.
pub struct Reply {
    pub message: Box<dyn Message>,
    pub extra_data: ExtraData,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reply")
            .field("message", &self.message)
            .field("extra_data", &self.extra_data)
            .finish()
    }
}

impl Reply {
    pub fn new(message: Box<dyn Message>) -> Self {
        Self { message, extra_data: ExtraData::default() }
    }

    /// Concrete view of the decoded body.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.message.as_any().downcast_ref::<T>()
    }
}

/// Per-call options for the call surface.
pub struct CallOptions {
    pub service_name: String,
    pub method_name: String,
    pub method_index: i32,
    /// Non-empty keys share a serialized emission order.
    pub fifo_key: String,
    pub extra_data: ExtraData,
    /// Per-call deadline, clamped to the channel's `default_call_timeout`
    /// ceiling; `None` takes the ceiling itself.
    pub timeout: Option<Duration>,
    /// Re-enqueue on the next stream if this one breaks while the call is
    /// awaiting its response.
    pub auto_retry: bool,
    /// Parent vars for span inheritance on nested calls.
    pub parent: Option<CallVars>,
}

impl CallOptions {
    pub fn new(service_name: &str, method_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            method_index: -1,
            fifo_key: String::new(),
            extra_data: ExtraData::default(),
            timeout: None,
            auto_retry: false,
            parent: None,
        }
    }
}

/// One registered method: body factory, handler, scoped interceptors.
#[derive(Clone, Default)]
struct MethodEntry {
    request_factory: Option<MessageFactory>,
    handler: Option<ServiceHandler>,
    incoming_interceptors: Vec<IncomingInterceptor>,
    outgoing_interceptors: Vec<OutgoingInterceptor>,
}

/// Builder handle returned by [ChannelOptions::build_method].
pub struct MethodOptions<'a> {
    entry: &'a mut MethodEntry,
}

impl MethodOptions<'_> {
    pub fn set_request_factory(self, factory: MessageFactory) -> Self {
        self.entry.request_factory = Some(factory);
        self
    }

    pub fn set_handler(self, handler: ServiceHandler) -> Self {
        self.entry.handler = Some(handler);
        self
    }

    pub fn add_incoming_interceptor(self, interceptor: IncomingInterceptor) -> Self {
        self.entry.incoming_interceptors.push(interceptor);
        self
    }

    pub fn add_outgoing_interceptor(self, interceptor: OutgoingInterceptor) -> Self {
        self.entry.outgoing_interceptors.push(interceptor);
        self
    }
}

#[derive(Clone)]
pub struct ChannelOptions {
    pub stream: StreamOptions,
    /// Ceiling on every call's deadline; calls with no explicit timeout get
    /// exactly this.
    pub default_call_timeout: Duration,
    pub handshaker: Arc<dyn Handshaker>,
    pub logger: Arc<LogFilter>,
    methods: FxHashMap<String, MethodEntry>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            stream: StreamOptions::default(),
            default_call_timeout: Duration::from_secs(20),
            handshaker: Arc::new(DefaultHandshaker),
            logger: Arc::new(LogFilter::new()),
            methods: FxHashMap::default(),
        }
    }
}

fn method_key(service_name: &str, method_name: &str) -> String {
    format!("{}:{}", service_name, method_name)
}

impl ChannelOptions {
    /// Registers or extends a method. Empty names widen the scope:
    /// `("", "")` is global, `("svc", "")` is per-service; interceptors
    /// registered there run for every matching call.
    pub fn build_method(&mut self, service_name: &str, method_name: &str) -> MethodOptions<'_> {
        let entry = self.methods.entry(method_key(service_name, method_name)).or_default();
        MethodOptions { entry }
    }

    fn lookup(&self, service_name: &str, method_name: &str) -> Option<&MethodEntry> {
        self.methods.get(&method_key(service_name, method_name))
    }

    fn outgoing_chain(&self, service_name: &str, method_name: &str) -> Vec<OutgoingInterceptor> {
        let mut chain = Vec::new();
        self.collect_scopes(service_name, method_name, |entry| {
            chain.extend(entry.outgoing_interceptors.iter().cloned());
        });
        chain
    }

    fn incoming_chain(&self, service_name: &str, method_name: &str) -> Vec<IncomingInterceptor> {
        let mut chain = Vec::new();
        self.collect_scopes(service_name, method_name, |entry| {
            chain.extend(entry.incoming_interceptors.iter().cloned());
        });
        chain
    }

    fn collect_scopes<F: FnMut(&MethodEntry)>(
        &self,
        service_name: &str,
        method_name: &str,
        mut visit: F,
    ) {
        if let Some(entry) = self.lookup("", "") {
            visit(entry);
        }
        if !service_name.is_empty() {
            if let Some(entry) = self.lookup(service_name, "") {
                visit(entry);
            }
            if !method_name.is_empty() {
                if let Some(entry) = self.lookup(service_name, method_name) {
                    visit(entry);
                }
            }
        }
    }
}

/// A call queued for the stream writer.
pub(crate) struct OutgoingCall {
    pub service_name: String,
    pub method_name: String,
    pub fifo_key: String,
    pub extra_data: ExtraData,
    pub trace_id: Uuid,
    pub deadline: Instant,
    pub wire_deadline_ns: i64,
    pub request: Box<dyn Message>,
    /// `None` marks a fire-and-forget call: no pending entry, no credit held
    /// past transmission.
    pub response_factory: Option<MessageFactory>,
    pub auto_retry: bool,
    pub done_tx: Option<oneshot::Sender<Result<Reply, CallError>>>,
}

impl OutgoingCall {
    /// Exactly-once: consuming self makes double resolution unrepresentable.
    pub(crate) fn resolve(mut self, outcome: Result<Reply, CallError>) {
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(outcome);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(request: Box<dyn Message>, deadline: Instant) -> Self {
        Self {
            service_name: "svc".to_string(),
            method_name: "m".to_string(),
            fifo_key: String::new(),
            extra_data: ExtraData::default(),
            trace_id: Uuid::new_v4(),
            deadline,
            wire_deadline_ns: 0,
            request,
            response_factory: None,
            auto_retry: false,
            done_tx: None,
        }
    }
}

impl fmt::Debug for OutgoingCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "call {}.{} {:?}", self.service_name, self.method_name, self.trace_id)?;
        if !self.fifo_key.is_empty() {
            write!(f, " fifo:{}", self.fifo_key)?;
        }
        Ok(())
    }
}

pub(crate) struct ChannelCore {
    pub(crate) options: ChannelOptions,
    pub(crate) client_side: bool,
    reconnect: AtomicBool,
    state: AtomicU8,
    seq: AtomicI32,
    pub(crate) pending: Mutex<PendingCallTable>,
    call_tx: Mutex<Option<MTx<OutgoingCall>>>,
    pub(crate) call_rx: MAsyncRx<OutgoingCall>,
    close_tx: Mutex<Option<MTx<()>>>,
    pub(crate) close_rx: MAsyncRx<()>,
    /// The live stream's control queue, for hangup initiation.
    pub(crate) ctrl_tx: Mutex<Option<MTx<CtrlItem>>>,
    listeners: Mutex<Vec<Arc<ListenerQueue>>>,
    pub(crate) logger: Arc<LogFilter>,
}

impl ChannelCore {
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.close_tx.lock().unwrap().is_none()
    }

    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.client_side && self.reconnect.load(Ordering::Relaxed) && !self.is_closing()
    }

    /// Sequence numbers are strictly increasing per channel instance and
    /// never reused; a retried call gets a fresh one.
    pub(crate) fn allocate_seq(&self) -> i32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn submit(&self, call: OutgoingCall) -> Result<(), OutgoingCall> {
        let guard = self.call_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => match tx.send(call) {
                Ok(()) => Ok(()),
                Err(SendError(call)) => Err(call),
            },
            None => Err(call),
        }
    }

    pub(crate) fn resubmit(&self, call: OutgoingCall) {
        if let Err(call) = self.submit(call) {
            call.resolve(Err(CallError::Closed));
        }
    }

    /// Correlates a response event with its pending call. Unknown sequence
    /// numbers are late responses and are dropped.
    pub(crate) fn resolve_response(&self, header: ResponseHeader, payload: Vec<u8>) {
        let pending = self.pending.lock().unwrap().resolve(header.sequence_number);
        let Some(PendingCall { call, permit, .. }) = pending else {
            logger_trace!(self.logger, "late response seq={} dropped", header.sequence_number);
            return;
        };
        let outcome = match header.rpc_error {
            Some(body) if body.error_type != 0 => Err(CallError::Rpc(RpcError::from_body(body))),
            _ => match call.response_factory.as_ref() {
                Some(factory) => {
                    let mut message = factory();
                    match message.decode(&payload) {
                        Ok(()) => Ok(Reply { message, extra_data: header.extra_data }),
                        Err(()) => Err(CallError::BadResponse),
                    }
                }
                None => return,
            },
        };
        call.resolve(outcome);
        drop(permit);
    }

    /// Runs one admitted incoming request to a response header and body.
    pub(crate) async fn handle_incoming(
        self: &Arc<Self>,
        header: RequestHeader,
        payload: Vec<u8>,
    ) -> (ResponseHeader, Option<Vec<u8>>) {
        let seq = header.sequence_number;
        let looked_up = self.options.lookup(&header.service_name, &header.method_name).and_then(
            |entry| match (&entry.request_factory, &entry.handler) {
                (Some(f), Some(h)) => Some((f.clone(), h.clone())),
                _ => None,
            },
        );
        let Some((factory, handler)) = looked_up else {
            return error_response(
                seq,
                RpcError::new(RpcErrorType::NotFound, "method_not_found", "no handler registered"),
            );
        };
        let mut request = factory();
        if request.decode(&payload).is_err() {
            return error_response(
                seq,
                RpcError::new(RpcErrorType::BadRequest, "bad_request_body", "body decode failed"),
            );
        }
        let channel = Channel { core: self.clone() };
        let vars = CallVars::incoming(
            Some(channel),
            &header.service_name,
            &header.method_name,
            header.trace_id,
        );
        let chain = self.options.incoming_chain(&header.service_name, &header.method_name);
        let rpc = Rpc {
            vars,
            extra_data: header.extra_data,
            request,
            deadline: wire_deadline_to_instant(header.deadline),
        };
        let terminal: IncomingNext = Box::new(move |rpc| handler(rpc));
        match compose_incoming(chain, terminal)(rpc).await {
            Ok(reply) => {
                let mut body = Vec::with_capacity(reply.message.size());
                reply.message.encode(&mut body);
                (
                    ResponseHeader {
                        sequence_number: seq,
                        extra_data: reply.extra_data,
                        rpc_error: None,
                    },
                    Some(body),
                )
            }
            Err(e) => error_response(seq, e),
        }
    }

    pub(crate) fn notify(&self, event: ChannelEvent) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.push(event);
        }
    }

    /// Idempotent teardown: stops accepting calls, wakes every loop, drains
    /// the queue, tells the listeners.
    pub(crate) fn shutdown(&self) {
        let previous = self.state.swap(ChannelState::Closed as u8, Ordering::SeqCst);
        if previous == ChannelState::Closed as u8 {
            return;
        }
        let call_tx = self.call_tx.lock().unwrap().take();
        drop(call_tx);
        let close_tx = self.close_tx.lock().unwrap().take();
        drop(close_tx);
        while let Ok(call) = self.call_rx.try_recv() {
            call.resolve(Err(CallError::Closed));
        }
        logger_debug!(self.logger, "channel closed");
        self.notify(ChannelEvent::Closed);
        for listener in self.listeners.lock().unwrap().iter() {
            listener.close();
        }
    }

    async fn do_call(
        &self,
        rpc: Rpc,
        response_factory: Option<MessageFactory>,
        deadline: Instant,
        auto_retry: bool,
        fifo_key: String,
    ) -> Result<Reply, CallError> {
        // the negotiated packet bound can only be smaller than the configured
        // one, so a body this large can never transmit; reject it before it
        // is queued so fire-and-forget callers see the failure too
        if rpc.request.size() > self.options.stream.transport.max_packet_payload_size {
            return Err(CallError::PayloadTooLarge);
        }
        let (done_tx, done_rx) = oneshot::channel();
        let expects_response = response_factory.is_some();
        let call = OutgoingCall {
            service_name: rpc.vars.service_name.clone(),
            method_name: rpc.vars.method_name.clone(),
            fifo_key,
            extra_data: rpc.extra_data,
            trace_id: rpc.vars.trace_id,
            deadline,
            wire_deadline_ns: instant_to_wire_ns(deadline),
            request: rpc.request,
            response_factory,
            auto_retry,
            done_tx: if expects_response { Some(done_tx) } else { None },
        };
        if let Err(call) = self.submit(call) {
            drop(call);
            return Err(CallError::Closed);
        }
        if !expects_response {
            return Ok(Reply::new(Box::new(NullMessage)));
        }
        match tokio::time::timeout_at(deadline, done_rx).await {
            Err(_) => Err(CallError::DeadlineExceeded),
            Ok(Err(_)) => Err(CallError::Closed),
            Ok(Ok(outcome)) => outcome,
        }
    }
}

fn error_response(seq: i32, error: RpcError) -> (ResponseHeader, Option<Vec<u8>>) {
    (
        ResponseHeader {
            sequence_number: seq,
            extra_data: ExtraData::default(),
            rpc_error: Some(error.to_body()),
        },
        None,
    )
}

fn wire_deadline_to_instant(deadline_ns: i64) -> Option<Instant> {
    if deadline_ns <= 0 {
        return None;
    }
    let now_unix_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let delta = deadline_ns.saturating_sub(now_unix_ns);
    if delta <= 0 {
        Some(Instant::now())
    } else {
        Some(Instant::now() + Duration::from_nanos(delta as u64))
    }
}

fn instant_to_wire_ns(deadline: Instant) -> i64 {
    let delta = deadline.saturating_duration_since(Instant::now());
    let now_unix_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    now_unix_ns.saturating_add(delta.as_nanos() as i64)
}

fn transport_err_to_io(e: TransportError) -> io::Error {
    match e {
        TransportError::Io(e) => e,
        TransportError::Timeout => io::Error::from(io::ErrorKind::TimedOut),
        TransportError::Closed => io::Error::from(io::ErrorKind::NotConnected),
        TransportError::PayloadTooLarge => io::Error::from(io::ErrorKind::InvalidData),
    }
}

/// The call surface and lifecycle handle. Cheap to clone; all clones share
/// one logical connection.
#[derive(Clone)]
pub struct Channel {
    pub(crate) core: Arc<ChannelCore>,
}

impl Channel {
    fn new(options: ChannelOptions, client_side: bool) -> Self {
        let mut options = options;
        options.stream = options.stream.normalize();
        let logger = options.logger.clone();
        let (call_tx, call_rx) = mpmc::unbounded_async::<OutgoingCall>();
        let (close_tx, close_rx) = mpmc::unbounded_async::<()>();
        Self {
            core: Arc::new(ChannelCore {
                options,
                client_side,
                reconnect: AtomicBool::new(false),
                state: AtomicU8::new(ChannelState::New as u8),
                seq: AtomicI32::new(1),
                pending: Mutex::new(PendingCallTable::default()),
                call_tx: Mutex::new(Some(call_tx)),
                call_rx,
                close_tx: Mutex::new(Some(close_tx)),
                close_rx,
                ctrl_tx: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                logger,
            }),
        }
    }

    /// A server-side channel, driven by accepted connections via
    /// [Channel::serve].
    pub fn server(options: ChannelOptions) -> Self {
        Self::new(options, false)
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Calls a method and decodes the response body with `response_factory`.
    pub async fn call(
        &self,
        options: CallOptions,
        request: Box<dyn Message>,
        response_factory: MessageFactory,
    ) -> Result<Reply, CallError> {
        self.call_inner(options, request, Some(response_factory)).await.map(|r| match r {
            Some(reply) => reply,
            None => Reply::new(Box::new(NullMessage)),
        })
    }

    /// Fire-and-forget: a sequence number is still allocated, but no pending
    /// call is tracked. Failures before transmission surface here;
    /// transmission failures only reach channel listeners.
    pub async fn call_without_return(
        &self,
        mut options: CallOptions,
        request: Box<dyn Message>,
    ) -> Result<(), CallError> {
        // fire-and-forget never inherits a span
        options.parent = None;
        self.call_inner(options, request, None).await.map(|_| ())
    }

    async fn call_inner(
        &self,
        options: CallOptions,
        request: Box<dyn Message>,
        response_factory: Option<MessageFactory>,
    ) -> Result<Option<Reply>, CallError> {
        let core = &self.core;
        if core.state() == ChannelState::Closed {
            return Err(CallError::Closed);
        }
        let vars = match options.parent.as_ref() {
            Some(parent) => CallVars::child_of(
                parent,
                Some(self.clone()),
                &options.service_name,
                &options.method_name,
                options.method_index,
                &options.fifo_key,
            ),
            None => CallVars::root(
                Some(self.clone()),
                &options.service_name,
                &options.method_name,
                options.method_index,
                &options.fifo_key,
            ),
        };
        // the wire deadline is min(caller deadline, now + configured default)
        let timeout = options
            .timeout
            .unwrap_or(core.options.default_call_timeout)
            .min(core.options.default_call_timeout);
        let deadline = Instant::now() + timeout;
        let chain = core.options.outgoing_chain(&options.service_name, &options.method_name);
        let rpc = Rpc { vars, extra_data: options.extra_data, request, deadline: Some(deadline) };

        let core2 = core.clone();
        let auto_retry = options.auto_retry;
        let fifo_key = options.fifo_key;
        let terminal: OutgoingNext = Box::new(move |rpc| {
            Box::pin(async move {
                core2.do_call(rpc, response_factory, deadline, auto_retry, fifo_key).await
            })
        });
        compose_outgoing(chain, terminal)(rpc).await.map(Some)
    }

    /// Serves one accepted connection. The channel survives a Broken end so
    /// an embedder may serve a replacement connection; hangup or close are
    /// final.
    pub async fn serve<C: Conn>(&self, conn: C) -> Result<(), ChannelError> {
        let core = &self.core;
        if core.is_closing() {
            return Err(ChannelError::Closed);
        }
        core.set_state(ChannelState::Handshaking);
        let stream = match Stream::establish(conn, core, self.core.client_side).await {
            Ok(s) => s,
            Err(e) => {
                let e = classify_handshake_error(e);
                core.shutdown();
                return Err(e);
            }
        };
        core.set_state(ChannelState::Running);
        core.notify(ChannelEvent::Established);
        match stream.run(core.clone()).await {
            StreamEnd::Broken(e) => {
                core.notify(ChannelEvent::Broken);
                core.set_state(ChannelState::New);
                Err(ChannelError::Broken(e))
            }
            StreamEnd::PeerHangup(h) | StreamEnd::LocalHangup(h) => {
                core.shutdown();
                Err(ChannelError::Hangup(h))
            }
            StreamEnd::Closed => {
                core.shutdown();
                Ok(())
            }
        }
    }

    /// Registers a lifecycle observer with a bound on queued notifications.
    pub fn add_listener(&self, max_pending: usize) -> ChannelListener {
        let queue = ListenerQueue::new(max_pending);
        self.core.listeners.lock().unwrap().push(queue.clone());
        ChannelListener { queue }
    }

    pub fn remove_listener(&self, listener: &ChannelListener) {
        let mut listeners = self.core.listeners.lock().unwrap();
        listeners.retain(|q| !Arc::ptr_eq(q, &listener.queue));
        listener.queue.close();
    }

    /// Immediate teardown: the current stream dies without a goodbye, so the
    /// peer observes a broken stream. Queued and pending calls resolve with
    /// `Closed`.
    pub fn abort(&self) {
        self.core.shutdown();
    }

    /// Graceful teardown: emits an `Aborted` hangup on the live stream and
    /// lets the drain finish; falls back to [Channel::abort] when no stream
    /// is up.
    pub fn hangup(&self, extra_data: ExtraData) {
        let ctrl = self.core.ctrl_tx.lock().unwrap().clone();
        match ctrl {
            Some(tx) => {
                let _ = tx.send(CtrlItem::Hangup { code: HangupCode::Aborted, extra_data });
            }
            None => self.core.shutdown(),
        }
    }

    /// Alias for [Channel::abort]; both end the channel.
    pub fn close(&self) {
        self.core.shutdown();
    }
}

fn classify_handshake_error(e: HandshakeError) -> ChannelError {
    match e {
        HandshakeError::Rejected => ChannelError::HandshakeRejected,
        HandshakeError::Protocol => ChannelError::BadHandshake,
        HandshakeError::Transport(te) => ChannelError::Connect(transport_err_to_io(te)),
    }
}

/// Client-channel knobs beyond the shared channel options.
pub struct ClientChannelOptions {
    pub channel: ChannelOptions,
    /// Re-dial after retryable failures. Off, any Broken dispatch closes the
    /// channel.
    pub reconnect: bool,
    /// Per-dial bound; also the address pool's cooldown base.
    pub connect_timeout: Duration,
}

impl Default for ClientChannelOptions {
    fn default() -> Self {
        Self {
            channel: ChannelOptions::default(),
            reconnect: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A channel that owns its dialing loop: draws addresses from the pool,
/// connects, handshakes, dispatches, and re-enters the loop on retryable
/// failures.
pub struct ClientChannel<N: Connector> {
    channel: Channel,
    connector: N,
    pool: AddressPool,
    reconnect: bool,
    connect_timeout: Duration,
}

impl<N: Connector> ClientChannel<N> {
    pub fn new(options: ClientChannelOptions, connector: N, addresses: &[String]) -> Self {
        let channel = Channel::new(options.channel, true);
        channel.core.reconnect.store(options.reconnect, Ordering::Relaxed);
        let pool = AddressPool::new(addresses, 3, options.connect_timeout);
        Self {
            channel,
            connector,
            pool,
            reconnect: options.reconnect,
            connect_timeout: options.connect_timeout,
        }
    }

    /// Installs a new address list without dropping the channel.
    pub fn update_addresses(&self, addresses: &[String]) {
        self.pool.reset(Some(addresses), 3, self.connect_timeout);
    }

    /// An owned handle to the call surface, for tasks that outlive `self`.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// The dialing loop. Returns when the channel closes or a non-retryable
    /// failure surfaces.
    pub async fn run(&self) -> Result<(), ChannelError> {
        let core = &self.channel.core;
        let result = loop {
            if core.is_closing() {
                break Ok(());
            }
            core.set_state(ChannelState::Connecting);
            core.notify(ChannelEvent::Connecting);
            let address = tokio::select! {
                biased;
                _ = core.close_rx.recv() => break Ok(()),
                a = self.pool.get_value() => match a {
                    Some(a) => a,
                    None => break Ok(()),
                },
            };
            let attempt_deadline = self.pool.when_next_value_usable();
            let conn = match self.connector.connect(&address, attempt_deadline).await {
                Ok(c) => c,
                Err(e) => {
                    logger_debug!(core.logger, "dial {} failed: {}", address, e);
                    if is_retryable_io(&e) && self.reconnect && !core.is_closing() {
                        continue;
                    }
                    break Err(ChannelError::Connect(e));
                }
            };
            core.set_state(ChannelState::Handshaking);
            let stream = match Stream::establish(conn, core, true).await {
                Ok(s) => s,
                Err(HandshakeError::Rejected) => break Err(ChannelError::HandshakeRejected),
                Err(HandshakeError::Protocol) => break Err(ChannelError::BadHandshake),
                Err(HandshakeError::Transport(te)) => {
                    let e = transport_err_to_io(te);
                    logger_debug!(core.logger, "handshake with {} failed: {}", address, e);
                    if is_retryable_io(&e) && self.reconnect && !core.is_closing() {
                        continue;
                    }
                    break Err(ChannelError::Connect(e));
                }
            };
            // the peer is healthy again: shorten the pool's backoff
            self.pool.reset(None, 0, self.connect_timeout / 3);
            core.set_state(ChannelState::Running);
            core.notify(ChannelEvent::Established);
            match stream.run(core.clone()).await {
                StreamEnd::Broken(e) => {
                    core.notify(ChannelEvent::Broken);
                    if self.reconnect && !core.is_closing() {
                        core.set_state(ChannelState::Reconnecting);
                        continue;
                    }
                    break Err(ChannelError::Broken(e));
                }
                StreamEnd::PeerHangup(h) | StreamEnd::LocalHangup(h) => {
                    break Err(ChannelError::Hangup(h));
                }
                StreamEnd::Closed => break Ok(()),
            }
        };
        core.shutdown();
        self.pool.gc();
        result
    }
}

impl<N: Connector> std::ops::Deref for ClientChannel<N> {
    type Target = Channel;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}
