//! The two-phase handshake that turns a raw connection into a negotiated
//! session.
//!
//! Phase one trades `TransportHandshakeHeader`s and applies min-of-maxes to
//! packet sizes. Phase two trades `StreamHandshakeHeader`s plus an opaque
//! payload owned by the injected [Handshaker]; a handshaker that returns
//! `false` closes the connection immediately, with no hangup on the wire.

use crate::config::StreamOptions;
use crate::error::TransportError;
use crate::net::Conn;
use crate::transport::Transport;
use crate::wire::{self, StreamHandshakeHeader, TransportHandshakeHeader};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// The user-extensible handshake hook, symmetric on both peers.
pub trait Handshaker: Send + Sync + 'static {
    /// The opaque payload to offer the peer.
    fn emit_handshake(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Inspects the peer's payload; `false` rejects the connection.
    fn handle_handshake<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, bool> {
        let _ = payload;
        Box::pin(async { true })
    }
}

/// Accepts everything, offers nothing.
pub struct DefaultHandshaker;

impl Handshaker for DefaultHandshaker {}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// A handshaker voted no. Local close, no hangup exchanged.
    #[error("handshake rejected")]
    Rejected,
    #[error("bad handshake packet")]
    Protocol,
    #[error("handshake transport: {0}")]
    Transport(#[from] TransportError),
}

/// What the exchange settled on.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub local_id: Uuid,
    pub peer_id: Uuid,
    /// min(own max-outgoing, peer max-incoming)
    pub max_outgoing_payload: usize,
    /// max(own outgoing interval, peer incoming interval)
    pub outgoing_keepalive: Duration,
    /// max(own incoming interval, peer outgoing interval)
    pub incoming_keepalive: Duration,
    /// min(own outgoing limit, peer incoming limit)
    pub outgoing_concurrency: usize,
    /// own incoming limit, enforced locally
    pub incoming_concurrency: usize,
}

/// The negotiation rules, pure so they can be checked directly.
pub(crate) fn negotiate(
    local: &StreamOptions,
    local_id: Uuid,
    peer_transport: &TransportHandshakeHeader,
    peer_stream: &StreamHandshakeHeader,
) -> Negotiated {
    let max_outgoing_payload = (local.transport.max_packet_payload_size)
        .min(peer_transport.max_incoming_packet_size.max(0) as usize);
    let outgoing_keepalive = local
        .outgoing_keepalive_interval
        .max(Duration::from_nanos(peer_stream.incoming_keepalive_interval_ns));
    let incoming_keepalive = local
        .incoming_keepalive_interval
        .max(Duration::from_nanos(peer_stream.outgoing_keepalive_interval_ns));
    let outgoing_concurrency = local
        .outgoing_concurrency_limit
        .min(peer_stream.incoming_concurrency_limit.max(1) as usize);
    Negotiated {
        local_id,
        peer_id: peer_transport.id,
        max_outgoing_payload,
        outgoing_keepalive,
        incoming_keepalive,
        outgoing_concurrency,
        incoming_concurrency: local.incoming_concurrency_limit,
    }
}

/// Runs the full exchange. The client writes first in both phases; either
/// side's handshaker may reject, which surfaces as [HandshakeError::Rejected]
/// after an immediate close.
pub(crate) async fn exchange<C: Conn>(
    transport: &mut Transport<C>,
    options: &StreamOptions,
    handshaker: &dyn Handshaker,
    is_client: bool,
) -> Result<Negotiated, HandshakeError> {
    let deadline = Some(Instant::now() + options.handshake_timeout);
    let local_id = Uuid::new_v4();
    let local_transport = TransportHandshakeHeader {
        id: local_id,
        max_incoming_packet_size: options.transport.max_packet_payload_size as i32,
        max_outgoing_packet_size: options.transport.max_packet_payload_size as i32,
    };
    let local_stream = StreamHandshakeHeader {
        incoming_keepalive_interval_ns: options.incoming_keepalive_interval.as_nanos() as u64,
        outgoing_keepalive_interval_ns: options.outgoing_keepalive_interval.as_nanos() as u64,
        incoming_concurrency_limit: options.incoming_concurrency_limit as i32,
        outgoing_concurrency_limit: options.outgoing_concurrency_limit as i32,
    };

    let peer_transport;
    let peer_stream;
    let peer_payload;
    if is_client {
        write_transport_header(transport, &local_transport)?;
        transport.flush(deadline).await?;
        peer_transport = read_transport_header(transport, deadline).await?;

        write_stream_header(transport, &local_stream, &handshaker.emit_handshake())?;
        transport.flush(deadline).await?;
        let (header, payload) = read_stream_header(transport, deadline).await?;
        peer_stream = header;
        peer_payload = payload;
        if !handshaker.handle_handshake(&peer_payload).await {
            let _ = transport.close(false);
            return Err(HandshakeError::Rejected);
        }
    } else {
        peer_transport = read_transport_header(transport, deadline).await?;
        write_transport_header(transport, &local_transport)?;
        transport.flush(deadline).await?;

        let (header, payload) = read_stream_header(transport, deadline).await?;
        peer_stream = header;
        peer_payload = payload;
        if !handshaker.handle_handshake(&peer_payload).await {
            // reject before replying, so the client observes a bare close
            let _ = transport.close(false);
            return Err(HandshakeError::Rejected);
        }
        write_stream_header(transport, &local_stream, &handshaker.emit_handshake())?;
        transport.flush(deadline).await?;
    }

    Ok(negotiate(options, local_id, &peer_transport, &peer_stream))
}

fn write_transport_header<C: Conn>(
    transport: &mut Transport<C>,
    header: &TransportHandshakeHeader,
) -> Result<(), TransportError> {
    transport.write(|out| {
        let mut buf = Vec::with_capacity(32);
        header.encode(&mut buf);
        out.write_bytes(&buf);
        Ok(())
    })
}

async fn read_transport_header<C: Conn>(
    transport: &mut Transport<C>,
    deadline: Option<Instant>,
) -> Result<TransportHandshakeHeader, HandshakeError> {
    let payload = transport.peek(deadline).await?;
    let len = payload.len();
    let header =
        TransportHandshakeHeader::decode(payload).map_err(|_| HandshakeError::Protocol)?;
    transport.skip(len);
    Ok(header)
}

fn write_stream_header<C: Conn>(
    transport: &mut Transport<C>,
    header: &StreamHandshakeHeader,
    handshake_payload: &[u8],
) -> Result<(), TransportError> {
    transport.write(|out| {
        let mut buf = Vec::with_capacity(32 + handshake_payload.len());
        wire::encode_submessage(|b| header.encode(b), &mut buf);
        buf.extend_from_slice(handshake_payload);
        out.write_bytes(&buf);
        Ok(())
    })
}

async fn read_stream_header<C: Conn>(
    transport: &mut Transport<C>,
    deadline: Option<Instant>,
) -> Result<(StreamHandshakeHeader, Vec<u8>), HandshakeError> {
    let payload = transport.peek(deadline).await?;
    let len = payload.len();
    let mut buf = payload;
    let header = wire::decode_submessage(&mut buf)
        .and_then(StreamHandshakeHeader::decode)
        .map_err(|_| HandshakeError::Protocol)?;
    let handshake_payload = buf.to_vec();
    transport.skip(len);
    Ok((header, handshake_payload))
}
