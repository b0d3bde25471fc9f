//! Error taxonomy for the transport, stream and channel layers.
//!
//! Kinds:
//!
//! - [TransportError]: framing-level failures, local to one connection attempt.
//! - [HangupError]: protocol-level termination carrying a reason code; always
//!   fatal to the current stream.
//! - [RpcError]: per-call application error carried in the response header;
//!   the channel stays healthy.
//! - [CallError]: what a caller sees. `Broken` and `Closed` have stable
//!   string identities so callers can tell retry-worthy failures from
//!   terminal ones.

use crate::wire::{ExtraData, RpcErrorBody};
use std::fmt;
use std::io;

/// Framing-level failure on one connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("packet payload too large")]
    PayloadTooLarge,
    #[error("transport i/o timeout")]
    Timeout,
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    #[inline]
    pub(crate) fn from_io(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            TransportError::Timeout
        } else {
            TransportError::Io(e)
        }
    }
}

/// Numeric RPC error types, following HTTP-status conventions.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
)]
#[repr(i32)]
pub enum RpcErrorType {
    #[strum(serialize = "none")]
    None = 0,
    #[strum(serialize = "bad_request")]
    BadRequest = 400,
    #[strum(serialize = "unauthorized")]
    Unauthorized = 401,
    #[strum(serialize = "forbidden")]
    Forbidden = 403,
    #[strum(serialize = "not_found")]
    NotFound = 404,
    #[strum(serialize = "too_many_requests")]
    TooManyRequests = 429,
    #[strum(serialize = "internal_server")]
    InternalServer = 500,
    #[strum(serialize = "not_implemented")]
    NotImplemented = 501,
    #[strum(serialize = "bad_gateway")]
    BadGateway = 502,
    #[strum(serialize = "service_unavailable")]
    ServiceUnavailable = 503,
    #[strum(serialize = "gateway_timeout")]
    GatewayTimeout = 504,
}

impl RpcErrorType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            400 => Some(Self::BadRequest),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            429 => Some(Self::TooManyRequests),
            500 => Some(Self::InternalServer),
            501 => Some(Self::NotImplemented),
            502 => Some(Self::BadGateway),
            503 => Some(Self::ServiceUnavailable),
            504 => Some(Self::GatewayTimeout),
            _ => None,
        }
    }
}

/// Application-level error carried in a response header.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rpc error {error_type}: {code}: {desc}")]
pub struct RpcError {
    pub error_type: RpcErrorType,
    /// Application-defined subcategory.
    pub code: String,
    /// Human-readable description.
    pub desc: String,
}

impl RpcError {
    pub fn new(error_type: RpcErrorType, code: &str, desc: &str) -> Self {
        Self { error_type, code: code.to_string(), desc: desc.to_string() }
    }

    pub(crate) fn to_body(&self) -> RpcErrorBody {
        RpcErrorBody {
            error_type: self.error_type as i32,
            code: self.code.clone(),
            desc: self.desc.clone(),
        }
    }

    pub(crate) fn from_body(body: RpcErrorBody) -> Self {
        Self {
            error_type: RpcErrorType::from_i32(body.error_type)
                .unwrap_or(RpcErrorType::InternalServer),
            code: body.code,
            desc: body.desc,
        }
    }
}

/// Reason codes for protocol-level termination.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
)]
#[repr(i32)]
pub enum HangupCode {
    #[strum(serialize = "aborted")]
    Aborted = 0,
    #[strum(serialize = "bad_incoming_packet")]
    BadIncomingPacket = 1,
    #[strum(serialize = "too_many_incoming_requests")]
    TooManyIncomingRequests = 2,
    #[strum(serialize = "outgoing_packet_too_large")]
    OutgoingPacketTooLarge = 3,
    #[strum(serialize = "system")]
    System = 4,
}

impl HangupCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Aborted),
            1 => Some(Self::BadIncomingPacket),
            2 => Some(Self::TooManyIncomingRequests),
            3 => Some(Self::OutgoingPacketTooLarge),
            4 => Some(Self::System),
            _ => None,
        }
    }
}

/// A stream terminated by a hangup event.
///
/// `passive` distinguishes the peer hanging up on us from us hanging up on
/// the peer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct HangupError {
    pub code: HangupCode,
    pub passive: bool,
    pub extra_data: ExtraData,
}

impl fmt::Display for HangupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "hangup: {} ({})",
            self.code,
            if self.passive { "passive" } else { "active" }
        )
    }
}

/// What a method caller observes.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The stream failed unexpectedly; retry-eligible on client channels.
    #[error("channel: broken")]
    Broken,
    /// The channel was deliberately closed, locally or by handshake failure.
    #[error("channel: closed")]
    Closed,
    /// The caller's deadline elapsed before a response arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The request could not fit in one packet.
    #[error("packet payload too large")]
    PayloadTooLarge,
    /// The response body could not be decoded.
    #[error("bad response body")]
    BadResponse,
    #[error(transparent)]
    Rpc(RpcError),
    #[error(transparent)]
    Hangup(HangupError),
}

/// What drives a channel's run loop out.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel: broken")]
    Broken(#[source] io::Error),
    #[error("channel: closed")]
    Closed,
    #[error("handshake rejected")]
    HandshakeRejected,
    #[error("bad handshake packet")]
    BadHandshake,
    #[error("hangup: {0}")]
    Hangup(HangupError),
    #[error("connect: {0}")]
    Connect(#[source] io::Error),
}

/// Retryable dial/dispatch failures: clean EOF plus the transient network
/// error kinds. Everything else breaks the dial loop.
pub(crate) fn is_retryable_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}
