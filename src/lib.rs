//! # tandem-rpc
//!
//! A bidirectional RPC runtime: both peers on a connection can register
//! services and call the other side, over a single multiplexed stream.
//!
//! ## Layers
//!
//! - [transport]: packet framing on a duplex byte stream, with bounded
//!   buffering and batched receive.
//! - [stream]: the event protocol on top of one connection: two-phase
//!   handshake, concurrency credits in both directions, keepalive, graceful
//!   hangup, event filters.
//! - [channel]: the long-lived logical connection: call correlation and
//!   deadlines, interceptor pipelines, client-side reconnection through a
//!   rotating [address_pool], lifecycle listeners.
//!
//! Payload bodies are opaque: bring any codec by implementing [Message] and
//! registering per-method factories. Connections are pluggable through the
//! [net] traits; TCP ships in-crate.
//!
//! ## Usage sketch
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_rpc::{
//!     CallOptions, ChannelOptions, ClientChannel, ClientChannelOptions, RawMessage, Reply,
//!     new_raw_message,
//! };
//! use tandem_rpc::net::TcpConnector;
//!
//! # async fn example() {
//! let mut options = ChannelOptions::default();
//! options.build_method("echo", "upper").set_request_factory(new_raw_message()).set_handler(
//!     Arc::new(|rpc| {
//!         Box::pin(async move {
//!             let text = format!("{:?}", rpc.request);
//!             Ok(Reply::new(Box::new(RawMessage::from_str(&text.to_uppercase()))))
//!         })
//!     }),
//! );
//!
//! let client = ClientChannel::new(
//!     ClientChannelOptions { channel: options, ..Default::default() },
//!     TcpConnector,
//!     &["127.0.0.1:8432".to_string()],
//! );
//! // drive the dialing loop from its own task, then call
//! let reply = client
//!     .call(
//!         CallOptions::new("echo", "upper"),
//!         Box::new(RawMessage::from_str("hi")),
//!         new_raw_message(),
//!     )
//!     .await;
//! # let _ = reply;
//! # }
//! ```

#[macro_use]
extern crate captains_log;

pub mod address_pool;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod net;
pub mod stream;
pub mod transport;
pub mod wire;

pub use address_pool::AddressPool;
pub use channel::{
    CallOptions, CallVars, Channel, ChannelEvent, ChannelListener, ChannelOptions, ChannelState,
    ClientChannel, ClientChannelOptions, IncomingInterceptor, IncomingNext, OutgoingInterceptor,
    OutgoingNext, Reply, Rpc, ServiceHandler,
};
pub use config::{StreamOptions, TransportOptions};
pub use error::{
    CallError, ChannelError, HangupCode, HangupError, RpcError, RpcErrorType, TransportError,
};
pub use message::{new_null_message, new_raw_message, Message, MessageFactory, NullMessage, RawMessage};
pub use stream::{DefaultHandshaker, Event, EventAction, EventDirection, EventFilter, Handshaker};
pub use wire::{EventType, ExtraData};
