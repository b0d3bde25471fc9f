//! Options for the transport, stream and channel layers.
//!
//! Every options struct has a `Default` and a `normalize()` that clamps
//! out-of-range values instead of failing.

use crate::stream::{EventDirection, EventFilter};
use crate::wire::EventType;
use std::time::Duration;

pub const PACKET_HEADER_SIZE: usize = 4;

pub const DEFAULT_INITIAL_READ_BUFFER_SIZE: usize = 1 << 12;
pub const MIN_INITIAL_READ_BUFFER_SIZE: usize = 1 << 8;
pub const MAX_INITIAL_READ_BUFFER_SIZE: usize = 1 << 16;
pub const MIN_MAX_PACKET_PAYLOAD_SIZE: usize = 1 << 16;

#[derive(Clone)]
pub struct TransportOptions {
    /// Initial read buffer size, clamped to
    /// [[MIN_INITIAL_READ_BUFFER_SIZE], [MAX_INITIAL_READ_BUFFER_SIZE]].
    /// The buffer grows to fit the largest observed packet.
    pub initial_read_buffer_size: usize,
    /// Upper bound on one packet payload, at least
    /// [MIN_MAX_PACKET_PAYLOAD_SIZE]. Advertised to the peer during
    /// handshake; the effective outgoing bound is the min-of-maxes.
    pub max_packet_payload_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            initial_read_buffer_size: DEFAULT_INITIAL_READ_BUFFER_SIZE,
            max_packet_payload_size: MIN_MAX_PACKET_PAYLOAD_SIZE,
        }
    }
}

impl TransportOptions {
    pub fn normalize(mut self) -> Self {
        if self.initial_read_buffer_size == 0 {
            self.initial_read_buffer_size = DEFAULT_INITIAL_READ_BUFFER_SIZE;
        } else {
            self.initial_read_buffer_size = self
                .initial_read_buffer_size
                .clamp(MIN_INITIAL_READ_BUFFER_SIZE, MAX_INITIAL_READ_BUFFER_SIZE);
        }
        if self.max_packet_payload_size < MIN_MAX_PACKET_PAYLOAD_SIZE {
            self.max_packet_payload_size = MIN_MAX_PACKET_PAYLOAD_SIZE;
        }
        self
    }
}

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 100;
pub const MAX_CONCURRENCY_LIMIT: usize = 1 << 20;

#[derive(Clone)]
pub struct StreamOptions {
    pub transport: TransportOptions,
    /// The slowest keepalive cadence this side is willing to receive at.
    pub incoming_keepalive_interval: Duration,
    /// How often this side offers to emit keepalives when idle.
    pub outgoing_keepalive_interval: Duration,
    /// How many requests this side will run concurrently.
    pub incoming_concurrency_limit: usize,
    /// How many requests this side wants in flight at once.
    pub outgoing_concurrency_limit: usize,
    /// Bound on the handshake exchange.
    pub handshake_timeout: Duration,
    /// Bound on one socket flush.
    pub write_timeout: Duration,
    pub(crate) filters: Vec<(EventDirection, EventType, EventFilter)>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            incoming_keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            outgoing_keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            incoming_concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            outgoing_concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            filters: Vec::new(),
        }
    }
}

impl StreamOptions {
    pub fn normalize(mut self) -> Self {
        self.transport = self.transport.normalize();
        if self.incoming_keepalive_interval < MIN_KEEPALIVE_INTERVAL {
            self.incoming_keepalive_interval = DEFAULT_KEEPALIVE_INTERVAL;
        }
        if self.outgoing_keepalive_interval < MIN_KEEPALIVE_INTERVAL {
            self.outgoing_keepalive_interval = DEFAULT_KEEPALIVE_INTERVAL;
        }
        if self.incoming_concurrency_limit == 0 {
            self.incoming_concurrency_limit = DEFAULT_CONCURRENCY_LIMIT;
        }
        self.incoming_concurrency_limit =
            self.incoming_concurrency_limit.min(MAX_CONCURRENCY_LIMIT);
        if self.outgoing_concurrency_limit == 0 {
            self.outgoing_concurrency_limit = DEFAULT_CONCURRENCY_LIMIT;
        }
        self.outgoing_concurrency_limit =
            self.outgoing_concurrency_limit.min(MAX_CONCURRENCY_LIMIT);
        if self.write_timeout < Duration::from_millis(100) {
            self.write_timeout = Duration::from_secs(5);
        }
        self
    }

    /// Registers an event filter, run between parse and dispatch in
    /// registration order.
    pub fn add_event_filter(
        mut self,
        direction: EventDirection,
        event_type: EventType,
        filter: EventFilter,
    ) -> Self {
        self.filters.push((direction, event_type, filter));
        self
    }
}
