//! The unit the stream moves: one typed event per packet, plus the filter
//! hook that runs between parse and dispatch.

use crate::wire::{
    self, EventType, HangupBody, PacketHeader, RequestHeader, ResponseHeader, WireError,
};
use std::sync::Arc;

/// Which way an event is moving through the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    Incoming,
    Outgoing,
}

/// What the filter chain decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Proceed,
    /// Short-circuit an incoming request: answer with `payload` directly,
    /// skipping admission and handler dispatch.
    DirectResponse,
}

/// A parsed event. Filters may mutate headers and payload in place.
pub struct Event {
    pub event_type: EventType,
    pub request_header: Option<RequestHeader>,
    pub response_header: Option<ResponseHeader>,
    pub hangup: Option<HangupBody>,
    pub payload: Vec<u8>,
    pub action: EventAction,
}

/// Runs between parse and dispatch, in registration order.
pub type EventFilter = Arc<dyn Fn(&mut Event) + Send + Sync>;

impl Event {
    pub fn keepalive() -> Self {
        Self {
            event_type: EventType::Keepalive,
            request_header: None,
            response_header: None,
            hangup: None,
            payload: Vec::new(),
            action: EventAction::Proceed,
        }
    }

    pub fn request(header: RequestHeader, payload: Vec<u8>) -> Self {
        Self {
            event_type: EventType::Request,
            request_header: Some(header),
            response_header: None,
            hangup: None,
            payload,
            action: EventAction::Proceed,
        }
    }

    pub fn response(header: ResponseHeader, payload: Vec<u8>) -> Self {
        Self {
            event_type: EventType::Response,
            request_header: None,
            response_header: Some(header),
            hangup: None,
            payload,
            action: EventAction::Proceed,
        }
    }

    pub fn hangup(body: HangupBody) -> Self {
        Self {
            event_type: EventType::Hangup,
            request_header: None,
            response_header: None,
            hangup: Some(body),
            payload: Vec::new(),
            action: EventAction::Proceed,
        }
    }
}

/// Parses one packet payload into an owned event.
pub(crate) fn parse_event(payload: &[u8]) -> Result<Event, WireError> {
    let mut buf = payload;
    let packet_header = PacketHeader::decode(wire::decode_submessage(&mut buf)?)?;
    match packet_header.event_type {
        EventType::Keepalive => Ok(Event::keepalive()),
        EventType::Request => {
            let header = RequestHeader::decode(wire::decode_submessage(&mut buf)?)?;
            Ok(Event::request(header, buf.to_vec()))
        }
        EventType::Response => {
            let header = ResponseHeader::decode(wire::decode_submessage(&mut buf)?)?;
            Ok(Event::response(header, buf.to_vec()))
        }
        EventType::Hangup => {
            let body = HangupBody::decode(wire::decode_submessage(&mut buf)?)?;
            Ok(Event::hangup(body))
        }
    }
}

/// Assembles a packet payload: packet header, optional event header, body.
pub(crate) fn encode_event_frame(
    event_type: EventType,
    header: Option<&dyn Fn(&mut Vec<u8>)>,
    out: &mut Vec<u8>,
) {
    wire::encode_submessage(|b| PacketHeader { event_type }.encode(b), out);
    if let Some(fill) = header {
        wire::encode_submessage(fill, out);
    }
}
