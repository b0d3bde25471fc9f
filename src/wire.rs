//! Protocol-buffer shaped wire schema.
//!
//! This implements just enough of the protobuf wire format to encode and
//! decode the fixed header messages, without pulling a code generator into
//! the build. Bodies stay opaque.
//!
//! Packet payload layout (protobuf messages are not self-delimiting, so
//! every message sharing a packet is written as a varint-length-prefixed
//! submessage):
//!
//! - transport handshake packet: `TransportHandshakeHeader` alone
//! - stream handshake packet: `len | StreamHandshakeHeader | payload...`
//! - event packet: `len | PacketHeader | len | event header | payload...`
//!   (keepalive carries the packet header only)

use rustc_hash::FxHashMap;
use uuid::Uuid;

/// Per-call metadata carried next to request and response bodies.
pub type ExtraData = FxHashMap<String, Vec<u8>>;

/// Wire type for varint fields.
const WIRE_TYPE_VARINT: u8 = 0;
/// Wire type for length-delimited fields.
const WIRE_TYPE_LEN: u8 = 2;

/// A malformed header message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireError;

pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn decode_varint(buf: &mut &[u8]) -> Result<u64, WireError> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        if buf.is_empty() {
            return Err(WireError);
        }
        let byte = buf[0];
        *buf = &buf[1..];

        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(WireError);
        }
    }
}

fn encode_tag(field_number: u32, wire_type: u8, buf: &mut Vec<u8>) {
    encode_varint(((field_number as u64) << 3) | (wire_type as u64), buf);
}

fn decode_tag(buf: &mut &[u8]) -> Result<(u32, u8), WireError> {
    let tag = decode_varint(buf)?;
    Ok(((tag >> 3) as u32, (tag & 0x07) as u8))
}

fn encode_bytes(field_number: u32, data: &[u8], buf: &mut Vec<u8>) {
    encode_tag(field_number, WIRE_TYPE_LEN, buf);
    encode_varint(data.len() as u64, buf);
    buf.extend_from_slice(data);
}

fn encode_string(field_number: u32, s: &str, buf: &mut Vec<u8>) {
    encode_bytes(field_number, s.as_bytes(), buf);
}

fn encode_uint64(field_number: u32, value: u64, buf: &mut Vec<u8>) {
    encode_tag(field_number, WIRE_TYPE_VARINT, buf);
    encode_varint(value, buf);
}

fn decode_length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    let len = decode_varint(buf)? as usize;
    if buf.len() < len {
        return Err(WireError);
    }
    let data = &buf[..len];
    *buf = &buf[len..];
    Ok(data)
}

fn skip_field(wire_type: u8, buf: &mut &[u8]) -> Result<(), WireError> {
    match wire_type {
        WIRE_TYPE_VARINT => {
            decode_varint(buf)?;
        }
        WIRE_TYPE_LEN => {
            decode_length_delimited(buf)?;
        }
        1 => {
            if buf.len() < 8 {
                return Err(WireError);
            }
            *buf = &buf[8..];
        }
        5 => {
            if buf.len() < 4 {
                return Err(WireError);
            }
            *buf = &buf[4..];
        }
        _ => return Err(WireError),
    }
    Ok(())
}

/// Writes the bytes produced by `fill` as a varint-length-prefixed submessage.
pub fn encode_submessage<F: FnOnce(&mut Vec<u8>)>(fill: F, buf: &mut Vec<u8>) {
    let mut tmp = Vec::with_capacity(64);
    fill(&mut tmp);
    encode_varint(tmp.len() as u64, buf);
    buf.extend_from_slice(&tmp);
}

/// Reads one varint-length-prefixed submessage, advancing `buf` past it.
pub fn decode_submessage<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    decode_length_delimited(buf)
}

fn encode_extra_data(field_number: u32, extra: &ExtraData, buf: &mut Vec<u8>) {
    for (key, value) in extra.iter() {
        let mut entry = Vec::with_capacity(key.len() + value.len() + 4);
        encode_string(1, key, &mut entry);
        encode_bytes(2, value, &mut entry);
        encode_bytes(field_number, &entry, buf);
    }
}

fn decode_extra_entry(data: &[u8], extra: &mut ExtraData) -> Result<(), WireError> {
    let mut buf = data;
    let mut key = String::new();
    let mut value = Vec::new();
    while !buf.is_empty() {
        let (field, wire_type) = decode_tag(&mut buf)?;
        match field {
            1 => {
                let k = decode_length_delimited(&mut buf)?;
                key = str::from_utf8(k).map_err(|_| WireError)?.to_string();
            }
            2 => {
                value = decode_length_delimited(&mut buf)?.to_vec();
            }
            _ => skip_field(wire_type, &mut buf)?,
        }
    }
    extra.insert(key, value);
    Ok(())
}

fn encode_uuid(field_number: u32, id: &Uuid, buf: &mut Vec<u8>) {
    encode_bytes(field_number, id.as_bytes(), buf);
}

fn decode_uuid(data: &[u8]) -> Result<Uuid, WireError> {
    Uuid::from_slice(data).map_err(|_| WireError)
}

/// The kind of event one packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Keepalive = 0,
    Request = 1,
    Response = 2,
    Hangup = 3,
}

impl EventType {
    pub fn from_u64(value: u64) -> Result<Self, WireError> {
        match value {
            0 => Ok(EventType::Keepalive),
            1 => Ok(EventType::Request),
            2 => Ok(EventType::Response),
            3 => Ok(EventType::Hangup),
            _ => Err(WireError),
        }
    }
}

/// `PacketHeader { event_type }`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketHeader {
    pub event_type: EventType,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if self.event_type != EventType::Keepalive {
            encode_uint64(1, self.event_type as u64, buf);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let mut event_type = EventType::Keepalive;
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => event_type = EventType::from_u64(decode_varint(&mut buf)?)?,
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Ok(Self { event_type })
    }
}

/// First handshake exchange: identity plus packet-size advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportHandshakeHeader {
    pub id: Uuid,
    pub max_incoming_packet_size: i32,
    pub max_outgoing_packet_size: i32,
}

impl TransportHandshakeHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        encode_uuid(1, &self.id, buf);
        encode_uint64(2, self.max_incoming_packet_size as u64, buf);
        encode_uint64(3, self.max_outgoing_packet_size as u64, buf);
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let mut id = Uuid::nil();
        let mut max_incoming = 0i32;
        let mut max_outgoing = 0i32;
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => id = decode_uuid(decode_length_delimited(&mut buf)?)?,
                2 => max_incoming = decode_varint(&mut buf)? as i32,
                3 => max_outgoing = decode_varint(&mut buf)? as i32,
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Ok(Self {
            id,
            max_incoming_packet_size: max_incoming,
            max_outgoing_packet_size: max_outgoing,
        })
    }
}

/// Second handshake exchange: keepalive and concurrency negotiation.
///
/// Intervals travel as varint nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamHandshakeHeader {
    pub incoming_keepalive_interval_ns: u64,
    pub outgoing_keepalive_interval_ns: u64,
    pub incoming_concurrency_limit: i32,
    pub outgoing_concurrency_limit: i32,
}

impl StreamHandshakeHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        encode_uint64(1, self.incoming_keepalive_interval_ns, buf);
        encode_uint64(2, self.outgoing_keepalive_interval_ns, buf);
        encode_uint64(3, self.incoming_concurrency_limit as u64, buf);
        encode_uint64(4, self.outgoing_concurrency_limit as u64, buf);
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let mut header = Self {
            incoming_keepalive_interval_ns: 0,
            outgoing_keepalive_interval_ns: 0,
            incoming_concurrency_limit: 0,
            outgoing_concurrency_limit: 0,
        };
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => header.incoming_keepalive_interval_ns = decode_varint(&mut buf)?,
                2 => header.outgoing_keepalive_interval_ns = decode_varint(&mut buf)?,
                3 => header.incoming_concurrency_limit = decode_varint(&mut buf)? as i32,
                4 => header.outgoing_concurrency_limit = decode_varint(&mut buf)? as i32,
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Ok(header)
    }
}

/// `RequestHeader`: one per request event, ahead of the opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    pub sequence_number: i32,
    pub service_name: String,
    pub method_name: String,
    pub extra_data: ExtraData,
    /// Absolute deadline in unix nanoseconds, 0 when unset.
    pub deadline: i64,
    pub trace_id: Uuid,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        encode_uint64(1, self.sequence_number as u64, buf);
        if !self.service_name.is_empty() {
            encode_string(2, &self.service_name, buf);
        }
        if !self.method_name.is_empty() {
            encode_string(3, &self.method_name, buf);
        }
        encode_extra_data(4, &self.extra_data, buf);
        if self.deadline != 0 {
            encode_uint64(5, self.deadline as u64, buf);
        }
        encode_uuid(6, &self.trace_id, buf);
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let mut header = Self {
            sequence_number: 0,
            service_name: String::new(),
            method_name: String::new(),
            extra_data: ExtraData::default(),
            deadline: 0,
            trace_id: Uuid::nil(),
        };
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => header.sequence_number = decode_varint(&mut buf)? as i32,
                2 => {
                    let s = decode_length_delimited(&mut buf)?;
                    header.service_name = str::from_utf8(s).map_err(|_| WireError)?.to_string();
                }
                3 => {
                    let s = decode_length_delimited(&mut buf)?;
                    header.method_name = str::from_utf8(s).map_err(|_| WireError)?.to_string();
                }
                4 => {
                    let entry = decode_length_delimited(&mut buf)?;
                    decode_extra_entry(entry, &mut header.extra_data)?;
                }
                5 => header.deadline = decode_varint(&mut buf)? as i64,
                6 => header.trace_id = decode_uuid(decode_length_delimited(&mut buf)?)?,
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Ok(header)
    }
}

/// The error triple carried inside a response header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RpcErrorBody {
    pub error_type: i32,
    pub code: String,
    pub desc: String,
}

impl RpcErrorBody {
    fn encode(&self, buf: &mut Vec<u8>) {
        if self.error_type != 0 {
            encode_uint64(1, self.error_type as u64, buf);
        }
        if !self.code.is_empty() {
            encode_string(2, &self.code, buf);
        }
        if !self.desc.is_empty() {
            encode_string(3, &self.desc, buf);
        }
    }

    fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let mut body = Self::default();
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => body.error_type = decode_varint(&mut buf)? as i32,
                2 => {
                    let s = decode_length_delimited(&mut buf)?;
                    body.code = str::from_utf8(s).map_err(|_| WireError)?.to_string();
                }
                3 => {
                    let s = decode_length_delimited(&mut buf)?;
                    body.desc = str::from_utf8(s).map_err(|_| WireError)?.to_string();
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Ok(body)
    }
}

/// `ResponseHeader`: one per response event; the body is absent on error.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeader {
    pub sequence_number: i32,
    pub extra_data: ExtraData,
    pub rpc_error: Option<RpcErrorBody>,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        encode_uint64(1, self.sequence_number as u64, buf);
        encode_extra_data(2, &self.extra_data, buf);
        if let Some(err) = self.rpc_error.as_ref() {
            let mut tmp = Vec::with_capacity(err.code.len() + err.desc.len() + 8);
            err.encode(&mut tmp);
            encode_bytes(3, &tmp, buf);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let mut header =
            Self { sequence_number: 0, extra_data: ExtraData::default(), rpc_error: None };
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => header.sequence_number = decode_varint(&mut buf)? as i32,
                2 => {
                    let entry = decode_length_delimited(&mut buf)?;
                    decode_extra_entry(entry, &mut header.extra_data)?;
                }
                3 => {
                    let body = decode_length_delimited(&mut buf)?;
                    header.rpc_error = Some(RpcErrorBody::decode(body)?);
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Ok(header)
    }
}

/// `Hangup { code, extra_data }`: graceful protocol-level termination.
#[derive(Debug, Clone, PartialEq)]
pub struct HangupBody {
    pub code: i32,
    pub extra_data: ExtraData,
}

impl HangupBody {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if self.code != 0 {
            encode_uint64(1, self.code as u64, buf);
        }
        encode_extra_data(2, &self.extra_data, buf);
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let mut body = Self { code: 0, extra_data: ExtraData::default() };
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => body.code = decode_varint(&mut buf)? as i32,
                2 => {
                    let entry = decode_length_delimited(&mut buf)?;
                    decode_extra_entry(entry, &mut body.extra_data)?;
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(v, &mut buf);
            let mut slice = &buf[..];
            assert_eq!(decode_varint(&mut slice).expect("varint"), v);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut slice: &[u8] = &[0x80];
        assert!(decode_varint(&mut slice).is_err());
    }

    #[test]
    fn test_request_header_round_trip() {
        let mut extra = ExtraData::default();
        extra.insert("k".to_string(), b"v1".to_vec());
        extra.insert("other".to_string(), vec![0, 1, 2]);
        let header = RequestHeader {
            sequence_number: 42,
            service_name: "service1".to_string(),
            method_name: "method1".to_string(),
            extra_data: extra,
            deadline: 1_700_000_000_000_000_000,
            trace_id: Uuid::new_v4(),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(RequestHeader::decode(&buf).expect("decode"), header);
    }

    #[test]
    fn test_response_header_round_trip() {
        let header = ResponseHeader {
            sequence_number: 7,
            extra_data: ExtraData::default(),
            rpc_error: Some(RpcErrorBody {
                error_type: 404,
                code: "method_not_found".to_string(),
                desc: "no such method".to_string(),
            }),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(ResponseHeader::decode(&buf).expect("decode"), header);
    }

    #[test]
    fn test_handshake_headers_round_trip() {
        let th = TransportHandshakeHeader {
            id: Uuid::new_v4(),
            max_incoming_packet_size: 1 << 20,
            max_outgoing_packet_size: 1 << 16,
        };
        let mut buf = Vec::new();
        th.encode(&mut buf);
        assert_eq!(TransportHandshakeHeader::decode(&buf).expect("decode"), th);

        let sh = StreamHandshakeHeader {
            incoming_keepalive_interval_ns: 5_000_000_000,
            outgoing_keepalive_interval_ns: 10_000_000_000,
            incoming_concurrency_limit: 100,
            outgoing_concurrency_limit: 200,
        };
        let mut buf = Vec::new();
        sh.encode(&mut buf);
        assert_eq!(StreamHandshakeHeader::decode(&buf).expect("decode"), sh);
    }

    #[test]
    fn test_packet_header_keepalive_is_empty() {
        let mut buf = Vec::new();
        PacketHeader { event_type: EventType::Keepalive }.encode(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(PacketHeader::decode(&buf).expect("decode").event_type, EventType::Keepalive);
    }

    #[test]
    fn test_hangup_round_trip() {
        let mut extra = ExtraData::default();
        extra.insert("reason".to_string(), b"shutdown".to_vec());
        let body = HangupBody { code: 2, extra_data: extra };
        let mut buf = Vec::new();
        body.encode(&mut buf);
        assert_eq!(HangupBody::decode(&buf).expect("decode"), body);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut buf = Vec::new();
        encode_uint64(1, 9, &mut buf);
        encode_uint64(15, 1234, &mut buf);
        encode_bytes(14, b"future", &mut buf);
        let header = ResponseHeader::decode(&buf).expect("decode");
        assert_eq!(header.sequence_number, 9);
        assert!(header.rpc_error.is_none());
    }
}
