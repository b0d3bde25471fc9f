//! Packet framing over a duplex byte stream.
//!
//! A packet is a 4-byte big-endian payload length followed by the payload;
//! nothing else. Reads buffer whole packets and hand out borrowed payload
//! slices: `peek` / `peek_batch` followed by `skip` / `skip_batch` is the
//! only way the read cursor advances. Writes reserve the length word, let
//! the caller fill the payload, then back-patch.

use crate::buffer::ByteStream;
use crate::config::{PACKET_HEADER_SIZE, TransportOptions};
use crate::error::TransportError;
use crate::net::Conn;
use std::io;
use std::sync::Arc;
use tokio::time::Instant;

pub struct Transport<C: Conn> {
    reader: TransportReader<C>,
    writer: TransportWriter<C>,
}

impl<C: Conn> Transport<C> {
    pub fn new(conn: C, options: &TransportOptions) -> Self {
        let options = options.clone().normalize();
        let conn = Arc::new(conn);
        Self {
            reader: TransportReader {
                conn: conn.clone(),
                input: ByteStream::with_capacity(options.initial_read_buffer_size),
                max_incoming_payload: options.max_packet_payload_size,
                closed: false,
            },
            writer: TransportWriter {
                conn,
                output: ByteStream::with_capacity(options.initial_read_buffer_size),
                max_outgoing_payload: options.max_packet_payload_size,
                closed: false,
            },
        }
    }

    /// Applies the handshake outcome: the outgoing bound becomes the
    /// min-of-maxes while the incoming bound stays this side's own.
    pub fn set_max_outgoing_payload(&mut self, size: usize) {
        self.writer.max_outgoing_payload = size;
    }

    #[inline]
    pub async fn peek(&mut self, deadline: Option<Instant>) -> Result<&[u8], TransportError> {
        self.reader.peek(deadline).await
    }

    #[inline]
    pub fn skip(&mut self, payload_len: usize) {
        self.reader.skip(payload_len)
    }

    #[inline]
    pub fn write<F>(&mut self, fill: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut ByteStream) -> Result<(), TransportError>,
    {
        self.writer.write(fill)
    }

    #[inline]
    pub async fn flush(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.writer.flush(deadline).await
    }

    #[inline]
    pub fn close(&mut self, force: bool) -> Result<(), TransportError> {
        self.reader.closed = true;
        self.writer.close(force)
    }

    /// Hands the two directions to their tasks. They share the connection;
    /// each owns its buffer.
    pub fn split(self) -> (TransportReader<C>, TransportWriter<C>) {
        (self.reader, self.writer)
    }
}

pub struct TransportReader<C: Conn> {
    conn: Arc<C>,
    input: ByteStream,
    max_incoming_payload: usize,
    closed: bool,
}

impl<C: Conn> TransportReader<C> {
    /// Returns the first complete packet's payload, reading from the
    /// connection until one is buffered or the deadline elapses.
    pub async fn peek(&mut self, deadline: Option<Instant>) -> Result<&[u8], TransportError> {
        let payload_len = self.fill_one(deadline).await?;
        Ok(&self.input.data()[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + payload_len])
    }

    /// Returns every complete packet currently buffered, reading at least
    /// one. Packets after the first are drained without further I/O.
    pub async fn peek_batch(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Vec<&[u8]>, TransportError> {
        let first_len = self.fill_one(deadline).await?;
        let mut lens = vec![first_len];
        let mut offset = PACKET_HEADER_SIZE + first_len;
        loop {
            let data = self.input.data();
            if data.len() - offset < PACKET_HEADER_SIZE {
                break;
            }
            let payload_len = read_packet_len(&data[offset..]);
            if payload_len > self.max_incoming_payload
                || data.len() - offset < PACKET_HEADER_SIZE + payload_len
            {
                break;
            }
            lens.push(payload_len);
            offset += PACKET_HEADER_SIZE + payload_len;
        }

        let mut payloads = Vec::with_capacity(lens.len());
        let mut data = self.input.data();
        for len in lens {
            payloads.push(&data[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + len]);
            data = &data[PACKET_HEADER_SIZE + len..];
        }
        Ok(payloads)
    }

    /// Consumes one peeked packet of the given payload length.
    #[inline]
    pub fn skip(&mut self, payload_len: usize) {
        self.input.skip(PACKET_HEADER_SIZE + payload_len);
    }

    /// Consumes a batch of peeked packets.
    pub fn skip_batch(&mut self, payload_lens: &[usize]) {
        let total: usize =
            payload_lens.iter().map(|len| PACKET_HEADER_SIZE + len).sum();
        self.input.skip(total);
    }

    /// Reads until the first packet is complete; returns its payload length.
    async fn fill_one(&mut self, deadline: Option<Instant>) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        while self.input.data_size() < PACKET_HEADER_SIZE {
            self.read_some(deadline).await?;
        }
        let payload_len = read_packet_len(self.input.data());
        if payload_len > self.max_incoming_payload {
            return Err(TransportError::PayloadTooLarge);
        }
        let packet_len = PACKET_HEADER_SIZE + payload_len;
        while self.input.data_size() < packet_len {
            self.read_some(deadline).await?;
        }
        Ok(payload_len)
    }

    async fn read_some(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.input.reserve(1);
        let n = self
            .conn
            .read(self.input.spare_mut(), deadline)
            .await
            .map_err(TransportError::from_io)?;
        if n == 0 {
            return Err(TransportError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        self.input.commit(n);
        Ok(())
    }
}

pub struct TransportWriter<C: Conn> {
    conn: Arc<C>,
    output: ByteStream,
    max_outgoing_payload: usize,
    closed: bool,
}

impl<C: Conn> TransportWriter<C> {
    /// Reserves the length word, lets `fill` append the payload, then
    /// back-patches. Rolls the reservation back if `fill` fails or the
    /// payload exceeds the negotiated bound.
    pub fn write<F>(&mut self, fill: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut ByteStream) -> Result<(), TransportError>,
    {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let start = self.output.data_size();
        self.output.write_bytes(&[0u8; PACKET_HEADER_SIZE]);
        if let Err(e) = fill(&mut self.output) {
            self.output.unwrite(self.output.data_size() - start);
            return Err(e);
        }
        let payload_len = self.output.data_size() - start - PACKET_HEADER_SIZE;
        if payload_len > self.max_outgoing_payload {
            self.output.unwrite(payload_len + PACKET_HEADER_SIZE);
            return Err(TransportError::PayloadTooLarge);
        }
        let data = self.output.data_mut();
        data[start..start + PACKET_HEADER_SIZE]
            .copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(())
    }

    /// Writes out everything buffered. Message-framed connections get the
    /// output in chunks of their frame payload limit; stream sockets get it
    /// whole.
    pub async fn flush(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let chunk = self.conn.frame_payload_limit().unwrap_or(usize::MAX);
        while self.output.data_size() > 0 {
            let take = self.output.data_size().min(chunk);
            let n = self
                .conn
                .write(&self.output.data()[..take], deadline)
                .await
                .map_err(TransportError::from_io)?;
            if n == 0 {
                return Err(TransportError::Io(io::Error::from(io::ErrorKind::WriteZero)));
            }
            self.output.skip(n);
        }
        Ok(())
    }

    #[inline]
    pub fn pending_output(&self) -> usize {
        self.output.data_size()
    }

    /// Idempotence contract: the second close reports `Closed`.
    pub fn close(&mut self, force: bool) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.closed = true;
        self.output.gc();
        self.conn.close(force).map_err(TransportError::Io)
    }
}

#[inline(always)]
fn read_packet_len(data: &[u8]) -> usize {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::Mutex;

    /// A connection that feeds reads from a canned script and records writes.
    struct ScriptedConn {
        rx: Mutex<Vec<u8>>,
        tx: Mutex<Vec<u8>>,
        read_chunk: usize,
    }

    impl ScriptedConn {
        fn new(incoming: Vec<u8>) -> Self {
            Self { rx: Mutex::new(incoming), tx: Mutex::new(Vec::new()), read_chunk: usize::MAX }
        }

        /// Serves reads `chunk` bytes at a time, to exercise partial reads.
        fn chunked(incoming: Vec<u8>, chunk: usize) -> Self {
            Self { rx: Mutex::new(incoming), tx: Mutex::new(Vec::new()), read_chunk: chunk }
        }

        fn written(&self) -> Vec<u8> {
            self.tx.lock().unwrap().clone()
        }
    }

    impl fmt::Debug for ScriptedConn {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "scripted")
        }
    }

    impl Conn for ScriptedConn {
        async fn read(&self, buf: &mut [u8], _deadline: Option<Instant>) -> io::Result<usize> {
            let mut rx = self.rx.lock().unwrap();
            if rx.is_empty() {
                return Ok(0);
            }
            let n = buf.len().min(rx.len()).min(self.read_chunk);
            buf[..n].copy_from_slice(&rx[..n]);
            rx.drain(..n);
            Ok(n)
        }

        async fn write(&self, buf: &[u8], _deadline: Option<Instant>) -> io::Result<usize> {
            self.tx.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn close(&self, _force: bool) -> io::Result<()> {
            Ok(())
        }
    }

    fn packet(payload: &[u8]) -> Vec<u8> {
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_peek_then_skip() {
        let mut incoming = packet(b"hello");
        incoming.extend_from_slice(&packet(b"world"));
        // one byte per read, so peek has to loop
        let mut t =
            Transport::new(ScriptedConn::chunked(incoming, 1), &TransportOptions::default());

        let p = t.peek(None).await.expect("peek");
        assert_eq!(p, b"hello");
        let len = p.len();
        t.skip(len);
        let p = t.peek(None).await.expect("peek");
        assert_eq!(p, b"world");
    }

    #[tokio::test]
    async fn test_peek_batch_drains_buffered() {
        let mut incoming = packet(b"a");
        incoming.extend_from_slice(&packet(b"bb"));
        incoming.extend_from_slice(&packet(b""));
        let (mut reader, _) =
            Transport::new(ScriptedConn::new(incoming), &TransportOptions::default()).split();

        // one read pulls everything in, so the batch sees all three packets
        let batch = reader.peek_batch(None).await.expect("batch");
        let lens: Vec<usize> = batch.iter().map(|p| p.len()).collect();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], b"a");
        assert_eq!(batch[1], b"bb");
        assert_eq!(batch[2], b"");
        drop(batch);
        reader.skip_batch(&lens);

        // nothing left: the next read observes EOF
        assert!(matches!(reader.peek(None).await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversize_incoming_rejected() {
        let opts = TransportOptions::default().normalize();
        let incoming = ((opts.max_packet_payload_size + 1) as u32).to_be_bytes().to_vec();
        let mut t = Transport::new(ScriptedConn::new(incoming), &opts);
        assert!(matches!(t.peek(None).await, Err(TransportError::PayloadTooLarge)));
    }

    #[tokio::test]
    async fn test_write_backpatches_length() {
        let mut t = Transport::new(ScriptedConn::new(Vec::new()), &TransportOptions::default());
        t.write(|out| {
            out.write_bytes(b"payload");
            Ok(())
        })
        .expect("write");
        let (_, mut writer) = t.split();
        writer.flush(None).await.expect("flush");
        assert_eq!(writer.pending_output(), 0);
    }

    #[tokio::test]
    async fn test_write_rollback_on_fill_error() {
        let conn = Arc::new(ScriptedConn::new(Vec::new()));
        let mut writer = TransportWriter {
            conn: conn.clone(),
            output: ByteStream::with_capacity(64),
            max_outgoing_payload: 1 << 16,
            closed: false,
        };
        let r = writer.write(|out| {
            out.write_bytes(b"partial");
            Err(TransportError::PayloadTooLarge)
        });
        assert!(r.is_err());
        assert_eq!(writer.pending_output(), 0);

        writer
            .write(|out| {
                out.write_bytes(b"ok");
                Ok(())
            })
            .expect("write");
        writer.flush(None).await.expect("flush");
        assert_eq!(conn.written(), packet(b"ok"));
    }

    #[tokio::test]
    async fn test_oversize_outgoing_rolled_back() {
        let mut t = Transport::new(
            ScriptedConn::new(Vec::new()),
            &TransportOptions::default(),
        );
        t.set_max_outgoing_payload(4);
        let r = t.write(|out| {
            out.write_bytes(b"too large for four");
            Ok(())
        });
        assert!(matches!(r, Err(TransportError::PayloadTooLarge)));
        // the transport stays usable
        t.write(|out| {
            out.write_bytes(b"ok");
            Ok(())
        })
        .expect("write");
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let mut t = Transport::new(ScriptedConn::new(Vec::new()), &TransportOptions::default());
        t.close(false).expect("close");
        assert!(matches!(t.close(false), Err(TransportError::Closed)));
    }
}
