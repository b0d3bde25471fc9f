//! The duplex byte-stream boundary and its TCP implementation.
//!
//! The core only needs read/write with deadlines on something connection
//! shaped; [Connector] and [Acceptor] are how the embedder hands those in.
//! TCP here rides `tokio::io::unix::AsyncFd` over a nonblocking std socket,
//! so both the reader and the writer task can drive the same connection
//! through `&self`.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::Instant;

/// Runs `f` against an optional absolute deadline, mapping expiry to
/// `TimedOut`.
pub(crate) async fn with_deadline<R, F>(deadline: Option<Instant>, f: F) -> io::Result<R>
where
    F: Future<Output = io::Result<R>>,
{
    match deadline {
        Some(d) => match tokio::time::timeout_at(d, f).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        },
        None => f.await,
    }
}

/// A duplex byte stream with deadline-capable reads and writes.
///
/// All I/O takes `&self` so one connection can serve a reader task and a
/// writer task at once.
pub trait Conn: Send + Sync + fmt::Debug + 'static {
    /// Reads some bytes; `Ok(0)` means the peer closed its write side.
    fn read(
        &self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Writes some bytes.
    fn write(
        &self,
        buf: &[u8],
        deadline: Option<Instant>,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Shuts the connection down. With `force`, linger is zeroed first so the
    /// peer observes a reset once the descriptor drops.
    fn close(&self, force: bool) -> io::Result<()>;

    /// Per-frame payload bound for message-framed transports (WebSocket);
    /// stream sockets report `None` and flush in one write.
    fn frame_payload_limit(&self) -> Option<usize> {
        None
    }
}

/// Opens connections for the client dialing loop.
pub trait Connector: Send + Sync + 'static {
    type Conn: Conn;

    fn connect(
        &self,
        addr: &str,
        deadline: Instant,
    ) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// A TCP connection on a nonblocking std socket driven by readiness.
pub struct TcpConn {
    fd: AsyncFd<std::net::TcpStream>,
}

impl TcpConn {
    pub fn new(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { fd: AsyncFd::with_interest(stream, Interest::READABLE | Interest::WRITABLE)? })
    }
}

impl Conn for TcpConn {
    #[inline]
    async fn read(&self, buf: &mut [u8], deadline: Option<Instant>) -> io::Result<usize> {
        use std::io::Read;
        with_deadline(deadline, self.fd.async_io(Interest::READABLE, |mut s| s.read(buf))).await
    }

    #[inline]
    async fn write(&self, buf: &[u8], deadline: Option<Instant>) -> io::Result<usize> {
        use std::io::Write;
        with_deadline(deadline, self.fd.async_io(Interest::WRITABLE, |mut s| s.write(buf))).await
    }

    fn close(&self, force: bool) -> io::Result<()> {
        if force {
            let _ = nix::sys::socket::setsockopt(
                self.fd.get_ref(),
                nix::sys::socket::sockopt::Linger,
                &libc::linger { l_onoff: 1, l_linger: 0 },
            );
        }
        match self.fd.get_ref().shutdown(Shutdown::Both) {
            // second close observes the first
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            r => r,
        }
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = self.fd.get_ref();
        match (s.local_addr(), s.peer_addr()) {
            (Ok(local), Ok(peer)) => write!(f, "{}->{}", local, peer),
            (Ok(local), Err(_)) => write!(f, "{}", local),
            _ => write!(f, "tcp addr unknown"),
        }
    }
}

/// Dials TCP addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConn;

    async fn connect(&self, addr: &str, deadline: Instant) -> io::Result<TcpConn> {
        let stream =
            with_deadline(Some(deadline), tokio::net::TcpStream::connect(addr)).await?;
        // into_std keeps the socket nonblocking
        TcpConn::new(stream.into_std()?)
    }
}

/// Accepts TCP connections for the server side.
pub struct TcpAcceptor {
    listener: AsyncFd<std::net::TcpListener>,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: AsyncFd::with_interest(listener, Interest::READABLE)?,
            local_addr,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> io::Result<TcpConn> {
        let (stream, _) =
            self.listener.async_io(Interest::READABLE, |l| l.accept()).await?;
        TcpConn::new(stream)
    }
}

impl fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "listener {}", self.local_addr)
    }
}
