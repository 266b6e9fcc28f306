use std::fmt::Debug;
use std::io;
use std::io::IoSlice;
use std::net::Shutdown;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::SockRef;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A connected stream socket in non-blocking mode. All operations return immediately, reporting
///  `io::ErrorKind::WouldBlock` if they can make no progress.
#[async_trait]
pub trait ChannelSocket: Send + Sync + Debug {
    /// Returns 0 at end of stream
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// A gathering send. Returns the number of bytes written, which may be less than requested.
    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Waits until the socket may be ready for the given kind of operation. This is for
    ///  blocking mode, and it may return spuriously.
    async fn wait_ready(&self, interest: Interest) -> io::Result<()>;

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()>;
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()>;

    fn shutdown(&self) -> io::Result<()>;
}

#[derive(Debug)]
pub struct TcpChannelSocket {
    stream: TcpStream,
}

impl TcpChannelSocket {
    pub fn new(stream: TcpStream) -> TcpChannelSocket {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("error setting TCP_NODELAY: {}", e);
        }
        TcpChannelSocket { stream }
    }
}

#[async_trait]
impl ChannelSocket for TcpChannelSocket {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    async fn wait_ready(&self, interest: Interest) -> io::Result<()> {
        self.stream.ready(interest).await?;
        Ok(())
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        SockRef::from(&self.stream).set_send_buffer_size(size)
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        SockRef::from(&self.stream).set_recv_buffer_size(size)
    }

    fn shutdown(&self) -> io::Result<()> {
        SockRef::from(&self.stream).shutdown(Shutdown::Both)
    }
}

/// A connection that is being established. The result is picked up without blocking by
///  [PendingConnect::try_complete].
pub struct PendingConnect {
    receiver: oneshot::Receiver<io::Result<Box<dyn ChannelSocket>>>,
}

impl PendingConnect {
    pub fn new(receiver: oneshot::Receiver<io::Result<Box<dyn ChannelSocket>>>) -> PendingConnect {
        PendingConnect { receiver }
    }

    /// A connect attempt that has completed already
    pub fn ready(result: io::Result<Box<dyn ChannelSocket>>) -> PendingConnect {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        PendingConnect { receiver }
    }

    /// Returns `None` while the connection is still being established
    pub fn try_complete(&mut self) -> Option<io::Result<Box<dyn ChannelSocket>>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(io::Error::new(io::ErrorKind::Other, "connect attempt was abandoned"))),
        }
    }
}

/// Opens connections for client channels: initially, and again when the handshake falls back to
///  an older protocol version or the proxy asks for a new connection
#[cfg_attr(test, automock)]
pub trait SocketConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> PendingConnect;
}

/// Connects through tokio. This requires a tokio runtime to be running.
pub struct TcpConnector {}

impl TcpConnector {
    pub fn new() -> TcpConnector {
        TcpConnector {}
    }
}

impl SocketConnector for TcpConnector {
    fn connect(&self, host: &str, port: u16) -> PendingConnect {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => return PendingConnect::ready(Err(io::Error::new(io::ErrorKind::Other, e))),
        };

        let (sender, receiver) = oneshot::channel();
        let host = host.to_string();
        handle.spawn(async move {
            debug!("connecting to {}:{}", host, port);
            let result = TcpStream::connect((host.as_str(), port)).await
                .map(|stream| Box::new(TcpChannelSocket::new(stream)) as Box<dyn ChannelSocket>);
            if let Err(e) = &result {
                debug!("connecting to {}:{} failed: {}", host, port, e);
            }
            let _ = sender.send(result);
        });
        PendingConnect::new(receiver)
    }
}
