//! Network provider abstraction.
//!
//! Sessions never open sockets directly. They go through a
//! [`NetworkProvider`] so tests can substitute their own streams and
//! listeners while production code uses [`TokioNetworkProvider`].

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Provider trait for creating connections and listeners.
///
/// Single-threaded design, no Send bounds.
/// Clone lets the client and server share one provider cheaply.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// The stream type produced by this provider.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// The listener type produced by this provider.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + 'static;

    /// Bind a listener to `addr` (`host:port`, port `0` picks a free port).
    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener>;

    /// Open a connection to `addr`.
    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream>;
}

/// Listeners that accept inbound connections.
#[async_trait(?Send)]
pub trait TcpListenerTrait {
    /// The stream type produced by `accept`.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Accept one connection, returning the stream and the peer address.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Tokio TCP networking.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;
    type TcpListener = TokioTcpListener;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(TokioTcpListener { inner: listener })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        // Request/response traffic is latency bound; don't batch small frames.
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Tokio listener behind [`TcpListenerTrait`].
#[derive(Debug)]
pub struct TokioTcpListener {
    inner: tokio::net::TcpListener,
}

#[async_trait(?Send)]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_to_bound_listener() {
        let network = TokioNetworkProvider::new();
        let listener = network.bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let (client, accepted) = tokio::join!(network.connect(&addr), listener.accept());
        let mut client = client.expect("connect");
        let (mut server, peer) = accepted.expect("accept");
        assert!(peer.starts_with("127.0.0.1:"));

        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let network = TokioNetworkProvider::new();
        // Grab a free port, then release it so nothing listens there.
        let addr = {
            let listener = network.bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("local addr")
        };
        assert!(network.connect(&addr).await.is_err());
    }
}
