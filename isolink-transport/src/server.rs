//! Accept-side dispatcher.
//!
//! An [`IsoServer`] accepts connections and wraps each in its own
//! [`SessionChannel`]. Every decoded inbound message is handed to the
//! request handler together with a writer pre-bound to the connection it
//! came from. The server applies no timeout and no correlation; replying
//! (or not) is entirely up to the handler.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use isolink_core::{
    BinaryCodec, IsoMessage, MessageCodec, NetworkProvider, Providers, TaskProvider,
    TcpListenerTrait, TimeProvider,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{ChannelError, FrameReader, FrameWriter, ServerConfig, ServerError, SessionChannel};

/// Request handler shared by all connections of a server.
pub type RequestHandler<C> = Rc<dyn Fn(ServerRequest<C>)>;

/// An inbound message plus the means to answer it.
pub struct ServerRequest<C: MessageCodec> {
    message: IsoMessage,
    writer: FrameWriter<C>,
    peer: String,
}

impl<C: MessageCodec> ServerRequest<C> {
    /// The decoded message.
    pub fn message(&self) -> &IsoMessage {
        &self.message
    }

    /// Take ownership of the decoded message.
    pub fn into_message(self) -> IsoMessage {
        self.message
    }

    /// Address of the connection the message arrived on.
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    /// Writer bound to the originating connection, for deferred replies.
    pub fn writer(&self) -> FrameWriter<C> {
        self.writer.clone()
    }

    /// Write `msg` back on the originating connection.
    ///
    /// # Errors
    ///
    /// See [`FrameWriter::write`].
    pub fn reply(&self, msg: &IsoMessage) -> Result<(), ChannelError> {
        self.writer.write(msg)
    }

    /// Echo the message back with its response MTI (`0200` → `0210`).
    ///
    /// # Errors
    ///
    /// `Mti` if the message is not a request, `Channel` if the write fails.
    pub fn respond(&self) -> Result<(), ServerError> {
        let mut response = self.message.clone();
        response.set_response_mti()?;
        self.reply(&response)?;
        Ok(())
    }
}

struct ServerSharedState<C: MessageCodec> {
    /// Live connections by id.
    connections: HashMap<u64, SessionChannel<C>>,
    next_connection_id: u64,
}

/// Accepting side of an isolink session.
///
/// ```rust,no_run
/// use isolink_core::{BinaryCodec, TokioProviders};
/// use isolink_transport::IsoServer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = IsoServer::new(TokioProviders::new(), BinaryCodec).with_handler(|request| {
///     if let Err(e) = request.respond() {
///         tracing::warn!("echo failed: {}", e);
///     }
/// });
/// let address = server.listen("127.0.0.1:0").await?;
/// println!("listening on {address}");
/// # Ok(())
/// # }
/// ```
pub struct IsoServer<P: Providers, C: MessageCodec = BinaryCodec> {
    providers: P,
    codec: C,
    config: ServerConfig,
    handler: Option<RequestHandler<C>>,
    shared_state: Rc<RefCell<ServerSharedState<C>>>,
    local_addr: Option<String>,

    /// Shutdown signaling for the accept loop
    shutdown_tx: Option<mpsc::UnboundedSender<()>>,

    accept_handle: Option<JoinHandle<()>>,
}

impl<P: Providers, C: MessageCodec> IsoServer<P, C> {
    /// Create a server with default configuration and no handler.
    pub fn new(providers: P, codec: C) -> Self {
        Self {
            providers,
            codec,
            config: ServerConfig::default(),
            handler: None,
            shared_state: Rc::new(RefCell::new(ServerSharedState {
                connections: HashMap::new(),
                next_connection_id: 0,
            })),
            local_addr: None,
            shutdown_tx: None,
            accept_handle: None,
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the request handler.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ServerRequest<C>) + 'static,
    {
        self.handler = Some(Rc::new(handler));
        self
    }

    /// Listen on the configured address.
    ///
    /// # Errors
    ///
    /// See [`listen`](Self::listen).
    pub async fn start(&mut self) -> Result<String, ServerError> {
        let address = self.config.listen_address.clone();
        self.listen(&address).await
    }

    /// Bind `address` and accept connections on a background task.
    ///
    /// Returns the bound address, which differs from `address` when port
    /// `0` was requested.
    ///
    /// # Errors
    ///
    /// `NoHandler` if no handler is installed, `Bind` if the socket cannot
    /// be bound.
    pub async fn listen(&mut self, address: &str) -> Result<String, ServerError> {
        let Some(handler) = self.handler.clone() else {
            return Err(ServerError::NoHandler);
        };

        let listener = self
            .providers
            .network()
            .bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;
        tracing::info!(server = %local_addr, "listening");

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let handle = self.providers.task().spawn_task(
            "accept_loop",
            accept_loop(
                listener,
                AcceptContext {
                    providers: self.providers.clone(),
                    codec: self.codec.clone(),
                    config: self.config.clone(),
                    handler,
                    shared_state: self.shared_state.clone(),
                    name: local_addr.clone(),
                },
                shutdown_rx,
            ),
        );

        self.local_addr = Some(local_addr.clone());
        self.shutdown_tx = Some(shutdown_tx);
        self.accept_handle = Some(handle);
        Ok(local_addr)
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    /// Stop accepting. Established connections stay up.
    ///
    /// # Errors
    ///
    /// `NotListening` if the server was never started or is already closed.
    pub async fn close(&mut self) -> Result<(), ServerError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(ServerError::NotListening);
        };
        let _ = shutdown_tx.send(());
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.await;
        }
        self.local_addr = None;
        Ok(())
    }

    /// Forcibly close every live connection.
    ///
    /// Returns how many connections were closed.
    pub fn disconnect_all(&self) -> usize {
        let channels: Vec<SessionChannel<C>> = self
            .shared_state
            .borrow()
            .connections
            .values()
            .cloned()
            .collect();
        for channel in &channels {
            channel.close();
        }
        tracing::info!("disconnecting {} connections", channels.len());
        channels.len()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared_state.borrow().connections.len()
    }
}

impl<P: Providers, C: MessageCodec> Drop for IsoServer<P, C> {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

struct AcceptContext<P: Providers, C: MessageCodec> {
    providers: P,
    codec: C,
    config: ServerConfig,
    handler: RequestHandler<C>,
    shared_state: Rc<RefCell<ServerSharedState<C>>>,
    name: String,
}

async fn accept_loop<P: Providers, C: MessageCodec>(
    listener: <P::Network as NetworkProvider>::TcpListener,
    ctx: AcceptContext<P, C>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = serve_connection(&ctx, stream, peer) {
                            tracing::warn!(server = %ctx.name, "cannot serve connection: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %ctx.name, "accept failed: {}", e);
                        let _ = ctx.providers.time().sleep(ctx.config.accept_error_delay).await;
                    }
                }
            }
        }
    }
    tracing::info!(server = %ctx.name, "stopped accepting");
}

/// Wrap one accepted stream in its own channel.
fn serve_connection<P: Providers, C: MessageCodec>(
    ctx: &AcceptContext<P, C>,
    stream: <P::Network as NetworkProvider>::TcpStream,
    peer: String,
) -> Result<(), ChannelError> {
    let writer = FrameWriter::new(ctx.codec.clone());
    let mut reader = FrameReader::new(ctx.codec.clone());

    let handler = ctx.handler.clone();
    let request_writer = writer.clone();
    let request_peer = peer.clone();
    reader.on_message(move |message| {
        handler(ServerRequest {
            message,
            writer: request_writer.clone(),
            peer: request_peer.clone(),
        });
    });

    let channel = SessionChannel::new(reader, writer).with_name(peer.clone());

    let id = {
        let mut state = ctx.shared_state.borrow_mut();
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections.insert(id, channel.clone());
        id
    };

    let shared_state = Rc::downgrade(&ctx.shared_state);
    let server = ctx.name.clone();
    channel.on_disconnected(move || {
        if let Some(shared_state) = shared_state.upgrade() {
            shared_state.borrow_mut().connections.remove(&id);
        }
        tracing::info!(server = %server, "connection {} closed", id);
    });

    if let Err(e) = channel.bind(stream, ctx.providers.task()) {
        ctx.shared_state.borrow_mut().connections.remove(&id);
        return Err(e);
    }
    tracing::info!(server = %ctx.name, "accepted {} as connection {}", peer, id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{serialize_frame, try_deserialize_frame};
    use isolink_core::TokioProviders;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::LocalSet;

    fn echo_server() -> IsoServer<TokioProviders> {
        IsoServer::new(TokioProviders::new(), BinaryCodec).with_handler(|request| {
            request.respond().expect("echo");
        })
    }

    async fn exchange(stream: &mut TcpStream, msg: &IsoMessage) -> IsoMessage {
        let frame = serialize_frame(&BinaryCodec.encode(msg).expect("encode")).expect("frame");
        stream.write_all(&frame).await.expect("write");

        let mut buf = Vec::new();
        loop {
            if let Some((payload, _)) = try_deserialize_frame(&buf).expect("valid frame") {
                return BinaryCodec.decode(&payload).expect("decode");
            }
            let mut chunk = [0u8; 512];
            let n = stream.read(&mut chunk).await.expect("read");
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn wait_for_count<P: Providers, C: MessageCodec>(server: &IsoServer<P, C>, n: usize) {
        for _ in 0..200 {
            if server.connection_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("connection count stuck at {}", server.connection_count());
    }

    #[tokio::test]
    async fn test_listen_requires_handler() {
        LocalSet::new()
            .run_until(async {
                let mut server: IsoServer<TokioProviders> =
                    IsoServer::new(TokioProviders::new(), BinaryCodec);
                assert!(matches!(
                    server.listen("127.0.0.1:0").await,
                    Err(ServerError::NoHandler)
                ));
                assert!(matches!(server.close().await, Err(ServerError::NotListening)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_echo_per_connection() {
        LocalSet::new()
            .run_until(async {
                let mut server = echo_server();
                let address = server.listen("127.0.0.1:0").await.expect("listen");
                assert_eq!(server.local_addr(), Some(address.as_str()));

                let mut first = TcpStream::connect(&address).await.expect("connect");
                let mut second = TcpStream::connect(&address).await.expect("connect");

                let a = IsoMessage::new("0200").with_field(41, "A1");
                let b = IsoMessage::new("2800").with_field(1000, "hs");

                let reply_a = exchange(&mut first, &a).await;
                let reply_b = exchange(&mut second, &b).await;
                assert_eq!(reply_a.mti(), "0210");
                assert_eq!(reply_a.get_string(41).as_deref(), Some("A1"));
                assert_eq!(reply_b.mti(), "2810");
                assert_eq!(server.connection_count(), 2);

                drop(first);
                wait_for_count(&server, 1).await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_disconnect_all_and_close() {
        LocalSet::new()
            .run_until(async {
                let mut server = echo_server();
                let address = server.listen("127.0.0.1:0").await.expect("listen");

                let mut stream = TcpStream::connect(&address).await.expect("connect");
                exchange(&mut stream, &IsoMessage::new("0800").with_field(11, "1")).await;

                assert_eq!(server.disconnect_all(), 1);
                let mut buf = [0u8; 16];
                assert_eq!(stream.read(&mut buf).await.expect("read"), 0);
                wait_for_count(&server, 0).await;

                server.close().await.expect("close");
                assert_eq!(server.local_addr(), None);
                assert!(matches!(server.close().await, Err(ServerError::NotListening)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_respond_rejects_responses() {
        LocalSet::new()
            .run_until(async {
                let outcomes = Rc::new(RefCell::new(Vec::new()));
                let sink = outcomes.clone();
                let mut server = IsoServer::new(TokioProviders::new(), BinaryCodec).with_handler(
                    move |request: ServerRequest<BinaryCodec>| {
                        sink.borrow_mut().push(request.respond().is_ok());
                        if request.message().is_response() {
                            // Let the client know we saw it.
                            request.reply(&IsoMessage::new("9999")).expect("reply");
                        }
                    },
                );
                let address = server.listen("127.0.0.1:0").await.expect("listen");

                let mut stream = TcpStream::connect(&address).await.expect("connect");
                let reply = exchange(&mut stream, &IsoMessage::new("0210")).await;
                assert_eq!(reply.mti(), "9999");
                assert_eq!(*outcomes.borrow(), vec![false]);
            })
            .await;
    }
}
