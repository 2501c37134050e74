//! Self-healing client session with request/response correlation.
//!
//! An [`IsoClient`] keeps exactly one [`SessionChannel`] to its peer at a
//! time. A background session task connects, performs a liveness handshake
//! and, once the channel drops for any reason, starts over.
//!
//! # Session Lifecycle
//!
//! ```text
//!                 connect ok                 2810 claimed
//! ┌────────────┐ ─────────► ┌──────────────────────┐ ─────────► ┌────────┐
//! │ Connecting │            │ AwaitingHandshakeAck │            │ Active │
//! └────────────┘            └──────────────────────┘            └────────┘
//!   ▲       │ connect failed           │ channel stopped            │
//!   │       ▼ (reconnect_delay)        ▼                            │
//!   │   ┌──────────────┐ ◄─────────────┘                            │
//!   └───┤ Disconnected │ ◄──────────────────────────────────────────┘
//!       └──────────────┘        channel stopped
//! ```
//!
//! # Correlation
//!
//! Every inbound message is re-encoded and parked in [`PendingResults`]
//! under its correlation key. [`IsoClient::send_message`] writes a request
//! and then polls the store for its own key, so replies may arrive in any
//! order and a reply that arrives before its waiter is still claimed.

use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use isolink_core::{
    BinaryCodec, IsoMessage, MessageCodec, NetworkProvider, Providers, TaskProvider, TimeProvider,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::{
    ChannelError, ClientConfig, ClientError, FrameReader, FrameWriter, KeyFields, PendingResults,
    PollBudget, SessionChannel, SessionMetrics, await_until,
};

/// MTI of the liveness handshake request.
pub const HANDSHAKE_REQUEST_MTI: &str = "2800";

/// MTI expected on the liveness handshake reply.
pub const HANDSHAKE_RESPONSE_MTI: &str = "2810";

/// Where a client is in its session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No channel exists.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The channel is bound and the handshake reply is awaited.
    AwaitingHandshakeAck,
    /// The handshake completed; requests flow.
    Active,
}

struct ClientSharedState<C: MessageCodec> {
    /// The current channel, if any.
    channel: Option<SessionChannel<C>>,
    /// Set once by `close` or drop.
    closed: bool,
}

/// Everything the session task and the request paths share.
#[derive(Clone)]
struct ClientCore<P: Providers, C: MessageCodec> {
    shared_state: Rc<RefCell<ClientSharedState<C>>>,
    metrics: Rc<RefCell<SessionMetrics>>,
    store: PendingResults,
    state_tx: Rc<watch::Sender<SessionState>>,
    config: Rc<ClientConfig>,
    providers: P,
    codec: C,
}

impl<P: Providers, C: MessageCodec> ClientCore<P, C> {
    fn name(&self) -> &str {
        &self.config.address
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        set_state(&self.state_tx, self.name(), state);
    }

    fn is_closed(&self) -> bool {
        self.shared_state.borrow().closed
    }

    fn current_channel(&self) -> Option<SessionChannel<C>> {
        self.shared_state.borrow().channel.clone()
    }

    fn decode_reply(&self, bytes: &[u8]) -> Result<IsoMessage, ClientError> {
        let reply = self.codec.decode(bytes)?;
        self.metrics.borrow_mut().record_reply_claimed();
        Ok(reply)
    }

    async fn send_message(
        &self,
        msg: &IsoMessage,
        timeout: Duration,
    ) -> Result<IsoMessage, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let key = self.config.key_fields.key_for(msg)?;
        if self.store.is_in_flight(&key) {
            return Err(ClientError::DuplicateKey { key });
        }

        if let Some(bytes) = self.store.remove(&key) {
            tracing::debug!(client = %self.name(), "reply for {} was already waiting", key);
            return self.decode_reply(&bytes);
        }

        let Some(channel) = self.current_channel() else {
            return Err(ClientError::NotActive);
        };

        let _in_flight = self.store.begin(key.clone())?;
        match channel.send_message(msg) {
            Ok(()) => self.metrics.borrow_mut().record_request_sent(),
            // Nothing reached the connection; only this request is affected.
            Err(ChannelError::Codec(e)) => return Err(ClientError::Codec(e)),
            Err(ChannelError::Wire(e)) => {
                tracing::warn!(client = %self.name(), "cannot frame {}: {}", key, e);
                return Err(ClientError::Wire(e));
            }
            Err(e) => {
                tracing::warn!(client = %self.name(), "write for {} failed: {}", key, e);
                channel.close();
            }
        }

        let interval = self.config.poll_interval;
        let outcome = await_until(
            self.providers.time(),
            interval,
            PollBudget::from_timeout(timeout, interval),
            || {
                if let Some(bytes) = self.store.remove(&key) {
                    return Some(Ok(bytes));
                }
                self.is_closed().then_some(Err(ClientError::Closed))
            },
        )
        .await;

        match outcome {
            Ok(Ok(bytes)) => self.decode_reply(&bytes),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.metrics.borrow_mut().record_response_timeout();
                tracing::warn!(
                    client = %self.name(),
                    "no response for {} after {:?}",
                    key,
                    timeout
                );
                Err(ClientError::ResponseTimeout {
                    key,
                    waited: timeout,
                })
            }
        }
    }

    async fn when_active(&self, timeout: Duration) -> Result<(), ClientError> {
        let interval = self.config.poll_interval;
        let outcome = await_until(
            self.providers.time(),
            interval,
            PollBudget::from_timeout(timeout, interval),
            || {
                if self.is_closed() {
                    return Some(Err(ClientError::Closed));
                }
                (self.state() == SessionState::Active).then_some(Ok(()))
            },
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(ClientError::HandshakeTimeout { waited: timeout }),
        }
    }

    async fn connect(&self) -> io::Result<<P::Network as NetworkProvider>::TcpStream> {
        let connect = self.providers.network().connect(&self.config.address);
        match self.config.connect_timeout {
            Some(limit) => match self.providers.time().timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {limit:?}"),
                )),
            },
            None => connect.await,
        }
    }

    /// Build a fresh channel wired to this client's store, metrics and state.
    fn new_channel(&self) -> SessionChannel<C> {
        let mut reader = FrameReader::new(self.codec.clone());

        let inbound = InboundRecorder {
            store: self.store.clone(),
            codec: self.codec.clone(),
            key_fields: self.config.key_fields.clone(),
            metrics: self.metrics.clone(),
            name: self.name().to_string(),
        };
        reader.on_message(move |msg| inbound.record(msg));

        let metrics = self.metrics.clone();
        reader.on_dropped(move |_| metrics.borrow_mut().record_frame_dropped());

        let channel = SessionChannel::new(reader, FrameWriter::new(self.codec.clone()))
            .with_name(self.name());

        let state_tx = self.state_tx.clone();
        let name = self.name().to_string();
        channel.on_connected(move || {
            set_state(&state_tx, &name, SessionState::AwaitingHandshakeAck);
        });

        let shared_state: Weak<RefCell<ClientSharedState<C>>> = Rc::downgrade(&self.shared_state);
        let metrics = self.metrics.clone();
        let state_tx = self.state_tx.clone();
        let time = self.providers.time().clone();
        let name = self.name().to_string();
        channel.on_disconnected(move || {
            if let Some(shared_state) = shared_state.upgrade() {
                shared_state.borrow_mut().channel = None;
            }
            metrics.borrow_mut().record_disconnect_at(time.now());
            set_state(&state_tx, &name, SessionState::Disconnected);
            tracing::info!(client = %name, "session lost");
        });

        channel
    }
}

fn set_state(state_tx: &watch::Sender<SessionState>, name: &str, state: SessionState) {
    let previous = state_tx.send_replace(state);
    if previous != state {
        tracing::debug!(client = %name, "state {:?} -> {:?}", previous, state);
    }
}

/// Parks every inbound message in the pending-result store.
struct InboundRecorder<C: MessageCodec> {
    store: PendingResults,
    codec: C,
    key_fields: KeyFields,
    metrics: Rc<RefCell<SessionMetrics>>,
    name: String,
}

impl<C: MessageCodec> InboundRecorder<C> {
    fn record(&self, msg: IsoMessage) {
        let key = match self.key_fields.key_for(&msg) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(client = %self.name, "dropping {}: {}", msg, e);
                self.metrics.borrow_mut().record_frame_dropped();
                return;
            }
        };

        match self.codec.encode(&msg) {
            Ok(bytes) => {
                tracing::debug!(client = %self.name, "reply stored under {}", key);
                self.store.put(key, bytes);
                self.metrics.borrow_mut().record_reply_received();
            }
            Err(e) => {
                tracing::warn!(client = %self.name, "cannot store {}: {}", msg, e);
                self.metrics.borrow_mut().record_frame_dropped();
            }
        }
    }
}

/// Background task: connect, handshake, wait for the channel to drop, repeat.
async fn session_task<P: Providers, C: MessageCodec>(
    core: ClientCore<P, C>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break;
            }

            _ = run_session(&core) => {}
        }
    }

    let channel = core.shared_state.borrow_mut().channel.take();
    if let Some(channel) = channel {
        channel.close();
    }
    core.set_state(SessionState::Disconnected);
    tracing::debug!(client = %core.name(), "session task stopped");
}

/// One connection lifetime.
async fn run_session<P: Providers, C: MessageCodec>(core: &ClientCore<P, C>) {
    core.set_state(SessionState::Connecting);
    core.metrics.borrow_mut().record_connection_attempt();

    let stream = match core.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(client = %core.name(), "connect failed: {}", e);
            core.metrics.borrow_mut().record_connection_failure();
            core.set_state(SessionState::Disconnected);
            let _ = core.providers.time().sleep(core.config.reconnect_delay).await;
            return;
        }
    };
    core.metrics.borrow_mut().record_session_established();

    let channel = core.new_channel();
    core.shared_state.borrow_mut().channel = Some(channel.clone());
    if let Err(e) = channel.bind(stream, core.providers.task()) {
        tracing::warn!(client = %core.name(), "bind failed: {}", e);
        core.shared_state.borrow_mut().channel = None;
        return;
    }

    let acknowledged = tokio::select! {
        _ = channel.closed() => false,
        acknowledged = handshake(core, &channel) => acknowledged,
    };

    if acknowledged && channel.is_open() {
        core.metrics
            .borrow_mut()
            .record_handshake_at(core.providers.time().now());
        core.set_state(SessionState::Active);
        tracing::info!(client = %core.name(), "session active");
    } else {
        channel.close();
    }

    channel.closed().await;
}

/// Send a `2800` with fresh key values and wait, without limit, for its reply.
async fn handshake<P: Providers, C: MessageCodec>(
    core: &ClientCore<P, C>,
    channel: &SessionChannel<C>,
) -> bool {
    let mut request = IsoMessage::new(HANDSHAKE_REQUEST_MTI);
    let key = core.config.key_fields.stamp_unique(&mut request);
    let _in_flight = match core.store.begin(key.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::warn!(client = %core.name(), "handshake key clash: {}", e);
            return false;
        }
    };

    if let Err(e) = channel.send_message(&request) {
        tracing::warn!(client = %core.name(), "handshake write failed: {}", e);
        return false;
    }
    tracing::debug!(client = %core.name(), "handshake sent with key {}", key);

    let bytes = match await_until(
        core.providers.time(),
        core.config.poll_interval,
        PollBudget::Unbounded,
        || core.store.remove(&key),
    )
    .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(client = %core.name(), "handshake wait aborted: {}", e);
            return false;
        }
    };

    match core.codec.decode(&bytes) {
        Ok(reply) => {
            if reply.mti() != HANDSHAKE_RESPONSE_MTI {
                tracing::warn!(
                    client = %core.name(),
                    "handshake answered with MTI {}, accepting on key match",
                    reply.mti()
                );
            }
            true
        }
        Err(e) => {
            tracing::warn!(client = %core.name(), "undecodable handshake reply: {}", e);
            false
        }
    }
}

/// A resilient ISO-8583 client.
///
/// Construction spawns the session task, so it must happen inside a
/// `LocalSet` (or any context where the provider's `spawn_task` works).
///
/// ```rust,no_run
/// use std::time::Duration;
/// use isolink_core::{BinaryCodec, IsoMessage, TokioProviders};
/// use isolink_transport::{ClientConfig, IsoClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = IsoClient::new(
///     TokioProviders::new(),
///     BinaryCodec,
///     ClientConfig::new("127.0.0.1:8583"),
/// );
/// client.when_active(Duration::from_secs(30)).await?;
///
/// let request = IsoMessage::new("0200").with_field(1000, "txn-1");
/// let reply = client.send_message(&request, Duration::from_secs(5)).await?;
/// println!("{reply}");
/// # Ok(())
/// # }
/// ```
pub struct IsoClient<P: Providers, C: MessageCodec = BinaryCodec> {
    core: ClientCore<P, C>,

    /// Shutdown signaling for the session task
    shutdown_tx: mpsc::UnboundedSender<()>,

    session_handle: Option<JoinHandle<()>>,
}

impl<P: Providers, C: MessageCodec> IsoClient<P, C> {
    /// Create a client and start connecting to `config.address`.
    pub fn new(providers: P, codec: C, config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let core = ClientCore {
            shared_state: Rc::new(RefCell::new(ClientSharedState {
                channel: None,
                closed: false,
            })),
            metrics: Rc::new(RefCell::new(SessionMetrics::new())),
            store: PendingResults::with_limit(config.max_pending_replies),
            state_tx: Rc::new(state_tx),
            config: Rc::new(config),
            providers,
            codec,
        };

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let session_handle = core
            .providers
            .task()
            .spawn_task("session_task", session_task(core.clone(), shutdown_rx));

        Self {
            core,
            shutdown_tx,
            session_handle: Some(session_handle),
        }
    }

    /// Send `msg` and wait up to `timeout` for the reply with the same key.
    ///
    /// # Errors
    ///
    /// - `MissingKeyField` if `msg` lacks a key field
    /// - `DuplicateKey` if another call already waits on the same key
    /// - `NotActive` if no channel exists and no reply is already stored
    /// - `ResponseTimeout` if no reply arrives in time
    /// - `Codec` if the message cannot be encoded or the reply decoded
    /// - `Wire` if the encoded message exceeds the maximum frame size
    /// - `Closed` once the client is closed
    pub async fn send_message(
        &self,
        msg: &IsoMessage,
        timeout: Duration,
    ) -> Result<IsoMessage, ClientError> {
        self.core.send_message(msg, timeout).await
    }

    /// Callback flavour of [`send_message`](Self::send_message).
    ///
    /// The exchange runs on its own local task and `on_result` is invoked
    /// exactly once.
    pub fn send_message_with<F>(
        &self,
        msg: IsoMessage,
        timeout: Duration,
        on_result: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<IsoMessage, ClientError>) + 'static,
    {
        let core = self.core.clone();
        self.core.providers.task().spawn_task("send_message", async move {
            let result = core.send_message(&msg, timeout).await;
            on_result(result);
        })
    }

    /// [`send_message`](Self::send_message) with the configured response timeout.
    ///
    /// # Errors
    ///
    /// See [`send_message`](Self::send_message).
    pub async fn send(&self, msg: &IsoMessage) -> Result<IsoMessage, ClientError> {
        self.send_message(msg, self.core.config.response_timeout).await
    }

    /// Wait for an active session, then [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// `HandshakeTimeout` if the session does not become active within
    /// `when_active_timeout`, otherwise as [`send_message`](Self::send_message).
    pub async fn send_when_active(&self, msg: &IsoMessage) -> Result<IsoMessage, ClientError> {
        self.when_active(self.core.config.when_active_timeout).await?;
        self.send(msg).await
    }

    /// Wait up to `timeout` for the session to become active.
    ///
    /// Returns immediately if it already is.
    ///
    /// # Errors
    ///
    /// `HandshakeTimeout` when the wait runs out, `Closed` once closed.
    pub async fn when_active(&self, timeout: Duration) -> Result<(), ClientError> {
        self.core.when_active(timeout).await
    }

    /// Callback flavour of [`when_active`](Self::when_active).
    pub fn when_active_with<F>(&self, timeout: Duration, on_result: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<(), ClientError>) + 'static,
    {
        let core = self.core.clone();
        self.core.providers.task().spawn_task("when_active", async move {
            let result = core.when_active(timeout).await;
            on_result(result);
        })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Whether the handshake has completed on the current channel.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.core.state_tx.subscribe()
    }

    /// Snapshot of the session counters.
    pub fn metrics(&self) -> SessionMetrics {
        self.core.metrics.borrow().clone()
    }

    /// Replies received but not yet claimed.
    pub fn pending_replies(&self) -> usize {
        self.core.store.len()
    }

    /// Remote address.
    pub fn address(&self) -> &str {
        self.core.name()
    }

    /// Correlation key fields.
    pub fn key_fields(&self) -> &KeyFields {
        &self.core.config.key_fields
    }

    /// Stop the session task and drop the current channel.
    ///
    /// Later calls fail with [`ClientError::Closed`].
    pub async fn close(&mut self) {
        self.core.shared_state.borrow_mut().closed = true;
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.session_handle.take() {
            let _ = handle.await;
        }
        self.core.set_state(SessionState::Disconnected);
    }
}

impl<P: Providers, C: MessageCodec> Drop for IsoClient<P, C> {
    fn drop(&mut self) {
        self.core.shared_state.borrow_mut().closed = true;
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolink_core::TokioProviders;
    use tokio::task::LocalSet;

    async fn refused_address() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        listener.local_addr().expect("addr").to_string()
    }

    fn quick_config(address: String) -> ClientConfig {
        ClientConfig::local_network(address)
            .with_poll_interval(Duration::from_millis(10))
            .with_reconnect_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_send_without_channel_is_not_active() {
        LocalSet::new()
            .run_until(async {
                let address = refused_address().await;
                let client =
                    IsoClient::new(TokioProviders::new(), BinaryCodec, quick_config(address));

                let msg = IsoMessage::new("0200").with_field(1000, "k1");
                let err = client
                    .send_message(&msg, Duration::from_millis(50))
                    .await
                    .expect_err("no channel");
                assert!(matches!(err, ClientError::NotActive));
                assert!(!client.is_active());
            })
            .await;
    }

    #[tokio::test]
    async fn test_missing_key_field_is_rejected_before_io() {
        LocalSet::new()
            .run_until(async {
                let address = refused_address().await;
                let client =
                    IsoClient::new(TokioProviders::new(), BinaryCodec, quick_config(address));

                let err = client
                    .send_message(&IsoMessage::new("0200"), Duration::from_millis(50))
                    .await
                    .expect_err("no key");
                assert!(matches!(err, ClientError::MissingKeyField { field: 1000 }));
                assert_eq!(client.metrics().requests_sent, 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_stored_reply_is_claimed_without_a_channel() {
        LocalSet::new()
            .run_until(async {
                let address = refused_address().await;
                let client =
                    IsoClient::new(TokioProviders::new(), BinaryCodec, quick_config(address));

                let reply = IsoMessage::new("0210").with_field(1000, "k1");
                client
                    .core
                    .store
                    .put("k1", BinaryCodec.encode(&reply).expect("encode"));
                assert_eq!(client.pending_replies(), 1);

                let got = client
                    .send_message(&IsoMessage::new("0200").with_field(1000, "k1"), Duration::ZERO)
                    .await
                    .expect("stored reply");
                assert_eq!(got, reply);
                assert_eq!(client.pending_replies(), 0);
                assert_eq!(client.metrics().replies_claimed, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_not_counted_as_claimed() {
        LocalSet::new()
            .run_until(async {
                let address = refused_address().await;
                let client =
                    IsoClient::new(TokioProviders::new(), BinaryCodec, quick_config(address));

                client.core.store.put("k1", vec![0xff, 0x00]);
                let err = client
                    .send_message(&IsoMessage::new("0200").with_field(1000, "k1"), Duration::ZERO)
                    .await
                    .expect_err("garbage reply");
                assert!(matches!(err, ClientError::Codec(_)));
                assert_eq!(client.metrics().replies_claimed, 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_connect_failures_are_retried() {
        LocalSet::new()
            .run_until(async {
                let address = refused_address().await;
                let client =
                    IsoClient::new(TokioProviders::new(), BinaryCodec, quick_config(address));

                let err = client
                    .when_active(Duration::from_millis(100))
                    .await
                    .expect_err("no server");
                assert!(matches!(err, ClientError::HandshakeTimeout { .. }));

                let metrics = client.metrics();
                assert!(metrics.connection_attempts >= 2);
                assert!(metrics.connection_failures >= 1);
                assert_eq!(metrics.sessions_established, 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_close_rejects_later_calls() {
        LocalSet::new()
            .run_until(async {
                let address = refused_address().await;
                let mut client =
                    IsoClient::new(TokioProviders::new(), BinaryCodec, quick_config(address));
                client.close().await;

                assert_eq!(client.state(), SessionState::Disconnected);
                let msg = IsoMessage::new("0200").with_field(1000, "k1");
                assert!(matches!(
                    client.send_message(&msg, Duration::from_millis(10)).await,
                    Err(ClientError::Closed)
                ));
                assert!(matches!(
                    client.when_active(Duration::from_millis(10)).await,
                    Err(ClientError::Closed)
                ));
            })
            .await;
    }
}
