//! Session channel: one live connection plus its framing adapters.
//!
//! A [`SessionChannel`] pairs a [`FrameReader`] and a [`FrameWriter`] with a
//! byte stream. Binding spawns a single pump task that owns the stream,
//! feeds inbound bytes to the reader and drains the writer's queue.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────┐  bind   ┌──────┐  EOF / I/O error / wire error / close  ┌────────┐
//! │ Idle ├────────►│ Open ├───────────────────────────────────────►│ Closed │
//! └──┬───┘         └──────┘                                        └────────┘
//!    │                                 close                           ▲
//!    └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `on_connected` fires when `bind` succeeds and `on_disconnected` fires when
//! the pump stops; each at most once.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use isolink_core::{IsoMessage, MessageCodec, TaskProvider};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, watch};

use crate::{ChannelError, FrameReader, FrameWriter, WireError};

type Callback = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelStatus {
    Idle,
    Open,
    Closed,
}

struct ChannelShared<C: MessageCodec> {
    name: String,
    status: ChannelStatus,
    /// Moved into the pump task on bind.
    reader: Option<FrameReader<C>>,
    on_connected: Option<Callback>,
    on_disconnected: Option<Callback>,
}

/// A framed, bidirectional session over one connection.
///
/// Cheap to clone; clones refer to the same channel.
#[derive(Clone)]
pub struct SessionChannel<C: MessageCodec> {
    shared: Rc<RefCell<ChannelShared<C>>>,
    writer: FrameWriter<C>,
    shutdown: Rc<Notify>,
    closed_tx: Rc<watch::Sender<bool>>,
}

impl<C: MessageCodec> SessionChannel<C> {
    /// Pair a reader and a writer. Nothing happens until [`bind`](Self::bind).
    pub fn new(reader: FrameReader<C>, writer: FrameWriter<C>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            shared: Rc::new(RefCell::new(ChannelShared {
                name: "channel".to_string(),
                status: ChannelStatus::Idle,
                reader: Some(reader),
                on_connected: None,
                on_disconnected: None,
            })),
            writer,
            shutdown: Rc::new(Notify::new()),
            closed_tx: Rc::new(closed_tx),
        }
    }

    /// Label used in log lines, usually the peer address.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.shared.borrow_mut().name = name.into();
        self
    }

    /// The channel's log label.
    pub fn name(&self) -> String {
        self.shared.borrow().name.clone()
    }

    /// Run `callback` once the channel is bound.
    pub fn on_connected<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.shared.borrow_mut().on_connected = Some(Box::new(callback));
    }

    /// Run `callback` once the bound channel stops, whatever the cause.
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.shared.borrow_mut().on_disconnected = Some(Box::new(callback));
    }

    /// Attach both adapters to `stream` and start pumping.
    ///
    /// # Errors
    ///
    /// `AlreadyBound` on a second bind, `Closed` if the channel was closed
    /// before it was ever bound.
    pub fn bind<S, T>(&self, stream: S, tasks: &T) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + 'static,
        T: TaskProvider,
    {
        let (name, reader) = {
            let mut shared = self.shared.borrow_mut();
            match shared.status {
                ChannelStatus::Open => return Err(ChannelError::AlreadyBound),
                ChannelStatus::Closed => return Err(ChannelError::Closed),
                ChannelStatus::Idle => {}
            }
            let Some(reader) = shared.reader.take() else {
                return Err(ChannelError::AlreadyBound);
            };
            shared.status = ChannelStatus::Open;
            (shared.name.clone(), reader)
        };

        self.writer.open();
        tasks.spawn_task(
            &format!("channel_pump {name}"),
            pump_task(self.clone(), stream, reader),
        );
        tracing::debug!(channel = %name, "SessionChannel: bound");

        let callback = self.shared.borrow_mut().on_connected.take();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    /// Whether the pump is running.
    pub fn is_open(&self) -> bool {
        self.shared.borrow().status == ChannelStatus::Open
    }

    /// Queue a message on the outbound adapter.
    ///
    /// # Errors
    ///
    /// See [`FrameWriter::write`].
    pub fn send_message(&self, msg: &IsoMessage) -> Result<(), ChannelError> {
        self.writer.write(msg)
    }

    /// A handle on the outbound adapter.
    pub fn writer(&self) -> FrameWriter<C> {
        self.writer.clone()
    }

    /// Stop the channel.
    ///
    /// A bound channel stops its pump, which drops the connection and fires
    /// `on_disconnected`. An unbound channel simply becomes unusable.
    pub fn close(&self) {
        let status = self.shared.borrow().status;
        match status {
            ChannelStatus::Open => self.shutdown.notify_one(),
            ChannelStatus::Idle => {
                {
                    let mut shared = self.shared.borrow_mut();
                    shared.status = ChannelStatus::Closed;
                    shared.reader = None;
                }
                self.writer.shut();
                self.closed_tx.send_replace(true);
            }
            ChannelStatus::Closed => {}
        }
    }

    /// Resolve once the channel has stopped.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

enum StopReason {
    Local,
    PeerClosed,
    Io(io::Error),
    Wire(WireError),
}

/// Owns the stream for the lifetime of the binding.
async fn pump_task<S, C>(channel: SessionChannel<C>, mut stream: S, mut reader: FrameReader<C>)
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
    C: MessageCodec,
{
    let name = channel.name();

    let reason = loop {
        tokio::select! {
            _ = channel.shutdown.notified() => {
                break StopReason::Local;
            }

            _ = channel.writer.data_queued() => {
                if let Err(e) = flush_queue(&channel.writer, &mut stream).await {
                    break StopReason::Io(e);
                }
            }

            read_result = async {
                let mut buffer = vec![0u8; 4096];
                stream.read(&mut buffer).await.map(|n| (buffer, n))
            } => {
                match read_result {
                    Ok((_buffer, 0)) => break StopReason::PeerClosed,
                    Ok((buffer, n)) => {
                        tracing::debug!(channel = %name, "pump: received {} bytes", n);
                        if let Err(e) = reader.ingest(&buffer[..n]) {
                            break StopReason::Wire(e);
                        }
                    }
                    Err(e) => break StopReason::Io(e),
                }
            }
        }
    };

    match &reason {
        StopReason::Local => tracing::debug!(channel = %name, "pump: closed locally"),
        StopReason::PeerClosed => tracing::info!(channel = %name, "pump: peer closed connection"),
        StopReason::Io(e) => tracing::warn!(channel = %name, "pump: I/O error: {}", e),
        StopReason::Wire(e) => {
            tracing::warn!(channel = %name, "pump: unrecoverable frame: {}", e)
        }
    }

    channel.writer.shut();
    let callback = {
        let mut shared = channel.shared.borrow_mut();
        shared.status = ChannelStatus::Closed;
        shared.on_disconnected.take()
    };
    if let Some(callback) = callback {
        callback();
    }
    channel.closed_tx.send_replace(true);
}

async fn flush_queue<S, C>(writer: &FrameWriter<C>, stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
    C: MessageCodec,
{
    while let Some(frame) = writer.pop_frame() {
        stream.write_all(&frame).await?;
    }
    stream.flush().await
}
