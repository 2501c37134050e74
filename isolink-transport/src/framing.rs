//! Framing adapters between the byte stream and [`IsoMessage`]s.
//!
//! [`FrameReader`] is the inbound half: it buffers raw bytes, cuts them into
//! frames and hands every decoded message to a single handler, in arrival
//! order. [`FrameWriter`] is the outbound half: it encodes and frames
//! messages and queues them for the channel's pump task.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use isolink_core::{IsoMessage, MessageCodec};
use tokio::sync::Notify;

use crate::{ChannelError, WireError, serialize_frame, try_deserialize_frame};

/// Handler invoked for every decoded inbound message.
pub type MessageHandler = Box<dyn FnMut(IsoMessage)>;

/// Hook invoked for every inbound frame that was dropped.
pub type DropHook = Box<dyn FnMut(&ChannelError)>;

/// Inbound framing adapter.
pub struct FrameReader<C: MessageCodec> {
    codec: C,
    read_buffer: Vec<u8>,
    handler: Option<MessageHandler>,
    drop_hook: Option<DropHook>,
}

impl<C: MessageCodec> FrameReader<C> {
    /// Create a reader with no handler registered.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            read_buffer: Vec::with_capacity(4096),
            handler: None,
            drop_hook: None,
        }
    }

    /// Register the message handler, replacing any previous one.
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(IsoMessage) + 'static,
    {
        if self.handler.is_some() {
            tracing::debug!("FrameReader: replacing message handler");
        }
        self.handler = Some(Box::new(handler));
    }

    /// Register a hook told about every dropped frame.
    pub fn on_dropped<F>(&mut self, hook: F)
    where
        F: FnMut(&ChannelError) + 'static,
    {
        self.drop_hook = Some(Box::new(hook));
    }

    /// Bytes buffered that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Append bytes read from the stream and deliver every complete message.
    ///
    /// Returns the number of messages handed to the handler. A frame with a
    /// bad checksum or an undecodable payload is dropped and parsing carries
    /// on with the next frame.
    ///
    /// # Errors
    ///
    /// Returns the [`WireError`] when a header is malformed. The stream
    /// cannot be resynchronized after that and the buffer is discarded.
    pub fn ingest(&mut self, bytes: &[u8]) -> Result<usize, WireError> {
        self.read_buffer.extend_from_slice(bytes);
        let mut delivered = 0;

        loop {
            match try_deserialize_frame(&self.read_buffer) {
                Ok(Some((payload, consumed))) => {
                    self.read_buffer.drain(..consumed);
                    match self.codec.decode(&payload) {
                        Ok(msg) => {
                            tracing::debug!("FrameReader: decoded {}", msg);
                            self.deliver(msg);
                            delivered += 1;
                        }
                        Err(e) => {
                            tracing::warn!("FrameReader: dropping undecodable frame: {}", e);
                            self.dropped(&ChannelError::Codec(e));
                        }
                    }
                }
                Ok(None) => return Ok(delivered),
                Err(e @ WireError::ChecksumMismatch { length, .. }) => {
                    tracing::warn!("FrameReader: dropping corrupted frame: {}", e);
                    self.read_buffer.drain(..length);
                    self.dropped(&ChannelError::Wire(e));
                }
                Err(e) => {
                    self.read_buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    fn deliver(&mut self, msg: IsoMessage) {
        match self.handler.as_mut() {
            Some(handler) => handler(msg),
            None => tracing::warn!("FrameReader: no handler registered, dropping {}", msg),
        }
    }

    fn dropped(&mut self, err: &ChannelError) {
        if let Some(hook) = self.drop_hook.as_mut() {
            hook(err);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterStatus {
    Unbound,
    Open,
    Closed,
}

struct WriterState {
    status: WriterStatus,
    /// Framed messages waiting for the pump task.
    queue: VecDeque<Vec<u8>>,
}

/// Outbound framing adapter.
///
/// Clones share the same queue, so a writer can be handed to request
/// handlers while the channel keeps draining it.
#[derive(Clone)]
pub struct FrameWriter<C: MessageCodec> {
    codec: C,
    state: Rc<RefCell<WriterState>>,
    data_to_send: Rc<Notify>,
}

impl<C: MessageCodec> FrameWriter<C> {
    /// Create an unbound writer.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            state: Rc::new(RefCell::new(WriterState {
                status: WriterStatus::Unbound,
                queue: VecDeque::new(),
            })),
            data_to_send: Rc::new(Notify::new()),
        }
    }

    /// Encode, frame and queue a message.
    ///
    /// Returns without waiting for socket I/O.
    ///
    /// # Errors
    ///
    /// - `NotBound` before the owning channel is bound
    /// - `Closed` once the owning channel has stopped
    /// - `Codec` / `Wire` if the message cannot be serialized
    pub fn write(&self, msg: &IsoMessage) -> Result<(), ChannelError> {
        match self.state.borrow().status {
            WriterStatus::Unbound => return Err(ChannelError::NotBound),
            WriterStatus::Closed => return Err(ChannelError::Closed),
            WriterStatus::Open => {}
        }

        let payload = self.codec.encode(msg)?;
        let frame = serialize_frame(&payload)?;

        let mut state = self.state.borrow_mut();
        let first_unsent = state.queue.is_empty();
        state.queue.push_back(frame);
        tracing::debug!(
            "FrameWriter: queued {} ({} frames pending)",
            msg,
            state.queue.len()
        );
        if first_unsent {
            self.data_to_send.notify_one();
        }
        Ok(())
    }

    /// Whether the writer currently accepts messages.
    pub fn is_open(&self) -> bool {
        self.state.borrow().status == WriterStatus::Open
    }

    /// Number of frames queued but not yet written.
    pub fn queued(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Move from unbound to open. Returns false if the writer was bound before.
    pub(crate) fn open(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.status != WriterStatus::Unbound {
            return false;
        }
        state.status = WriterStatus::Open;
        true
    }

    /// Stop accepting messages and discard anything still queued.
    pub(crate) fn shut(&self) {
        let mut state = self.state.borrow_mut();
        state.status = WriterStatus::Closed;
        let discarded = state.queue.len();
        state.queue.clear();
        if discarded > 0 {
            tracing::debug!("FrameWriter: discarded {} unsent frames", discarded);
        }
    }

    pub(crate) fn pop_frame(&self) -> Option<Vec<u8>> {
        self.state.borrow_mut().queue.pop_front()
    }

    /// Resolve once a frame has been queued since the last wake-up.
    pub(crate) async fn data_queued(&self) {
        self.data_to_send.notified().await;
    }
}
