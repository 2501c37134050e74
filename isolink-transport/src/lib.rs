//! # isolink transport layer
//!
//! Self-healing ISO-8583 sessions over TCP.
//!
//! This crate provides:
//! - **Wire format**: length-prefixed frames with CRC32C checksums
//! - **Framing adapters**: [`FrameReader`] and [`FrameWriter`] bridging frames and messages
//! - **Session channel**: one live connection pumped by a single local task
//! - **Client**: [`IsoClient`], a reconnecting session with a liveness
//!   handshake and key-based request/response correlation
//! - **Server**: [`IsoServer`], an accept-side dispatcher handing each
//!   inbound message to one request handler
//!
//! Everything is single-threaded: run it inside a
//! [`LocalSet`](tokio::task::LocalSet) on a current-thread runtime.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use isolink_core::{
    BinaryCodec, CodecError, FieldValue, IsoMessage, JsonCodec, MessageCodec, MtiError,
    NetworkProvider, Providers, TaskProvider, TcpListenerTrait, TimeProvider,
    TokioNetworkProvider, TokioProviders, TokioTaskProvider, TokioTimeProvider,
};

// =============================================================================
// Modules
// =============================================================================

/// Session channel binding framing adapters to a connection.
pub mod channel;

/// Reconnecting client session.
pub mod client;

/// Client and server configuration.
pub mod config;

/// Error types for channels, clients, servers and configuration.
pub mod error;

/// Frame reader and writer adapters.
pub mod framing;

/// Session counters.
pub mod metrics;

/// Bounded polling.
pub mod poller;

/// Accept-side dispatcher.
pub mod server;

/// Correlation keys and pending replies.
pub mod store;

/// Wire format with CRC32C checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Error exports
pub use error::{ChannelError, ClientError, ConfigError, ServerError};

// Wire format exports
pub use wire::{
    FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE, WireError, serialize_frame, try_deserialize_frame,
};

// Channel exports
pub use channel::SessionChannel;
pub use framing::{DropHook, FrameReader, FrameWriter, MessageHandler};

// Polling exports
pub use poller::{PollBudget, PollTimeout, await_until, spawn_await_until};

// Correlation exports
pub use store::{
    DEFAULT_KEY_FIELD, DEFAULT_MAX_PENDING_REPLIES, DuplicateKey, InFlightKey, KeyFields,
    PendingResults,
};

// Session exports
pub use client::{HANDSHAKE_REQUEST_MTI, HANDSHAKE_RESPONSE_MTI, IsoClient, SessionState};
pub use config::{ClientConfig, ClientSettings, ServerConfig};
pub use metrics::SessionMetrics;
pub use server::{IsoServer, RequestHandler, ServerRequest};
