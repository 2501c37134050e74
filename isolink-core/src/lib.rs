//! # isolink-core
//!
//! Core abstractions shared by the isolink client and server.
//!
//! This crate provides:
//!
//! - **Message model**: [`IsoMessage`], an MTI plus numbered fields
//! - **Codec trait**: [`MessageCodec`] with a compact [`BinaryCodec`] and a
//!   human-readable [`JsonCodec`]
//! - **Provider traits**: abstractions for time, tasks and networking so the
//!   session logic never talks to Tokio directly
//!
//! ## Provider Traits
//!
//! - [`TimeProvider`]: sleep, timeout and time operations
//! - [`TaskProvider`]: task spawning for single-threaded environments
//! - [`NetworkProvider`]: TCP connection and listener creation
//! - [`Providers`]: bundle of the three, implemented by [`TokioProviders`]

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod message;
mod network;
mod providers;
mod task;
mod time;

// Message exports
pub use message::{FieldValue, IsoMessage, MtiError};

// Codec exports
pub use codec::{BinaryCodec, CodecError, JsonCodec, MessageCodec};

// Provider trait exports
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
