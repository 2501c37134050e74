//! Error types for isolink sessions.
//!
//! Transport failures (connect errors, resets, broken frames) are absorbed by
//! the reconnect loop and only ever logged. The errors here are the ones that
//! reach a caller: request-scoped client failures, server setup failures and
//! channel misuse.

use std::io;
use std::time::Duration;

use isolink_core::{CodecError, MtiError};

use crate::WireError;

/// Errors raised by a [`SessionChannel`](crate::SessionChannel) or its
/// framing adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel has not been bound to a connection yet.
    #[error("channel is not bound to a connection")]
    NotBound,

    /// The channel was already bound once.
    #[error("channel is already bound")]
    AlreadyBound,

    /// The channel has stopped.
    #[error("channel closed")]
    Closed,

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A frame could not be built or parsed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Errors returned by [`IsoClient`](crate::IsoClient) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No session channel exists right now.
    #[error("client is not connected")]
    NotActive,

    /// No reply arrived for `key` within the allotted wait.
    #[error("no response for key {key} after {waited:?}")]
    ResponseTimeout {
        /// Correlation key of the request.
        key: String,
        /// How long the caller asked to wait.
        waited: Duration,
    },

    /// The session did not become active within the allotted wait.
    #[error("session not active after {waited:?}")]
    HandshakeTimeout {
        /// How long the caller asked to wait.
        waited: Duration,
    },

    /// The message lacks one of the configured key fields.
    #[error("message has no key field {field}")]
    MissingKeyField {
        /// The missing field id.
        field: u32,
    },

    /// Another in-flight request already waits on the same key.
    #[error("a request with key {key} is already in flight")]
    DuplicateKey {
        /// The contested key.
        key: String,
    },

    /// The request could not be encoded or the reply decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The request could not be framed, for instance because it exceeds the
    /// maximum frame size. Nothing was written.
    #[error("cannot frame request: {0}")]
    Wire(#[from] WireError),

    /// The client has been closed.
    #[error("client closed")]
    Closed,
}

/// Errors returned by [`IsoServer`](crate::IsoServer) operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `listen` was called before a request handler was installed.
    #[error("no request handler installed")]
    NoHandler,

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// The address that was requested.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The server is not listening.
    #[error("server is not listening")]
    NotListening,

    /// A response MTI could not be derived from the request.
    #[error("cannot respond: {0}")]
    Mti(#[from] MtiError),

    /// Writing to the connection failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Errors raised while building a client or server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The key field list is empty or contains a non-numeric entry.
    #[error("invalid key fields {value:?}")]
    InvalidKeyFields {
        /// The offending list as given.
        value: String,
    },

    /// A required setting is absent or empty.
    #[error("missing setting {name}")]
    Missing {
        /// Name of the setting.
        name: &'static str,
    },

    /// A duration setting is zero where a positive value is required.
    #[error("setting {name} must be greater than zero")]
    ZeroDuration {
        /// Name of the setting.
        name: &'static str,
    },

    /// JSON settings could not be parsed.
    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_messages() {
        let err = ClientError::ResponseTimeout {
            key: "A1".to_string(),
            waited: Duration::from_millis(600),
        };
        assert_eq!(err.to_string(), "no response for key A1 after 600ms");

        let err = ClientError::MissingKeyField { field: 41 };
        assert_eq!(err.to_string(), "message has no key field 41");
    }

    #[test]
    fn test_server_bind_error_keeps_source() {
        let err = ServerError::Bind {
            address: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("failed to bind 127.0.0.1:1"));
    }

    #[test]
    fn test_oversize_request_is_a_client_error() {
        let err: ClientError = WireError::FrameTooLarge { size: 2 << 20 }.into();
        assert!(matches!(err, ClientError::Wire(WireError::FrameTooLarge { .. })));
        assert!(err.to_string().starts_with("cannot frame request"));
    }

    #[test]
    fn test_channel_error_from_wire() {
        let err: ChannelError = WireError::InvalidLength { length: 2 }.into();
        assert!(matches!(err, ChannelError::Wire(_)));
    }
}
