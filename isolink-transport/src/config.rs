//! Client and server configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::{ConfigError, DEFAULT_MAX_PENDING_REPLIES, KeyFields};

/// Configuration for an [`IsoClient`](crate::IsoClient).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Remote `host:port`
    pub address: String,

    /// Fields whose values form the correlation key
    pub key_fields: KeyFields,

    /// Bound on each connection attempt; `None` leaves it to the OS
    pub connect_timeout: Option<Duration>,

    /// Wait used by [`IsoClient::send`](crate::IsoClient::send)
    pub response_timeout: Duration,

    /// Interval between checks while waiting for a reply or activation
    pub poll_interval: Duration,

    /// Pause after a failed connection attempt
    pub reconnect_delay: Duration,

    /// Wait used by [`IsoClient::send_when_active`](crate::IsoClient::send_when_active)
    pub when_active_timeout: Duration,

    /// Unclaimed replies kept before the oldest are evicted
    pub max_pending_replies: usize,
}

impl ClientConfig {
    /// Default settings for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            key_fields: KeyFields::default(),
            connect_timeout: None,
            response_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(200),
            when_active_timeout: Duration::from_secs(30),
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
        }
    }

    /// Short intervals for a peer on the same host or LAN.
    pub fn local_network(address: impl Into<String>) -> Self {
        Self {
            connect_timeout: Some(Duration::from_millis(500)),
            response_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
            reconnect_delay: Duration::from_millis(20),
            when_active_timeout: Duration::from_secs(5),
            ..Self::new(address)
        }
    }

    /// Set the correlation key fields.
    pub fn with_key_fields(mut self, key_fields: KeyFields) -> Self {
        self.key_fields = key_fields;
        self
    }

    /// Bound each connection attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the default response wait.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the pause after a failed connection attempt.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the activation wait used by `send_when_active`.
    pub fn with_when_active_timeout(mut self, timeout: Duration) -> Self {
        self.when_active_timeout = timeout;
        self
    }

    /// Bound the number of unclaimed replies kept.
    pub fn with_max_pending_replies(mut self, max: usize) -> Self {
        self.max_pending_replies = max;
        self
    }
}

/// Deserializable client settings, as found in JSON config files.
///
/// ```
/// use isolink_transport::{ClientConfig, ClientSettings};
///
/// let settings = ClientSettings::from_json(
///     r#"{"host": "10.0.0.7", "port": 8583, "keyFields": "41,11", "response_timeout": 30000}"#,
/// ).expect("valid json");
/// let config = ClientConfig::try_from(settings).expect("valid settings");
///
/// assert_eq!(config.address, "10.0.0.7:8583");
/// assert_eq!(config.key_fields.fields(), &[41, 11]);
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct ClientSettings {
    /// Remote host name or IP.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Comma-separated key field ids.
    #[serde(rename = "keyFields", default)]
    pub key_fields: Option<String>,
    /// Response wait in milliseconds.
    #[serde(default)]
    pub response_timeout: Option<u64>,
    /// Connection attempt bound in milliseconds.
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    /// Polling interval in milliseconds.
    #[serde(default)]
    pub poll_interval: Option<u64>,
}

impl ClientSettings {
    /// Parse settings from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] if the document does not match.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl TryFrom<ClientSettings> for ClientConfig {
    type Error = ConfigError;

    fn try_from(settings: ClientSettings) -> Result<Self, Self::Error> {
        if settings.host.trim().is_empty() {
            return Err(ConfigError::Missing { name: "host" });
        }
        if settings.port == 0 {
            return Err(ConfigError::Missing { name: "port" });
        }

        let mut config = ClientConfig::new(format!("{}:{}", settings.host, settings.port));
        if let Some(fields) = settings.key_fields {
            config.key_fields = KeyFields::parse(&fields)?;
        }
        if let Some(ms) = settings.response_timeout {
            config.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.connect_timeout {
            config.connect_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.poll_interval {
            if ms == 0 {
                return Err(ConfigError::ZeroDuration {
                    name: "poll_interval",
                });
            }
            config.poll_interval = Duration::from_millis(ms);
            config.reconnect_delay = config.poll_interval;
        }
        Ok(config)
    }
}

/// Configuration for an [`IsoServer`](crate::IsoServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_address: String,

    /// Pause after a failed `accept` before trying again
    pub accept_error_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8583".to_string(),
            accept_error_delay: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    /// Listen on `address` with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            listen_address: address.into(),
            ..Self::default()
        }
    }

    /// Loopback on an OS-assigned port.
    pub fn local_network() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            accept_error_delay: Duration::from_millis(10),
        }
    }
}
