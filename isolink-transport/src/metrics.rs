//! Session counters.

use std::time::Duration;

/// Counters describing a client's session history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    /// Connection attempts started.
    pub connection_attempts: u64,
    /// Attempts that failed before a stream was established.
    pub connection_failures: u64,
    /// Streams established and bound to a channel.
    pub sessions_established: u64,
    /// Liveness handshakes completed.
    pub handshakes_completed: u64,
    /// Bound channels that stopped.
    pub disconnects: u64,
    /// Requests written to a channel.
    pub requests_sent: u64,
    /// Inbound messages stored for correlation.
    pub replies_received: u64,
    /// Stored replies handed to a waiting request.
    pub replies_claimed: u64,
    /// Requests that gave up waiting.
    pub response_timeouts: u64,
    /// Inbound frames dropped (bad checksum, undecodable, no key).
    pub frames_dropped: u64,
    /// When the last session became active.
    pub last_active_at: Option<Duration>,
    /// When the last bound channel stopped.
    pub last_disconnect_at: Option<Duration>,
}

impl SessionMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub(crate) fn record_connection_failure(&mut self) {
        self.connection_failures += 1;
    }

    pub(crate) fn record_session_established(&mut self) {
        self.sessions_established += 1;
    }

    pub(crate) fn record_handshake_at(&mut self, now: Duration) {
        self.handshakes_completed += 1;
        self.last_active_at = Some(now);
    }

    pub(crate) fn record_disconnect_at(&mut self, now: Duration) {
        self.disconnects += 1;
        self.last_disconnect_at = Some(now);
    }

    pub(crate) fn record_request_sent(&mut self) {
        self.requests_sent += 1;
    }

    pub(crate) fn record_reply_received(&mut self) {
        self.replies_received += 1;
    }

    pub(crate) fn record_reply_claimed(&mut self) {
        self.replies_claimed += 1;
    }

    pub(crate) fn record_response_timeout(&mut self) {
        self.response_timeouts += 1;
    }

    pub(crate) fn record_frame_dropped(&mut self) {
        self.frames_dropped += 1;
    }

    /// Fraction of connection attempts that established a session.
    pub fn connection_success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            return 0.0;
        }
        self.sessions_established as f64 / self.connection_attempts as f64
    }
}
