use std::time::Duration;

/// Backoff used after an established socket drops. The first connect is a
/// single attempt; this only governs reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.initial_delay.saturating_mul(factor);
        Some(delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP origin of the server, e.g. `https://mitra.example.org`.
    pub base_url: String,
    /// Bearer token issued by the auth service.
    pub token: String,
    pub reconnect: ReconnectPolicy,
    /// Backstop refresh of the attendance dashboard.
    pub stats_poll_interval: Duration,
    /// Quiet period after the last keystroke before `stopTyping` is sent.
    pub typing_idle: Duration,
    /// How long a remote typist is shown without a fresh `userTyping`.
    pub typing_expiry: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            reconnect: ReconnectPolicy::default(),
            stats_poll_interval: Duration::from_secs(120),
            typing_idle: Duration::from_secs(2),
            typing_expiry: Duration::from_secs(3),
        }
    }

    /// REST URL for an `/api/...` path.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// WebSocket URL with the token in the query string.
    pub fn socket_url(&self) -> String {
        let origin = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{origin}/socket?token={}", self.token)
    }
}
