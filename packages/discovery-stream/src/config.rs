//! Configuration for the discovery progress tracker.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Configuration for a [`DiscoveryTracker`](crate::DiscoveryTracker).
///
/// The timing values are fixed here rather than guessed per call site:
/// the staleness threshold is deliberately larger than the session timeout
/// plus the full retry budget, so a persisted `running` snapshot younger
/// than it could still correspond to a connection that just died.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Base URL of the discovery stream endpoint.
    pub endpoint: String,

    /// Hard cap on one session. Armed when the run loop starts; on expiry
    /// the session is force-completed regardless of transport state.
    pub session_timeout: Duration,

    /// Maximum reconnect attempts after a definitive connection close.
    pub max_retries: u32,

    /// Base delay between reconnect attempts. Attempt `n` waits `n × base`.
    pub retry_base_delay: Duration,

    /// Persisted `running` snapshots older than this are discarded on
    /// restore instead of being force-completed.
    pub staleness_threshold: Duration,

    /// Override for the snapshot file location (defaults to the platform
    /// local data directory).
    pub snapshot_path: Option<PathBuf>,

    /// Bearer token appended to the stream URL. EventSource-style endpoints
    /// cannot carry custom headers, so auth rides as a query param.
    pub auth_token: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            session_timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            staleness_threshold: Duration::from_secs(600),
            snapshot_path: None,
            auth_token: None,
        }
    }
}

impl TrackerConfig {
    /// Create a config for the given stream endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the hard session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the reconnect attempt limit.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the base reconnect delay.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Set the snapshot staleness threshold.
    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Persist snapshots to a specific file instead of the default location.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Set the auth token passed as a query param.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Per-session parameters supplied when opening the stream.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Profile to personalize discovery for.
    pub profile_id: Option<Uuid>,

    /// Whether the pipeline should rank against the profile.
    pub personalized: bool,

    /// Extra query params forwarded verbatim to the endpoint.
    pub extra_params: Vec<(String, String)>,
}

impl StartOptions {
    /// Personalize for a profile.
    pub fn personalized_for(profile_id: Uuid) -> Self {
        Self {
            profile_id: Some(profile_id),
            personalized: true,
            ..Default::default()
        }
    }

    /// Add an extra query param.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_exceeds_timeout_plus_retry_budget() {
        let config = TrackerConfig::default();
        let retry_budget: Duration = (1..=config.max_retries)
            .map(|n| config.retry_base_delay * n)
            .sum();
        assert!(config.staleness_threshold > config.session_timeout + retry_budget);
    }

    #[test]
    fn builder_overrides() {
        let config = TrackerConfig::new("https://api.example.com/streams/discovery")
            .with_session_timeout(Duration::from_secs(30))
            .with_max_retries(5);
        assert_eq!(config.session_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
    }
}
