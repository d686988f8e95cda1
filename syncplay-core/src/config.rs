//! Engine configuration
//!
//! All protocol timings live here so hosts and tests can tighten them.

use std::time::Duration;

use url::Url;

/// Default authority base URL
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8096";

/// Client name announced in the authorization header
const DEFAULT_CLIENT_NAME: &str = "syncplay-core";

/// Configuration for a [`SyncEngine`](crate::engine::SyncEngine)
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Authority base URL (http or https)
    pub server_url: String,
    /// Access token for the authority, if the server requires one
    pub access_token: Option<String>,
    /// Stable identifier of this device
    pub device_id: String,
    /// Human-readable device name
    pub device_name: String,
    /// Client application name
    pub client_name: String,
    /// Client application version
    pub client_version: String,

    /// Deadline for the WebSocket open handshake
    pub connect_timeout: Duration,
    /// Deadline for a single REST request
    pub request_timeout: Duration,
    /// Interval between heartbeat pings while connected
    pub heartbeat_interval: Duration,
    /// Connection is considered dead after this long without a pong
    pub heartbeat_timeout: Duration,
    /// First reconnect delay, doubled per attempt
    pub backoff_base: Duration,
    /// Upper bound for the reconnect delay
    pub backoff_max: Duration,

    /// Number of join attempts before giving up
    pub join_attempts: u32,
    /// Linear join backoff step (`step * attempt`)
    pub join_backoff_step: Duration,
    /// Fallback snapshot poll interval
    pub poll_interval: Duration,
    /// Polls are skipped when a protocol message arrived within this window
    pub poll_quiet_window: Duration,

    /// Position report interval
    pub report_interval: Duration,
    /// Minimum position advance before a new report is sent
    pub report_min_advance_ms: u64,
    /// Drift check interval
    pub drift_interval: Duration,
    /// Lower bound of the drift tolerance
    pub min_drift_tolerance_ms: u64,
    /// Latency assumed until the authority reports one
    pub default_latency_ms: u64,

    /// Commands older than this are never applied
    pub stale_after_ms: u64,
    /// Equivalent commands within this window are duplicates
    pub dedup_window_ms: u64,
    /// Synthesized plays for the same item are suppressed within this window
    pub play_guard_window_ms: u64,
    /// Watchdog for the remote-execution guard, also bounds one command apply
    pub remote_guard_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            access_token: None,
            device_id: random_device_id(),
            device_name: DEFAULT_CLIENT_NAME.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            join_attempts: 3,
            join_backoff_step: Duration::from_millis(1000),
            poll_interval: Duration::from_secs(10),
            poll_quiet_window: Duration::from_secs(5),
            report_interval: Duration::from_millis(1000),
            report_min_advance_ms: 100,
            drift_interval: Duration::from_millis(2000),
            min_drift_tolerance_ms: 500,
            default_latency_ms: 50,
            stale_after_ms: 5000,
            dedup_window_ms: 5000,
            play_guard_window_ms: 10_000,
            remote_guard_timeout: Duration::from_millis(5000),
        }
    }
}

impl SyncConfig {
    /// Create a config pointing at the given authority
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Set the access token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the device identity
    pub fn with_device(mut self, device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self.device_name = device_name.into();
        self
    }

    /// Set the client identity
    pub fn with_client(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    /// REST base URL without a trailing slash
    pub fn rest_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Push channel URL derived from the server URL
    pub fn socket_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(self.rest_base())?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        // http(s) -> ws(s) is always an allowed scheme change
        let _ = url.set_scheme(scheme);

        let path = format!("{}/socket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            if let Some(token) = &self.access_token {
                query.append_pair("api_key", token);
            }
            query.append_pair("deviceId", &self.device_id);
        }
        Ok(url)
    }
}

/// Generate a random device id (used when the host does not supply one)
fn random_device_id() -> String {
    use rand::Rng;
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..16)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect();
    format!("syncplay-{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_from_http() {
        let config = SyncConfig::new("http://media.local:8096/")
            .with_token("abc")
            .with_device("dev1", "Living Room");
        let url = config.socket_url().unwrap();
        assert_eq!(url.as_str(), "ws://media.local:8096/socket?api_key=abc&deviceId=dev1");
    }

    #[test]
    fn test_socket_url_keeps_base_path_and_tls() {
        let config = SyncConfig::new("https://example.com/jf").with_device("d", "n");
        let url = config.socket_url().unwrap();
        assert_eq!(url.as_str(), "wss://example.com/jf/socket?deviceId=d");
    }

    #[test]
    fn test_random_device_ids_differ() {
        let a = SyncConfig::default();
        let b = SyncConfig::default();
        assert!(a.device_id.starts_with("syncplay-"));
        assert_ne!(a.device_id, b.device_id);
    }
}
