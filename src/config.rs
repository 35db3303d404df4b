// Server process configuration
use std::path::PathBuf;
use std::time::Duration;

/// Well-known loopback port the server listens on unless overridden.
pub const DEFAULT_PORT: u16 = 8745;

pub(crate) const PORT_ENV: &str = "SIDEKICK_PORT";
pub(crate) const UPSTREAM_URL_ENV: &str = "SIDEKICK_UPSTREAM_URL";
pub(crate) const TOKEN_ENV: &str = "SIDEKICK_TOKEN";

/// Configuration for the supervised server process.
///
/// The upstream URL, access token, and port are exported to the child as
/// `SIDEKICK_UPSTREAM_URL`, `SIDEKICK_TOKEN`, and `SIDEKICK_PORT` on top of
/// the inherited process environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the server executable.
    pub binary_path: PathBuf,
    /// Extra arguments passed to the executable.
    pub args: Vec<String>,
    /// Upstream service the server talks to.
    pub upstream_url: Option<String>,
    /// Access token for the upstream service.
    pub access_token: Option<String>,
    /// Loopback port the server listens on. Fixed for the lifetime of the
    /// supervisor; must be in 1..=65535.
    pub port: u16,
    /// Interval between health probes while waiting for startup.
    pub poll_interval: Duration,
}

impl ServerConfig {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            ..Self::default()
        }
    }

    /// Base URL for the server API. Pure function of the configured port,
    /// valid to call in any state.
    pub fn server_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::new(),
            args: Vec::new(),
            upstream_url: None,
            access_token: None,
            port: DEFAULT_PORT,
            poll_interval: Duration::from_millis(200),
        }
    }
}
