//! Process-wide configuration, loaded once from an optional TOML file and
//! overlaid with environment variables. Mirrors the once-loaded singleton
//! pattern this stack already uses for static configuration, generalized
//! from a single settings file to the fields this session core needs.

use std::sync::OnceLock;
use std::time::Duration;

/// Maximum PTY dimensions a client may request; resize requests are clamped
/// into `[1, MAX_COLS] x [1, MAX_ROWS]`.
pub const MAX_COLS: u16 = 500;
pub const MAX_ROWS: u16 = 200;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DaemonConfig {
    /// Host:port the message channel and companion HTTP surface listen on.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret required on every connection; absence is fatal at
    /// startup (see `Self::require_auth_secret`).
    #[serde(default)]
    pub auth_secret: Option<String>,
    /// Argv used to spawn the shell for every new session.
    #[serde(default = "default_shell_argv")]
    pub shell_argv: Vec<String>,
    /// Scrollback ring buffer capacity in bytes.
    #[serde(default = "default_scrollback_capacity")]
    pub scrollback_capacity: usize,
    /// Inert passthrough values surfaced verbatim via `GET /config` for the
    /// (out of scope) UI chrome.
    #[serde(default)]
    pub hscroll: bool,
    #[serde(default = "default_app_title")]
    pub app_title: String,
}

fn default_bind() -> String {
    "127.0.0.1:7681".to_string()
}

fn default_shell_argv() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd.exe".to_string()]
    } else {
        vec!["bash".to_string(), "-l".to_string()]
    }
}

fn default_scrollback_capacity() -> usize {
    crate::scrollback::DEFAULT_CAPACITY
}

fn default_app_title() -> String {
    "Terminal".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_secret: None,
            shell_argv: default_shell_argv(),
            scrollback_capacity: default_scrollback_capacity(),
            hscroll: false,
            app_title: default_app_title(),
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file if `path` is given and exists, else defaults.
    /// `TTY_AUTH_SECRET` in the environment overrides (or supplies) the
    /// configured secret, so deployments don't have to put it in a file.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            _ => DaemonConfig::default(),
        };
        if let Ok(secret) = std::env::var("TTY_AUTH_SECRET") {
            if !secret.is_empty() {
                cfg.auth_secret = Some(secret);
            }
        }
        Ok(cfg)
    }

    /// Absence of an auth secret is fatal at startup, per the external
    /// interface contract.
    pub fn require_auth_secret(&self) -> anyhow::Result<&str> {
        self.auth_secret.as_deref().ok_or_else(|| {
            anyhow::anyhow!("no authentication secret configured (set TTY_AUTH_SECRET or auth_secret in config)")
        })
    }
}

static CONFIG: OnceLock<DaemonConfig> = OnceLock::new();

/// Install the process-wide configuration. Panics if called twice.
pub fn install(cfg: DaemonConfig) {
    CONFIG.set(cfg).map_err(|_| ()).expect("config already installed");
}

/// Fetch the process-wide configuration, falling back to defaults if
/// `install` was never called (e.g. in unit tests).
pub fn get() -> &'static DaemonConfig {
    CONFIG.get_or_init(DaemonConfig::default)
}
