//! Server configuration.
//!
//! Stored as TOML at `$C3_CONFIG`, or by default:
//! - Linux: `~/.config/c3/server.toml`
//! - Windows: `%APPDATA%/c3/server.toml`
//!
//! `C3_HOST`, `C3_PORT`, `C3_LOG_LEVEL` and `C3_JOURNAL` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for agents and operator consoles (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long a command waits for the agent's reply.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a reconnect waits for the replaced link to drain.
    #[serde(default = "default_teardown_wait")]
    pub teardown_wait_secs: u64,

    /// JSON-lines activity journal. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout() -> u64 {
    c3_protocol::constants::WS_REQUEST_TIMEOUT.as_secs()
}

fn default_teardown_wait() -> u64 {
    c3_hub::DEFAULT_TEARDOWN_WAIT.as_secs()
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            teardown_wait_secs: default_teardown_wait(),
            journal_path: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads the configuration file (writing defaults if it does not
    /// exist yet), then applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or creates it with defaults if missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Writes the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Applies `C3_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(host) = var("C3_HOST") {
            self.host = host;
        }
        if let Some(port) = var("C3_PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid C3_PORT: {port:?}"))?;
        }
        if let Some(level) = var("C3_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(journal) = var("C3_JOURNAL") {
            self.journal_path = (!journal.is_empty()).then(|| PathBuf::from(journal));
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn teardown_wait(&self) -> Duration {
        Duration::from_secs(self.teardown_wait_secs)
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("C3_CONFIG") {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("c3").join("server.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("c3")
            .join("server.toml")
    }
}
