use once_cell::sync::Lazy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::L1Error;
use crate::toml_helpers::extract_line_col_from_msg;

/// Runtime configuration file looked up next to the executable.
pub const RUNTIME_CONFIG_STEM: &str = "polatis_runtime_configuration";

/// How port numbers are presented to the controller.
///
/// `Logical` folds an AxB switch so that controller port `p` is the pair of
/// physical ports `p` and `p + L` (L = min(A, B)). `Physical` maps 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortMode {
    #[default]
    Logical,
    Physical,
}

impl FromStr for PortMode {
    type Err = L1Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logical" => Ok(Self::Logical),
            "physical" => Ok(Self::Physical),
            other => Err(L1Error::Config(format!("unknown port mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_host: String,
    pub backlog: u32,
    pub read_chunk_bytes: usize,
    /// Poll interval of the controller read loop. Expiry is not an error.
    pub read_idle_secs: u64,
    /// Drop a controller connection after this much silence (0 = never).
    pub idle_drop_secs: u64,
    pub max_batch_bytes: usize,
    pub device_port: u16,
    pub connect_timeout_secs: u64,
    /// Upper bound on waiting for one device reply (0 = wait forever).
    pub reply_timeout_secs: u64,
    pub port_mode: PortMode,
    pub log_batches: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            backlog: 100,
            read_chunk_bytes: 2048,
            read_idle_secs: 10,
            idle_drop_secs: 0,
            max_batch_bytes: 4 * 1024 * 1024,
            device_port: 3082,
            connect_timeout_secs: 10,
            reply_timeout_secs: 120,
            port_mode: PortMode::Logical,
            log_batches: false,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `POLATIS_*` environment overrides on top of `self`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("POLATIS_LISTEN_HOST") {
            self.listen_host = v;
        }
        if let Some(v) = env_parse("POLATIS_BACKLOG") {
            self.backlog = v;
        }
        if let Some(v) = env_parse("POLATIS_READ_IDLE_SECS") {
            self.read_idle_secs = v;
        }
        if let Some(v) = env_parse("POLATIS_IDLE_DROP_SECS") {
            self.idle_drop_secs = v;
        }
        if let Some(v) = env_parse("POLATIS_MAX_BATCH_BYTES") {
            self.max_batch_bytes = v;
        }
        if let Some(v) = env_parse("POLATIS_DEVICE_PORT") {
            self.device_port = v;
        }
        if let Some(v) = env_parse("POLATIS_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = env_parse("POLATIS_REPLY_TIMEOUT_SECS") {
            self.reply_timeout_secs = v;
        }
        if let Some(v) = env_parse("POLATIS_PORT_MODE") {
            self.port_mode = v;
        }
        if let Ok(v) = std::env::var("POLATIS_LOG_BATCHES") {
            self.log_batches = v == "1";
        }
        self
    }

    /// Parse a TOML runtime configuration. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, L1Error> {
        toml::from_str(s).map_err(|e| {
            let s = e.to_string();
            if let Some((line, col)) = extract_line_col_from_msg(&s) {
                L1Error::Config(format!("runtime config parse error at {line}:{col}: {s}"))
            } else {
                L1Error::Config(format!("runtime config parse error: {s}"))
            }
        })
    }

    /// Parse a JSON runtime configuration. Missing keys keep their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, L1Error> {
        serde_json::from_str(s).map_err(|e| {
            L1Error::Config(format!(
                "runtime config parse error at {}:{}: {e}",
                e.line(),
                e.column()
            ))
        })
    }

    /// Load a configuration file; the format is chosen by extension (`.json` or TOML).
    pub fn from_path(path: &Path) -> Result<Self, L1Error> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| L1Error::Config(format!("read {}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&s),
            _ => Self::from_toml_str(&s),
        }
    }

    /// File config (if found next to the exe) with environment overrides applied.
    pub fn load() -> Result<Self, L1Error> {
        let base = match find_runtime_config() {
            Some(p) => {
                tracing::info!("loading runtime configuration from {}", p.display());
                Self::from_path(&p)?
            }
            None => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    #[must_use]
    pub const fn read_idle(&self) -> Duration {
        Duration::from_secs(self.read_idle_secs)
    }

    #[must_use]
    pub const fn idle_drop(&self) -> Option<Duration> {
        if self.idle_drop_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_drop_secs))
        }
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn reply_timeout(&self) -> Option<Duration> {
        if self.reply_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.reply_timeout_secs))
        }
    }
}

/// Find `polatis_runtime_configuration.{toml,json}` next to the executable.
pub fn find_runtime_config() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    ["toml", "json"]
        .iter()
        .map(|ext| dir.join(format!("{RUNTIME_CONFIG_STEM}.{ext}")))
        .find(|p| p.exists())
}

/// Global config loaded once at first access: runtime file (if any) plus
/// environment. An unreadable file falls back to defaults with a warning.
pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::load().unwrap_or_else(|e| {
        tracing::warn!("{e}; using defaults");
        Config::from_env()
    })
});

/// Convenience accessor
pub fn config() -> &'static Config {
    &GLOBAL_CONFIG
}
