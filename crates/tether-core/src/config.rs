//! Client settings, read from `config.toml` and `TETHER_*` variables.
//!
//! ```toml
//! [server]
//! host = "localhost"
//! port = 1667
//!
//! [transfer]
//! cancel_timeout_ms = 3000
//!
//! [decoding]
//! clamp_large_arrays = true
//! max_array_size = 500
//! ```
//!
//! Every key is optional. Environment variables win over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub server: ServerConfig,
    pub transfer: TransferConfig,
    pub decoding: DecodingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// How long to wait for the server to acknowledge a cancel before
    /// cancelling locally.
    pub cancel_timeout_ms: u64,
    /// Largest accepted transport frame.
    pub max_frame_bytes: usize,
    /// Default directory for local cache files.
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingConfig {
    /// true = clamp arrays to `max_array_size`, false = skip them.
    pub clamp_large_arrays: bool,
    pub max_array_size: usize,
    /// Prefer a timestamp embedded in the message over the transport one.
    pub use_embedded_timestamp: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1667,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: 3_000,
            max_frame_bytes: 256 * 1024 * 1024,
            cache_dir: data_dir().join("cache"),
        }
    }
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            clamp_large_arrays: true,
            max_array_size: 500,
            use_embedded_timestamp: false,
        }
    }
}

impl TransferConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

// ── Locations ─────────────────────────────────────────────────────────────────

/// `$XDG_CONFIG_HOME/tether`, falling back to `~/.config/tether`.
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

/// `$XDG_DATA_HOME/tether`, falling back to `~/.local/share/tether`.
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

fn xdg_dir(var: &str, under_home: &[&str]) -> PathBuf {
    let base = match std::env::var_os(var) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var_os("HOME").map_or_else(std::env::temp_dir, PathBuf::from);
            under_home.iter().fold(home, |p, part| p.join(part))
        }
    };
    base.join("tether")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl TetherConfig {
    /// Defaults, overlaid with the config file if there is one, overlaid
    /// with `TETHER_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = match path.try_exists() {
            Ok(true) => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `$TETHER_CONFIG` if set, else `config.toml` under [`config_dir`].
    pub fn file_path() -> PathBuf {
        match std::env::var_os("TETHER_CONFIG") {
            Some(explicit) => PathBuf::from(explicit),
            None => config_dir().join("config.toml"),
        }
    }

    /// Apply TETHER_* overrides. `lookup` is `std::env::var` outside tests.
    /// Values that do not parse are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| matches!(v.as_str(), "true" | "1" | "yes");

        if let Some(v) = lookup("TETHER_SERVER__HOST") {
            self.server.host = v;
        }
        if let Some(p) = lookup("TETHER_SERVER__PORT").and_then(|v| v.parse().ok()) {
            self.server.port = p;
        }
        if let Some(ms) = lookup("TETHER_TRANSFER__CANCEL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.transfer.cancel_timeout_ms = ms;
        }
        if let Some(v) = lookup("TETHER_DECODING__CLAMP_LARGE_ARRAYS") {
            self.decoding.clamp_large_arrays = flag(v);
        }
        if let Some(n) = lookup("TETHER_DECODING__MAX_ARRAY_SIZE").and_then(|v| v.parse().ok()) {
            self.decoding.max_array_size = n;
        }
        if let Some(v) = lookup("TETHER_DECODING__USE_EMBEDDED_TIMESTAMP") {
            self.decoding.use_embedded_timestamp = flag(v);
        }
    }
}
