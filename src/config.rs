//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};

use crate::event::parse_relay_uri;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Serializes tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the viewer's store.
    pub data_dir: PathBuf,
    /// Relays used for cold start and as injected defaults.
    pub default_relays: Vec<String>,
    /// Hex secret key, taking precedence over `key_file`.
    pub secret_key: Option<String>,
    /// Path to a file holding the hex secret key.
    pub key_file: Option<PathBuf>,
    /// Optional SOCKS5 proxy (host:port) for all relay sockets.
    pub socks_proxy: Option<String>,
    /// Per-relay connect timeout.
    pub connect_timeout: Duration,
}

impl Settings {
    /// Load settings from the specified `.env` file. Malformed relay URIs
    /// are a fatal configuration error.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let data_dir = PathBuf::from(env::var("DATA_DIR").context("DATA_DIR is required")?);
        let default_relays = csv_strings(env::var("DEFAULT_RELAYS").unwrap_or_default())
            .iter()
            .map(|raw| parse_relay_uri(raw).map_err(|e| anyhow!("DEFAULT_RELAYS {raw:?}: {e}")))
            .collect::<Result<Vec<_>>>()?;
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.is_empty());
        let key_file = env::var("KEY_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let socks_proxy = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let connect_timeout = match env::var("CONNECT_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .map_err(|_| anyhow!("CONNECT_TIMEOUT_SECS {raw:?} is not a number"))?,
            ),
            Err(_) => DEFAULT_CONNECT_TIMEOUT,
        };
        Ok(Self {
            data_dir,
            default_relays,
            secret_key,
            key_file,
            socks_proxy,
            connect_timeout,
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
