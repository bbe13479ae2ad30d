//! Optional TOML configuration for the client and the daemon.
//!
//! Every field has a default so a missing file, or a file naming only a few
//! keys, is valid. Command-line flags override whatever is loaded here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientOptions;
use crate::pki::config_dir;
use crate::protocol::{timeouts, COUNTER_LIMIT, DEFAULT_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// host:port to listen on
    pub bind: String,
    /// Per-user directories are created under this root
    pub data_root: PathBuf,
    /// Directory holding ca.pem, crl.pem, server.pem, server.key and users/
    pub pki_dir: PathBuf,
    /// 0 disables the timeout
    pub io_timeout_secs: u64,
    /// Text log file; stderr when unset
    pub log_file: Option<PathBuf>,
    pub journal: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            data_root: PathBuf::from("./vault"),
            pki_dir: config_dir(),
            io_timeout_secs: timeouts::IO_DEFAULT_SECS,
            log_file: None,
            journal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// cloudvault://user@host:port
    pub server: Option<String>,
    pub username: Option<String>,
    pub pki_dir: PathBuf,
    /// Encrypted PKCS#8 key; defaults to users/<name>/private.pem under pki_dir
    pub key_path: Option<PathBuf>,
    pub io_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub counter_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            username: None,
            pki_dir: config_dir(),
            key_path: None,
            io_timeout_secs: timeouts::IO_DEFAULT_SECS,
            connect_timeout_secs: timeouts::CONNECT_SECS,
            counter_limit: COUNTER_LIMIT,
        }
    }
}

impl ClientConfig {
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            io_timeout: timeouts::io_timeout(self.io_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            counter_limit: self.counter_limit.max(1),
        }
    }
}

fn load_toml<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

/// Load `path` if given, else `<config_dir>/<default_name>` if it exists,
/// else defaults.
fn load_or_default<T>(path: Option<&Path>, default_name: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match path {
        Some(p) => load_toml(p),
        None => {
            let p = config_dir().join(default_name);
            if p.exists() {
                load_toml(&p)
            } else {
                Ok(T::default())
            }
        }
    }
}

pub fn load_server_config(path: Option<&Path>) -> Result<ServerConfig> {
    load_or_default(path, "server.toml")
}

pub fn load_client_config(path: Option<&Path>) -> Result<ClientConfig> {
    load_or_default(path, "client.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_server_config_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("server.toml");
        std::fs::write(&p, "bind = \"127.0.0.1:9100\"\nio_timeout_secs = 0\n").unwrap();
        let cfg = load_server_config(Some(&p)).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9100");
        assert_eq!(cfg.io_timeout_secs, 0);
        assert!(cfg.journal);
        assert_eq!(cfg.data_root, PathBuf::from("./vault"));
    }

    #[test]
    fn test_client_options_from_config() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("client.toml");
        std::fs::write(
            &p,
            "server = \"cloudvault://alice@localhost\"\nio_timeout_secs = 0\ncounter_limit = 16\n",
        )
        .unwrap();
        let cfg = load_client_config(Some(&p)).unwrap();
        assert_eq!(cfg.server.as_deref(), Some("cloudvault://alice@localhost"));
        let opts = cfg.options();
        assert!(opts.io_timeout.is_none());
        assert_eq!(opts.counter_limit, 16);
        assert_eq!(opts.connect_timeout, Duration::from_secs(timeouts::CONNECT_SECS));
    }

    #[test]
    fn test_bad_config_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("client.toml");
        std::fs::write(&p, "io_timeout_secs = \"soon\"\n").unwrap();
        assert!(load_client_config(Some(&p)).is_err());
        assert!(load_client_config(Some(&tmp.path().join("missing.toml"))).is_err());
    }
}
