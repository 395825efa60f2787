//! Load config from file and environment.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use p2pdi_core::{DocumentId, PeerId};

use crate::peer::PeerOptions;
use crate::registry::{RegistryOptions, DEFAULT_REGISTRY_HOST, DEFAULT_REGISTRY_PORT};

/// Node configuration. File: ~/.config/p2pdi/config.toml or /etc/p2pdi/config.toml.
/// Env overrides: P2PDI_REGISTRY_HOST, P2PDI_REGISTRY_PORT, P2PDI_PEER_HOST,
/// P2PDI_PEER_PORT, P2PDI_DOCUMENT_DIR, P2PDI_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_registry_host")]
    pub registry_host: String,
    /// Registration service port (default 65423).
    #[serde(default = "default_registry_port")]
    pub registry_port: u16,
    #[serde(default = "default_peer_host")]
    pub peer_host: String,
    /// Peer listen port (default 0, any free port).
    #[serde(default)]
    pub peer_port: u16,
    /// Directory holding this peer's starting documents.
    #[serde(default = "default_document_dir")]
    pub document_dir: PathBuf,
    /// Documents to hold. Empty means every id found in `document_dir`.
    #[serde(default)]
    pub goal: Vec<DocumentId>,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_query_attempts")]
    pub query_attempts: u32,
    #[serde(default = "default_query_retry_delay_ms")]
    pub query_retry_delay_ms: u64,
    #[serde(default = "default_max_idle_rounds")]
    pub max_idle_rounds: u32,
    #[serde(default = "default_round_delay_ms")]
    pub round_delay_ms: u64,
    /// `tracing` filter directive used when RUST_LOG is unset.
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_registry_host() -> String {
    DEFAULT_REGISTRY_HOST.to_string()
}
fn default_registry_port() -> u16 {
    DEFAULT_REGISTRY_PORT
}
fn default_peer_host() -> String {
    "127.0.0.1".to_string()
}
fn default_document_dir() -> PathBuf {
    PathBuf::from("rfc")
}
fn default_lease_ttl_secs() -> u64 {
    7200
}
fn default_tick_interval_secs() -> u64 {
    5
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_query_attempts() -> u32 {
    3
}
fn default_query_retry_delay_ms() -> u64 {
    2000
}
fn default_max_idle_rounds() -> u32 {
    10
}
fn default_round_delay_ms() -> u64 {
    1000
}
fn default_log() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_host: default_registry_host(),
            registry_port: default_registry_port(),
            peer_host: default_peer_host(),
            peer_port: 0,
            document_dir: default_document_dir(),
            goal: Vec::new(),
            lease_ttl_secs: default_lease_ttl_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            query_attempts: default_query_attempts(),
            query_retry_delay_ms: default_query_retry_delay_ms(),
            max_idle_rounds: default_max_idle_rounds(),
            round_delay_ms: default_round_delay_ms(),
            log: default_log(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

impl Config {
    pub fn registry_addr(&self) -> String {
        format!("{}:{}", self.registry_host, self.registry_port)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            tick_interval: Duration::from_secs(self.tick_interval_secs),
        }
    }

    /// Peer options aiming at `goal`; the configured goal wins when non-empty.
    pub fn peer_options(&self, found: &BTreeSet<DocumentId>) -> PeerOptions {
        let goal = if self.goal.is_empty() {
            found.clone()
        } else {
            self.goal.iter().cloned().collect()
        };
        PeerOptions {
            host: self.peer_host.clone(),
            port: self.peer_port,
            registry: PeerId::new(self.registry_host.clone(), self.registry_port),
            goal,
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            query_attempts: self.query_attempts,
            query_delay: Duration::from_millis(self.query_retry_delay_ms),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            max_idle_rounds: self.max_idle_rounds,
            round_delay: Duration::from_millis(self.round_delay_ms),
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    load_from(&config_paths(), |var| std::env::var(var).ok())
}

fn load_from(
    paths: &[PathBuf],
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(path) => load_file(path)?,
        None => Config::default(),
    };
    if let Some(s) = env("P2PDI_REGISTRY_HOST") {
        c.registry_host = s;
    }
    if let Some(s) = env("P2PDI_REGISTRY_PORT") {
        c.registry_port = parse_port("P2PDI_REGISTRY_PORT", s)?;
    }
    if let Some(s) = env("P2PDI_PEER_HOST") {
        c.peer_host = s;
    }
    if let Some(s) = env("P2PDI_PEER_PORT") {
        c.peer_port = parse_port("P2PDI_PEER_PORT", s)?;
    }
    if let Some(s) = env("P2PDI_DOCUMENT_DIR") {
        c.document_dir = PathBuf::from(s);
    }
    if let Some(s) = env("P2PDI_LOG") {
        c.log = s;
    }
    Ok(c)
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2pdi/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pdi/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let c = load_from(&[dir.path().join("missing.toml")], no_env).unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.registry_addr(), "127.0.0.1:65423");
        let opts = c.registry_options();
        assert_eq!(opts.lease_ttl, Duration::from_secs(7200));
        assert_eq!(opts.tick_interval, Duration::from_secs(5));
    }

    #[test]
    fn file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "registry_port = 7000\ngoal = [\"8451\", \"8464\"]\nquery_attempts = 5\n",
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("P2PDI_REGISTRY_HOST", "10.0.0.1"),
            ("P2PDI_PEER_PORT", "7100"),
            ("P2PDI_LOG", "debug"),
        ]
        .into_iter()
        .collect();
        let c = load_from(&[path], |v| env.get(v).map(|s| s.to_string())).unwrap();
        assert_eq!(c.registry_host, "10.0.0.1");
        assert_eq!(c.registry_port, 7000);
        assert_eq!(c.peer_port, 7100);
        assert_eq!(c.log, "debug");

        let opts = c.peer_options(&BTreeSet::new());
        assert_eq!(opts.registry, PeerId::new("10.0.0.1", 7000));
        assert_eq!(opts.query_attempts, 5);
        assert_eq!(opts.goal.len(), 2);
    }

    #[test]
    fn empty_goal_uses_found_documents() {
        let found: BTreeSet<DocumentId> = ["1".to_string(), "2".to_string()].into();
        let opts = Config::default().peer_options(&found);
        assert_eq!(opts.goal, found);
        assert_eq!(opts.query_delay, Duration::from_secs(2));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(matches!(
            load_from(&[path], no_env),
            Err(ConfigError::Parse { .. })
        ));

        let err = load_from(&[], |v| {
            (v == "P2PDI_REGISTRY_PORT").then(|| "not-a-port".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "P2PDI_REGISTRY_PORT", .. }));
    }
}
