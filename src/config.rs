use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::engine::Endpoint;

/// Watcher used when the configuration declares none.
pub const DEFAULT_WATCHER: &str = "local";

/// Provider tables keyed by provider type, then component name.
pub type ComponentTables = BTreeMap<String, BTreeMap<String, toml::Value>>;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub watchers: BTreeMap<String, WatcherConfig>,
    #[serde(default)]
    pub registries: ComponentTables,
    #[serde(default)]
    pub triggers: ComponentTables,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Allow `DELETE /api/containers/{id}`.
    #[serde(default)]
    pub delete_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Skip SQLite entirely; records live only as long as the process.
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            in_memory: false,
        }
    }
}

fn default_store_path() -> String {
    "store/tagwatch.db".into()
}

/// Install orchestration timing.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long to wait for a running container with a new image.
    #[serde(default = "default_image_update_timeout_secs")]
    pub image_update_timeout_secs: u64,
    /// How long to wait for the forced watcher scan to finish.
    #[serde(default = "default_rescan_timeout_secs")]
    pub rescan_timeout_secs: u64,
    #[serde(default = "default_cleanup_attempts")]
    pub cleanup_attempts: u32,
    #[serde(default = "default_cleanup_backoff_ms")]
    pub cleanup_backoff_ms: u64,
    /// Script output stays readable this long after the script ends.
    #[serde(default = "default_output_retention_secs")]
    pub output_retention_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            image_update_timeout_secs: default_image_update_timeout_secs(),
            rescan_timeout_secs: default_rescan_timeout_secs(),
            cleanup_attempts: default_cleanup_attempts(),
            cleanup_backoff_ms: default_cleanup_backoff_ms(),
            output_retention_secs: default_output_retention_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_image_update_timeout_secs() -> u64 {
    300
}

fn default_rescan_timeout_secs() -> u64 {
    120
}

fn default_cleanup_attempts() -> u32 {
    3
}

fn default_cleanup_backoff_ms() -> u64 {
    2000
}

fn default_output_retention_secs() -> u64 {
    600
}

/// One container-engine host to watch.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_socket")]
    pub socket: String,
    /// TCP host; takes precedence over `socket` when set.
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "enabled")]
    pub watchbydefault: bool,
    #[serde(default)]
    pub watchall: bool,
    #[serde(default = "enabled")]
    pub watchevents: bool,
    #[serde(default = "enabled")]
    pub watchatstart: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            host: None,
            port: default_port(),
            cron: default_cron(),
            watchbydefault: true,
            watchall: false,
            watchevents: true,
            watchatstart: true,
        }
    }
}

impl WatcherConfig {
    pub fn endpoint(&self) -> Endpoint {
        match &self.host {
            Some(host) if !host.is_empty() => Endpoint::Tcp {
                host: host.clone(),
                port: self.port,
            },
            _ => Endpoint::Socket(self.socket.clone()),
        }
    }
}

fn default_socket() -> String {
    "/var/run/docker.sock".into()
}

fn default_port() -> u16 {
    2375
}

fn default_cron() -> String {
    "0 * * * *".into()
}

fn enabled() -> bool {
    true
}

/// Parse a cron expression. Five-field crontab syntax gets a leading seconds field.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {expr}"))
    } else {
        cron::Schedule::from_str(expr)
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Configured watchers, or the default local socket watcher.
    pub fn watchers(&self) -> BTreeMap<String, WatcherConfig> {
        if self.watchers.is_empty() {
            let mut defaults = BTreeMap::new();
            defaults.insert(DEFAULT_WATCHER.to_string(), WatcherConfig::default());
            return defaults;
        }
        self.watchers
            .iter()
            .map(|(name, config)| (name.to_lowercase(), config.clone()))
            .collect()
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            self.store.in_memory || !self.store.path.is_empty(),
            "store.path must be non-empty"
        );
        anyhow::ensure!(
            self.install.poll_interval_ms > 0,
            "install.poll_interval_ms must be > 0, got {}",
            self.install.poll_interval_ms
        );
        anyhow::ensure!(
            self.install.image_update_timeout_secs > 0,
            "install.image_update_timeout_secs must be > 0, got {}",
            self.install.image_update_timeout_secs
        );
        anyhow::ensure!(
            self.install.rescan_timeout_secs > 0,
            "install.rescan_timeout_secs must be > 0, got {}",
            self.install.rescan_timeout_secs
        );
        anyhow::ensure!(
            self.install.cleanup_attempts > 0,
            "install.cleanup_attempts must be > 0, got {}",
            self.install.cleanup_attempts
        );
        for (name, watcher) in &self.watchers {
            anyhow::ensure!(
                parse_cron(&watcher.cron).is_ok(),
                "watchers.{}.cron is not a valid cron expression: {}",
                name,
                watcher.cron
            );
            anyhow::ensure!(
                watcher.host.is_some() || !watcher.socket.is_empty(),
                "watchers.{} needs a socket or a host",
                name
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_gets_seconds() {
        let schedule = parse_cron("0 * * * *").unwrap();
        let now = chrono::Local::now();
        let next = schedule.after(&now).next().unwrap();
        assert_eq!(next.format("%M:%S").to_string(), "00:00");
        assert!(parse_cron("0 0 * * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn host_takes_precedence_over_socket() {
        let config = WatcherConfig {
            host: Some("10.0.0.2".into()),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint(),
            Endpoint::Tcp {
                host: "10.0.0.2".into(),
                port: 2375
            }
        );
        assert_eq!(
            WatcherConfig::default().endpoint(),
            Endpoint::Socket("/var/run/docker.sock".into())
        );
    }
}
