//! TOML configuration with environment overrides.
//!
//! Resolution: `--config <path>` if given, else `~/.cardlink/config.toml`.
//! A missing file means defaults. `CARDLINK_*` variables win over the file.

use crate::auth::credential::MIN_SECRET_LEN;
use crate::realtime::ConnectionSettings;
use anyhow::{bail, Context, Result};
use directories::UserDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATABASE_PATH: &str = "~/.cardlink/cardlink.db";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    pub server: ServerConfig,
    pub secrets: SecretsConfig,
    pub session: SessionConfig,
    pub cards: CardsConfig,
    pub password: PasswordConfig,
    pub database: DatabaseConfig,
    pub realtime: RealtimeConfig,
    pub rate_limit: RateLimitConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public URL printed in card entry links by `cardgen`.
    pub base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            base_url: None,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// HMAC key for card token signatures.
    pub card_token_secret: Option<String>,
    /// HS256 key for session credentials.
    pub session_secret: Option<String>,
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("card_token_secret", &self.card_token_secret.as_ref().map(|_| "***"))
            .field("session_secret", &self.session_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CardsConfig {
    /// How long a provisioned pair stays registrable.
    pub pair_ttl_secs: u64,
    /// How often expired pairs and sessions are swept.
    pub sweep_interval_secs: u64,
}

impl Default for CardsConfig {
    fn default() -> Self {
        Self {
            pair_ttl_secs: 30 * 24 * 3600,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_DATABASE_PATH.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub outbound_queue: usize,
    pub ping_interval_secs: u64,
    pub read_deadline_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        let defaults = ConnectionSettings::default();
        Self {
            outbound_queue: defaults.outbound_queue,
            ping_interval_secs: defaults.ping_interval.as_secs(),
            read_deadline_secs: defaults.read_deadline.as_secs(),
            write_timeout_secs: defaults.write_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Register/login attempts per client per minute. 0 disables the limit.
    pub auth_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `tracing` filter; `RUST_LOG` overrides it.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config {}", config_path.display()))?;
            Self::from_toml(&contents)?
        } else if path.is_some() {
            bail!("Config file {} does not exist", config_path.display());
        } else {
            Self::default()
        };
        config.config_path = config_path;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))
    }

    /// Apply `CARDLINK_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(secret) = lookup("CARDLINK_CARD_TOKEN_SECRET") {
            self.secrets.card_token_secret = Some(secret);
        }
        if let Some(secret) = lookup("CARDLINK_SESSION_SECRET") {
            self.secrets.session_secret = Some(secret);
        }
        if let Some(path) = lookup("CARDLINK_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(bind) = lookup("CARDLINK_BIND") {
            let (host, port) = bind
                .rsplit_once(':')
                .with_context(|| format!("CARDLINK_BIND must be host:port, got '{bind}'"))?;
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid port in CARDLINK_BIND: '{port}'"))?;
            self.server.host = host.trim_matches(['[', ']']).to_string();
        }
        Ok(())
    }

    /// Reject configurations the server cannot safely start with.
    pub fn validate(&self) -> Result<()> {
        check_secret("secrets.card_token_secret", self.secrets.card_token_secret.as_deref())?;
        check_secret("secrets.session_secret", self.secrets.session_secret.as_deref())?;

        if self.session.ttl_secs == 0 {
            bail!("session.ttl_secs must be greater than 0");
        }
        if self.cards.pair_ttl_secs == 0 {
            bail!("cards.pair_ttl_secs must be greater than 0");
        }
        if self.cards.sweep_interval_secs == 0 {
            bail!("cards.sweep_interval_secs must be greater than 0");
        }
        if self.password.iterations == 0 || self.password.memory_kib < 8 {
            bail!("password.iterations must be > 0 and password.memory_kib >= 8");
        }
        if self.database.path.trim().is_empty() {
            bail!("database.path cannot be empty");
        }

        let rt = &self.realtime;
        for (name, value) in [
            ("realtime.outbound_queue", rt.outbound_queue as u64),
            ("realtime.ping_interval_secs", rt.ping_interval_secs),
            ("realtime.read_deadline_secs", rt.read_deadline_secs),
            ("realtime.write_timeout_secs", rt.write_timeout_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }
        if rt.ping_interval_secs >= rt.read_deadline_secs {
            bail!("realtime.ping_interval_secs must be shorter than realtime.read_deadline_secs");
        }
        Ok(())
    }

    /// Card token HMAC key. Call after [`Config::validate`].
    pub fn card_token_secret(&self) -> &[u8] {
        self.secrets
            .card_token_secret
            .as_deref()
            .unwrap_or_default()
            .as_bytes()
    }

    /// Session signing key. Call after [`Config::validate`].
    pub fn session_secret(&self) -> &[u8] {
        self.secrets
            .session_secret
            .as_deref()
            .unwrap_or_default()
            .as_bytes()
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).into_owned())
    }

    pub fn bind_addr(&self) -> String {
        if self.server.host.contains(':') {
            format!("[{}]:{}", self.server.host, self.server.port)
        } else {
            format!("{}:{}", self.server.host, self.server.port)
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }

    pub fn pair_ttl(&self) -> Duration {
        Duration::from_secs(self.cards.pair_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cards.sweep_interval_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_queue: self.realtime.outbound_queue,
            ping_interval: Duration::from_secs(self.realtime.ping_interval_secs),
            read_deadline: Duration::from_secs(self.realtime.read_deadline_secs),
            write_timeout: Duration::from_secs(self.realtime.write_timeout_secs),
        }
    }
}

fn default_config_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".cardlink").join("config.toml"))
}

fn check_secret(name: &str, value: Option<&str>) -> Result<()> {
    match value {
        None => bail!("{name} is required"),
        Some(v) if v.len() < MIN_SECRET_LEN => {
            bail!("{name} must be at least {MIN_SECRET_LEN} bytes")
        }
        Some(_) => Ok(()),
    }
}
