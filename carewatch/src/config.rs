//! Engine configuration.
//!
//! Defaults, optionally overlaid by a JSON file (`CAREWATCH_CONFIG`), then by
//! `CAREWATCH_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::NotificationTemplate;
use crate::notification::channels::{WebhookAuth, WebhookConfig};
use crate::notification::directory::SubjectContacts;
use crate::{Error, Result};

/// Path of an optional JSON config file.
pub const CONFIG_PATH_ENV: &str = "CAREWATCH_CONFIG";

/// Path of an optional JSON seed file with contacts and templates.
pub const SEED_PATH_ENV: &str = "CAREWATCH_SEED";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
    pub escalation: EscalationConfig,
    pub sweep: SweepConfig,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:carewatch.db?mode=rwc".to_string(),
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Upper bound on channel sends in flight.
    pub max_concurrent_sends: usize,
    /// Per-send timeout; a send exceeding it counts as a timeout fault.
    pub send_timeout_secs: u64,
    /// Ceiling for the exponential retry backoff.
    pub max_retry_delay_secs: u64,
    /// Hard lifetime of a notification.
    pub notification_ttl_minutes: u32,
    /// Language used for template lookup.
    pub language: String,
    /// HTTP delivery gateway. Without one, sends are only logged.
    pub gateway: Option<WebhookConfig>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sends: 16,
            send_timeout_secs: 30,
            max_retry_delay_secs: 900,
            notification_ttl_minutes: 120,
            language: "en".to_string(),
            gateway: None,
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn notification_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.notification_ttl_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Deepest escalation level a chain may reach.
    pub max_depth: u32,
    /// How many of the top available contacts are notified up front.
    pub root_fanout: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            root_fanout: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Age after which a never-dispatched notification is dispatched by the sweep.
    pub stalled_grace_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            stalled_grace_secs: 30,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stalled_grace(&self) -> Duration {
        Duration::from_secs(self.stalled_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: String,
    pub retention_days: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            retention_days: 7,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl EngineConfig {
    /// Load `.env`, the optional JSON file and the environment, then validate.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    /// Overlay `CAREWATCH_*` variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("CAREWATCH_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(n) = get("CAREWATCH_DB_MAX_CONNECTIONS").and_then(|s| s.parse().ok()) {
            self.database.max_connections = n;
        }
        if let Some(n) = get("CAREWATCH_MAX_CONCURRENT_SENDS").and_then(|s| s.parse().ok()) {
            self.delivery.max_concurrent_sends = n;
        }
        if let Some(n) = get("CAREWATCH_SEND_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.delivery.send_timeout_secs = n;
        }
        if let Some(n) = get("CAREWATCH_MAX_RETRY_DELAY_SECS").and_then(|s| s.parse().ok()) {
            self.delivery.max_retry_delay_secs = n;
        }
        if let Some(n) = get("CAREWATCH_NOTIFICATION_TTL_MINUTES").and_then(|s| s.parse().ok()) {
            self.delivery.notification_ttl_minutes = n;
        }
        if let Some(language) = get("CAREWATCH_LANGUAGE") {
            self.delivery.language = language;
        }
        if let Some(url) = get("CAREWATCH_GATEWAY_URL") {
            let gateway = self.delivery.gateway.get_or_insert_with(WebhookConfig::default);
            gateway.url = url;
        }
        if let Some(token) = get("CAREWATCH_GATEWAY_TOKEN")
            && let Some(gateway) = self.delivery.gateway.as_mut()
        {
            gateway.auth = Some(WebhookAuth::Bearer { token });
        }
        if let Some(n) = get("CAREWATCH_MAX_ESCALATION_DEPTH").and_then(|s| s.parse().ok()) {
            self.escalation.max_depth = n;
        }
        if let Some(n) = get("CAREWATCH_ROOT_FANOUT").and_then(|s| s.parse().ok()) {
            self.escalation.root_fanout = n;
        }
        if let Some(flag) = get("CAREWATCH_SWEEP_ENABLED") {
            self.sweep.enabled = parse_flag(&flag);
        }
        if let Some(n) = get("CAREWATCH_SWEEP_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.sweep.interval_secs = n;
        }
        if let Some(n) = get("CAREWATCH_SWEEP_STALLED_GRACE_SECS").and_then(|s| s.parse().ok()) {
            self.sweep.stalled_grace_secs = n;
        }
        if let Some(dir) = get("CAREWATCH_LOG_DIR") {
            self.logging.dir = dir;
        }
        if let Some(n) = get("CAREWATCH_LOG_RETENTION_DAYS").and_then(|s| s.parse().ok()) {
            self.logging.retention_days = n;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(Error::config("database.url is empty"));
        }
        if self.database.max_connections == 0 {
            return Err(Error::config("database.max_connections must be > 0"));
        }
        if self.delivery.max_concurrent_sends == 0 {
            return Err(Error::config("delivery.max_concurrent_sends must be > 0"));
        }
        if self.delivery.send_timeout_secs == 0 {
            return Err(Error::config("delivery.send_timeout_secs must be > 0"));
        }
        if self.delivery.max_retry_delay_secs == 0 {
            return Err(Error::config("delivery.max_retry_delay_secs must be > 0"));
        }
        if self.delivery.notification_ttl_minutes == 0 {
            return Err(Error::config("delivery.notification_ttl_minutes must be > 0"));
        }
        if self.escalation.max_depth == 0 {
            return Err(Error::config("escalation.max_depth must be > 0"));
        }
        if self.escalation.root_fanout == 0 {
            return Err(Error::config("escalation.root_fanout must be > 0"));
        }
        if self.sweep.interval_secs == 0 {
            return Err(Error::config("sweep.interval_secs must be > 0"));
        }
        if let Some(gateway) = &self.delivery.gateway
            && gateway.url.trim().is_empty()
        {
            return Err(Error::config("delivery.gateway.url is empty"));
        }
        Ok(())
    }
}

/// Reference data for a standalone deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub contacts: Vec<SubjectContacts>,
    pub templates: Vec<NotificationTemplate>,
}

impl Seed {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let seed: Seed = serde_json::from_str(&content).map_err(|e| {
            Error::config(format!("invalid seed file {}: {}", path.display(), e))
        })?;
        for template in &seed.templates {
            template.validate()?;
        }
        Ok(seed)
    }

    /// Seed named by `CAREWATCH_SEED`, or an empty one.
    pub fn load() -> Result<Self> {
        match std::env::var(SEED_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }
}
