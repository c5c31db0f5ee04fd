//! Configuration management with serde serialization/deserialization
//!
//! The whole process is configured by one immutable [`Config`] built at start-up
//! (JSON file, then CLI/env overrides, then [`Config::validate`]). Components never
//! see the full struct: each constructor takes only its own section.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the capture queue
///
/// # Examples
///
/// ```rust
/// use shotqueue::Config;
///
/// let config = Config::default();
/// assert_eq!(config.workers.count, 5);
///
/// let config = Config {
///     workers: shotqueue::WorkerConfig { count: 2, ..Default::default() },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Job store location and lease policy
    pub store: StoreConfig,

    /// Worker pool sizing and timing
    pub workers: WorkerConfig,

    /// Settings consumed by the rendering collaborator
    pub capture: CaptureConfig,

    /// Operator alerting
    pub alerts: AlertConfig,

    /// Where artifacts and user notices are delivered
    pub transport: TransportConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.store.database_url.is_empty() {
            return Err(config_error("store.database_url must not be empty"));
        }
        if self.store.max_connections == 0 {
            return Err(config_error("store.max_connections must be greater than 0"));
        }
        if self.store.max_attempts == 0 {
            return Err(config_error("store.max_attempts must be greater than 0"));
        }
        if self.store.lease_secs <= self.workers.heartbeat_secs {
            return Err(config_error(
                "store.lease_secs must be longer than workers.heartbeat_secs",
            ));
        }
        if self.workers.count == 0 {
            return Err(config_error("workers.count must be greater than 0"));
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(config_error("workers.poll_interval_ms must be greater than 0"));
        }
        if self.workers.heartbeat_secs == 0 || self.workers.reap_interval_secs == 0 {
            return Err(config_error(
                "workers.heartbeat_secs and workers.reap_interval_secs must be greater than 0",
            ));
        }
        if self.capture.max_parts == 0 {
            return Err(config_error("capture.max_parts must be greater than 0"));
        }
        if self.capture.navigation_timeout_ms == 0 || self.capture.overall_timeout_ms == 0 {
            return Err(config_error("capture timeouts must be greater than 0"));
        }
        if self
            .capture
            .blocked_resource_types
            .iter()
            .any(|kind| kind.trim().is_empty())
        {
            return Err(config_error("capture.blocked_resource_types must not contain empty names"));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(config_error("capture.jpeg_quality must be within 1..=100"));
        }
        if self.alerts.destination == AlertDestination::Group && self.alerts.group_id.is_none() {
            return Err(config_error(
                "alerts.group_id is required when alerts.destination is \"group\"",
            ));
        }
        if let TransportConfig::Telegram { bot_token, .. } = &self.transport {
            if bot_token.as_deref().map_or(true, str::is_empty) {
                return Err(config_error("a Telegram bot token is required (BOT_TOKEN)"));
            }
        }

        Ok(())
    }
}

fn config_error(message: &str) -> CaptureError {
    CaptureError::Configuration(message.to_string())
}

/// SQLite job store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection URL (default: `sqlite://data/jobs.db`)
    pub database_url: String,

    /// Pool size; every worker holds at most one connection at a time (default: 8)
    pub max_connections: u32,

    /// How long SQLite waits on a locked database before failing (default: 5s)
    pub busy_timeout_ms: u64,

    /// Claim lease length (default: 120s)
    ///
    /// A running job whose lease is not renewed within this window is
    /// considered orphaned and handed back to the queue by the reaper.
    pub lease_secs: u64,

    /// Claims allowed before an orphaned job is failed instead of requeued (default: 3)
    pub max_attempts: u32,
}

impl StoreConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/jobs.db".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5_000,
            lease_secs: 120,
            max_attempts: 3,
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of independent polling workers (default: 5)
    pub count: usize,

    /// Sleep between polls of an empty queue (default: 2s)
    pub poll_interval_ms: u64,

    /// Lease renewal cadence while a job is running (default: 30s)
    pub heartbeat_secs: u64,

    /// Cadence of the orphaned-job sweep (default: 60s)
    pub reap_interval_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 5,
            poll_interval_ms: 2_000,
            heartbeat_secs: 30,
            reap_interval_secs: 60,
        }
    }
}

/// Settings consumed by the Chrome renderer
///
/// The worker pool enforces no per-job timeout of its own; these two timeouts
/// are the only bound on how long a worker stays busy with one job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Page navigation timeout (default: 25s)
    pub navigation_timeout_ms: u64,

    /// Ceiling for the whole capture, navigation included (default: 40s)
    pub overall_timeout_ms: u64,

    /// Content height up to which an undetermined plan is captured as one
    /// full-page image instead of slices (default: 15000px)
    pub fullpage_max_height_px: u32,

    /// Vertical overlap between consecutive slices (default: 80px)
    pub slice_overlap_px: u32,

    /// Maximum number of slices per job; taller pages are truncated (default: 10)
    pub max_parts: usize,

    /// PNGs larger than this are re-encoded as JPEG (default: 9.5MB)
    pub max_image_bytes: usize,

    /// JPEG quality used for the re-encode (default: 80)
    pub jpeg_quality: u8,

    /// Hide common cookie/consent/ad overlays before capturing (default: true)
    pub hide_common_overlays: bool,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Network resource types failed before they load, matched case-insensitively
    /// against CDP names such as `Media` or `WebSocket`
    /// (default: media, font, websocket). Empty disables interception.
    pub blocked_resource_types: Vec<String>,

    /// Reject URLs whose host is a literal loopback, private or link-local
    /// address (default: true)
    pub block_private_network: bool,
}

impl CaptureConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            navigation_timeout_ms: 25_000,
            overall_timeout_ms: 40_000,
            fullpage_max_height_px: 15_000,
            slice_overlap_px: 80,
            max_parts: 10,
            max_image_bytes: 9_500_000,
            jpeg_quality: 80,
            hide_common_overlays: true,
            chrome_path: None,
            blocked_resource_types: vec![
                "media".to_string(),
                "font".to_string(),
                "websocket".to_string(),
            ],
            block_private_network: true,
        }
    }
}

/// Minimum severity an alert needs to reach operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warn => write!(f, "warn"),
            AlertLevel::Error => write!(f, "error"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDestination {
    /// Direct message to every admin id
    Dm,
    /// One operator group chat
    Group,
}

/// Operator alerting settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,

    /// Alerts below this level are dropped (default: error)
    pub level: AlertLevel,

    /// Minimum time between two alerts sharing a key (default: 60s)
    pub debounce_secs: u64,

    pub destination: AlertDestination,

    pub group_id: Option<i64>,

    pub admin_ids: Vec<i64>,

    /// Strip query strings and long paths from URLs in alerts (default: true)
    pub mask_urls: bool,

    /// Queue depth at which enqueue raises a backlog warning (default: 50)
    pub queue_warn_depth: i64,
}

impl AlertConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: AlertLevel::Error,
            debounce_secs: 60,
            destination: AlertDestination::Dm,
            group_id: None,
            admin_ids: Vec::new(),
            mask_urls: true,
            queue_warn_depth: 50,
        }
    }
}

/// Delivery target for artifacts, user notices and alerts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Telegram Bot API
    Telegram {
        #[serde(default = "default_telegram_api")]
        api_base: String,
        /// Usually supplied through `BOT_TOKEN` rather than the config file
        #[serde(default)]
        bot_token: Option<String>,
    },
    /// Local directory, one sub-directory per user id
    Directory { root: PathBuf },
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Directory {
            root: PathBuf::from("data/outbox"),
        }
    }
}
