//! Debounced operator alerts.
//!
//! Every alert carries a key built from its level, its name and the masked
//! URL (or just the name when there is none). An alert is sent only if the
//! same key was not sent within the debounce window. The send time is
//! recorded as soon as the decision is made, whether or not delivery works.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{
    mask_url, truncate_chars, AlertConfig, AlertDestination, AlertLevel, CaptureError, Metrics,
    Transport,
};

const MAX_SUMMARY_CHARS: usize = 300;

/// Deduplication key of an alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub level: AlertLevel,
    pub subject: String,
}

/// Optional details attached to an error alert.
#[derive(Debug, Clone, Default)]
pub struct AlertContext {
    pub job_id: Option<i64>,
    pub url: Option<String>,
    pub user_id: Option<i64>,
    pub trace_id: Option<String>,
    pub worker: Option<usize>,
    pub job_age: Option<Duration>,
}

impl AlertContext {
    /// One-line summary of the identifying fields, for alerts without a URL.
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(job_id) = self.job_id {
            parts.push(format!("job: {job_id}"));
        }
        if let Some(worker) = self.worker {
            parts.push(format!("worker: {worker}"));
        }
        if let Some(trace_id) = &self.trace_id {
            parts.push(format!("trace: {trace_id}"));
        }
        parts.join(" | ")
    }
}

pub struct Alerter {
    config: AlertConfig,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
    last_sent: DashMap<AlertKey, Instant>,
}

impl Alerter {
    pub fn new(config: &AlertConfig, transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            config: config.clone(),
            transport,
            metrics,
            last_sent: DashMap::new(),
        }
    }

    /// Alert on `err` at the severity its kind maps to.
    ///
    /// Storage and configuration failures go out as critical, rejected input
    /// never alerts, everything else is an error alert.
    pub async fn report(&self, name: &str, err: &CaptureError, context: AlertContext) -> bool {
        let summary = err.to_string();

        match err.alert_level() {
            AlertLevel::Critical => self.critical(name, &summary, &context.describe()).await,
            AlertLevel::Error => self.error(name, &summary, context).await,
            AlertLevel::Warn => self.warn(name, &summary, context.url.as_deref()).await,
            AlertLevel::Info => {
                debug!("Not alerting on {}: {}", name, summary);
                false
            }
        }
    }

    /// Failure tied to a job; debounced per name and masked URL.
    pub async fn error(&self, name: &str, summary: &str, context: AlertContext) -> bool {
        let url = context.url.as_deref().map(|url| self.mask(url));
        let key = self.key(AlertLevel::Error, name, url.as_deref());

        let age = context
            .job_age
            .map(|age| format!("{}s", age.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        let text = format!(
            "❌ {name}\ntrace: {} | user: {} | worker: {}\nurl: {}\ncause: {}\nqueue age: {age}",
            context.trace_id.as_deref().unwrap_or("-"),
            display_or_dash(context.user_id),
            display_or_dash(context.worker),
            url.as_deref().unwrap_or("-"),
            truncate_chars(summary, MAX_SUMMARY_CHARS),
        );

        self.dispatch(key, &text, Instant::now()).await
    }

    /// Infrastructure failure; debounced per name.
    pub async fn critical(&self, name: &str, summary: &str, extra: &str) -> bool {
        let key = self.key(AlertLevel::Critical, name, None);
        let text = format!(
            "🚨 {name}\n{}\n{extra}",
            truncate_chars(summary, MAX_SUMMARY_CHARS)
        );

        self.dispatch(key, text.trim_end(), Instant::now()).await
    }

    pub async fn warn(&self, name: &str, summary: &str, url: Option<&str>) -> bool {
        let url = url.map(|url| self.mask(url));
        let key = self.key(AlertLevel::Warn, name, url.as_deref());
        let text = format!(
            "⚠️ {name}\n{}\n{}",
            truncate_chars(summary, MAX_SUMMARY_CHARS),
            url.as_deref().unwrap_or("")
        );

        self.dispatch(key, text.trim_end(), Instant::now()).await
    }

    /// Returns whether the alert passed the filters and was handed to the
    /// transport; delivery errors are logged and swallowed.
    async fn dispatch(&self, key: AlertKey, text: &str, now: Instant) -> bool {
        if !self.config.enabled || key.level < self.config.level {
            return false;
        }

        if !self.should_send_at(&key, now) {
            debug!("Suppressed {} alert {:?}", key.level, key.subject);
            self.metrics.record_alert(false);
            return false;
        }

        self.metrics.record_alert(true);
        self.send_to_operators(text).await;
        true
    }

    /// Debounce decision for `key` at `now`, recording `now` when it passes.
    pub fn should_send_at(&self, key: &AlertKey, now: Instant) -> bool {
        let window = self.config.debounce_window();

        match self.last_sent.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) >= window {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    async fn send_to_operators(&self, text: &str) {
        if self.config.destination == AlertDestination::Group {
            if let Some(group_id) = self.config.group_id {
                match self.transport.notify_user(group_id, text).await {
                    Ok(()) => return,
                    Err(e) => warn!("Alert to group {} failed, falling back to admins: {}", group_id, e),
                }
            }
        }

        for admin_id in &self.config.admin_ids {
            if let Err(e) = self.transport.notify_user(*admin_id, text).await {
                warn!("Alert to admin {} failed: {}", admin_id, e);
            }
        }
    }

    fn key(&self, level: AlertLevel, name: &str, masked_url: Option<&str>) -> AlertKey {
        let subject = match masked_url {
            Some(url) => format!("{name}:{url}"),
            None => name.to_string(),
        };
        AlertKey { level, subject }
    }

    fn mask(&self, url: &str) -> String {
        if self.config.mask_urls {
            mask_url(url)
        } else {
            url.to_string()
        }
    }
}

fn display_or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "-".to_string())
}
