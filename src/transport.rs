//! Outbound delivery of artifacts and text notices.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{format_bytes, sanitize_filename, Artifact, CaptureError, TransportConfig};

/// Chat-side collaborator used by workers and the alerter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one artifact to `user_id`, optionally captioned.
    async fn deliver(
        &self,
        user_id: i64,
        artifact: &Artifact,
        caption: Option<String>,
    ) -> Result<(), CaptureError>;

    /// Send a plain text message to `user_id`.
    async fn notify_user(&self, user_id: i64, text: &str) -> Result<(), CaptureError>;
}

/// Build the transport selected in the config.
pub fn build_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, CaptureError> {
    match config {
        TransportConfig::Telegram { api_base, bot_token } => {
            let token = bot_token
                .as_deref()
                .filter(|token| !token.is_empty())
                .ok_or_else(|| CaptureError::Configuration("missing Telegram bot token".into()))?;
            Ok(Arc::new(TelegramTransport::new(api_base, token)?))
        }
        TransportConfig::Directory { root } => Ok(Arc::new(DirectoryTransport::new(root))),
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramResponse {
    fn into_result(self, method: &str) -> Result<(), CaptureError> {
        if self.ok {
            Ok(())
        } else {
            Err(CaptureError::Delivery(format!(
                "{method}: {}",
                self.description.as_deref().unwrap_or("request rejected")
            )))
        }
    }
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    client: reqwest::Client,
    base: String,
}

impl TelegramTransport {
    pub fn new(api_base: &str, bot_token: &str) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base, method)
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn deliver(
        &self,
        user_id: i64,
        artifact: &Artifact,
        caption: Option<String>,
    ) -> Result<(), CaptureError> {
        let document = Part::bytes(artifact.bytes.clone())
            .file_name(artifact.filename.clone())
            .mime_str(&artifact.mime)?;

        let mut form = Form::new()
            .text("chat_id", user_id.to_string())
            .text("disable_content_type_detection", "true")
            .part("document", document);
        if let Some(caption) = caption {
            form = form.text("caption", caption);
        }

        let response: TelegramResponse = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        debug!(
            "sendDocument {} ({}) to {}",
            artifact.filename,
            format_bytes(artifact.bytes.len()),
            user_id
        );
        response.into_result("sendDocument")
    }

    async fn notify_user(&self, user_id: i64, text: &str) -> Result<(), CaptureError> {
        let response: TelegramResponse = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({ "chat_id": user_id, "text": text }))
            .send()
            .await?
            .json()
            .await?;

        response.into_result("sendMessage")
    }
}

/// Writes artifacts under `<root>/<user_id>/` and appends notices to
/// `<root>/<user_id>/messages.log`.
pub struct DirectoryTransport {
    root: PathBuf,
}

impl DirectoryTransport {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn user_dir(&self, user_id: i64) -> Result<PathBuf, CaptureError> {
        let dir = self.root.join(user_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn append_log(&self, user_id: i64, line: &str) -> Result<(), CaptureError> {
        let path = self.user_dir(user_id).await?.join("messages.log");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for DirectoryTransport {
    async fn deliver(
        &self,
        user_id: i64,
        artifact: &Artifact,
        caption: Option<String>,
    ) -> Result<(), CaptureError> {
        let filename = sanitize_filename(&artifact.filename);
        if filename.is_empty() {
            return Err(CaptureError::Delivery("artifact has no file name".into()));
        }

        let path = self.user_dir(user_id).await?.join(&filename);
        tokio::fs::write(&path, &artifact.bytes).await?;
        debug!("Wrote {} ({})", path.display(), format_bytes(artifact.bytes.len()));

        let line = match caption {
            Some(caption) => format!("[document] {filename} {caption}"),
            None => format!("[document] {filename}"),
        };
        self.append_log(user_id, &line).await
    }

    async fn notify_user(&self, user_id: i64, text: &str) -> Result<(), CaptureError> {
        self.append_log(user_id, text).await
    }
}
