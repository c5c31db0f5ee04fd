//! Request intake: validate, enqueue, report the caller's place in line.

use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::{validate_url, Alerter, CaptureError, CaptureFlags, JobStore, Metrics};

/// Queue feedback returned to the requester after enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTicket {
    pub job_id: i64,
    /// 1-based position among unfinished jobs.
    pub position: i64,
    /// Total unfinished jobs.
    pub depth: i64,
}

impl fmt::Display for QueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job #{} queued, position {} of {}",
            self.job_id, self.position, self.depth
        )
    }
}

pub struct Intake {
    store: Arc<JobStore>,
    alerter: Arc<Alerter>,
    metrics: Arc<Metrics>,
    block_private_network: bool,
    queue_warn_depth: i64,
}

impl Intake {
    pub fn new(
        store: Arc<JobStore>,
        alerter: Arc<Alerter>,
        metrics: Arc<Metrics>,
        block_private_network: bool,
        queue_warn_depth: i64,
    ) -> Self {
        Self {
            store,
            alerter,
            metrics,
            block_private_network,
            queue_warn_depth,
        }
    }

    /// Enqueue a capture request such as `https://example.com --desktop`.
    ///
    /// The first token must be the URL. Invalid requests never reach the
    /// store and never alert. `force_pdf` sets the pdf flag whatever the text says.
    pub async fn submit(
        &self,
        user_id: i64,
        text: &str,
        force_pdf: bool,
    ) -> Result<QueueTicket, CaptureError> {
        let url = text
            .split_whitespace()
            .next()
            .ok_or_else(|| CaptureError::InvalidUrl("no URL given".to_string()))?;
        validate_url(url, self.block_private_network)?;

        let mut flags = CaptureFlags::parse(text);
        flags.pdf |= force_pdf;

        let job_id = self.store.enqueue(user_id, url, &flags).await?;
        self.metrics.jobs_enqueued.increment(1);

        let position = self.store.position_of(job_id).await?;
        let depth = self.store.depth().await?;
        self.metrics.set_queue_depth(depth);

        info!(
            "Job {} queued for user {} at position {}/{}",
            job_id, user_id, position, depth
        );

        if depth >= self.queue_warn_depth {
            self.alerter
                .warn(
                    "QueueBacklog",
                    &format!("{depth} unfinished jobs in the queue"),
                    None,
                )
                .await;
        }

        Ok(QueueTicket {
            job_id,
            position,
            depth,
        })
    }
}
