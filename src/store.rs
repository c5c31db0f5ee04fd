//! Durable job table with atomic state transitions.
//!
//! All cross-worker coordination goes through [`JobStore::claim_next`]: one
//! compare-and-swap `UPDATE` picks the oldest queued row and flips it to
//! `running`, so two workers can never hold the same job.

use crate::{CaptureError, CaptureFlags, StoreConfig};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'done', 'failed')),
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    error TEXT,
    params TEXT NOT NULL DEFAULT '{}',
    lease_expires_at INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS jobs_status_order ON jobs (status, created_at, id);
"#;

const JOB_COLUMNS: &str = "id, user_id, url, status, created_at, started_at, finished_at, error, params, attempts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CaptureError::Storage(format!("unknown job status {other:?}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capture request and its lifecycle record.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub params: CaptureFlags,
    pub attempts: i64,
}

impl Job {
    /// Time since the job was enqueued.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    fn from_row(row: &SqliteRow) -> Result<Self, CaptureError> {
        let status: String = row.try_get("status")?;
        let params: String = row.try_get("params")?;

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            url: row.try_get("url")?,
            status: status.parse()?,
            created_at: from_millis(row.try_get("created_at")?),
            started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
            finished_at: row.try_get::<Option<i64>, _>("finished_at")?.map(from_millis),
            error: row.try_get("error")?,
            params: CaptureFlags::from_json(&params),
            attempts: row.try_get("attempts")?,
        })
    }
}

/// Outcome of one orphan sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: u64,
    pub failed: u64,
}

pub struct JobStore {
    pool: SqlitePool,
    lease: Duration,
    max_attempts: u32,
}

impl JobStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, CaptureError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool, config).await?;
        info!("Job store ready at {}", config.database_url);
        Ok(store)
    }

    /// Wrap an existing pool and make sure the schema exists.
    pub async fn from_pool(pool: SqlitePool, config: &StoreConfig) -> Result<Self, CaptureError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self {
            pool,
            lease: config.lease(),
            max_attempts: config.max_attempts,
        })
    }

    pub async fn enqueue(
        &self,
        user_id: i64,
        url: &str,
        params: &CaptureFlags,
    ) -> Result<i64, CaptureError> {
        let params = serde_json::to_string(params)?;

        let job_id = sqlx::query(
            r#"
INSERT INTO jobs (user_id, url, status, created_at, params)
VALUES (?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(url)
        .bind(now_millis())
        .bind(params)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!("Enqueued job {} for user {}: {}", job_id, user_id, url);
        Ok(job_id)
    }

    /// Claim the oldest queued job, or `None` when the queue is empty.
    ///
    /// The select and the conditional update are one statement inside one
    /// transaction; an error drops the transaction uncommitted and the job
    /// stays queued.
    pub async fn claim_next(&self) -> Result<Option<Job>, CaptureError> {
        let now = now_millis();
        let lease_expires_at = now.saturating_add(duration_millis(self.lease));

        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let row = sqlx::query(&format!(
            r#"
UPDATE jobs
SET status = 'running',
    started_at = ?,
    lease_expires_at = ?,
    attempts = attempts + 1
WHERE id = (
    SELECT id FROM jobs
    WHERE status = 'queued'
    ORDER BY created_at ASC, id ASC
    LIMIT 1
)
  AND status = 'queued'
RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(lease_expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        row.as_ref().map(Job::from_row).transpose()
    }

    /// Move a running job to `done` or `failed`.
    ///
    /// `attempt` is the [`Job::attempts`] value returned by the claim. Rows
    /// that are not `running`, or were claimed again since, are left
    /// untouched; the return value tells whether a transition happened.
    pub async fn complete(
        &self,
        job_id: i64,
        attempt: i64,
        ok: bool,
        error: Option<&str>,
    ) -> Result<bool, CaptureError> {
        let (status, error) = if ok {
            (JobStatus::Done, None)
        } else {
            (JobStatus::Failed, Some(error.unwrap_or("unknown error")))
        };

        let rows_affected = sqlx::query(
            r#"
UPDATE jobs
SET status = ?,
    finished_at = ?,
    error = ?,
    lease_expires_at = NULL
WHERE id = ? AND status = 'running' AND attempts = ?
            "#,
        )
        .bind(status.as_str())
        .bind(now_millis())
        .bind(error)
        .bind(job_id)
        .bind(attempt)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            warn!(
                "Job {} is no longer held by attempt {}; completion as {} ignored",
                job_id, attempt, status
            );
        }
        Ok(rows_affected > 0)
    }

    /// Extend the lease of a job that is still running under `attempt`.
    pub async fn renew_lease(&self, job_id: i64, attempt: i64) -> Result<bool, CaptureError> {
        let lease_expires_at = now_millis().saturating_add(duration_millis(self.lease));

        let rows_affected = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ? WHERE id = ? AND status = 'running' AND attempts = ?",
        )
        .bind(lease_expires_at)
        .bind(job_id)
        .bind(attempt)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Hand orphaned running jobs (expired lease) back to the queue.
    ///
    /// Jobs that already used up their attempts are failed instead.
    /// `created_at` is kept, so a requeued job keeps its place in line.
    pub async fn reap_expired(&self) -> Result<ReapReport, CaptureError> {
        let now = now_millis();
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let failed = sqlx::query(
            r#"
UPDATE jobs
SET status = 'failed',
    finished_at = ?,
    error = 'lease expired',
    lease_expires_at = NULL
WHERE status = 'running'
  AND lease_expires_at IS NOT NULL
  AND lease_expires_at <= ?
  AND attempts >= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(i64::from(self.max_attempts))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
UPDATE jobs
SET status = 'queued',
    started_at = NULL,
    lease_expires_at = NULL
WHERE status = 'running'
  AND lease_expires_at IS NOT NULL
  AND lease_expires_at <= ?
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let report = ReapReport { requeued, failed };
        if report != ReapReport::default() {
            warn!(
                "Reaped orphaned jobs: {} requeued, {} failed",
                report.requeued, report.failed
            );
        }
        Ok(report)
    }

    /// 1-based position among unfinished jobs; 0 if missing or finished.
    pub async fn position_of(&self, job_id: i64) -> Result<i64, CaptureError> {
        let position: i64 = sqlx::query_scalar(
            r#"
SELECT COUNT(*)
FROM jobs AS other, jobs AS target
WHERE target.id = ?
  AND target.status IN ('queued', 'running')
  AND other.status IN ('queued', 'running')
  AND (other.created_at < target.created_at
       OR (other.created_at = target.created_at AND other.id <= target.id))
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(position)
    }

    /// Number of unfinished (queued or running) jobs.
    pub async fn depth(&self) -> Result<i64, CaptureError> {
        let depth: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'running')")
                .fetch_one(&self.pool)
                .await?;

        Ok(depth)
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<Job>, CaptureError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Job::from_row).transpose()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    /// Store on a throwaway database file; in-memory SQLite would give every
    /// pooled connection its own database.
    pub(crate) async fn temp_store(config: StoreConfig) -> JobStore {
        let path = std::env::temp_dir().join(format!("shotqueue-test-{}.db", uuid::Uuid::new_v4()));
        let config = StoreConfig {
            database_url: format!("sqlite://{}", path.display()),
            ..config
        };
        JobStore::connect(&config).await.expect("temp store should open")
    }

    async fn store() -> JobStore {
        temp_store(StoreConfig::default()).await
    }

    #[tokio::test]
    async fn test_enqueue_and_claim_in_fifo_order() {
        let store = store().await;
        let a = assert_ok!(store.enqueue(1, "https://a.example", &CaptureFlags::default()).await);
        let b = assert_ok!(store.enqueue(2, "https://b.example", &CaptureFlags::default()).await);

        let first = store.claim_next().await.unwrap().expect("job a");
        assert_eq!(first.id, a);
        assert_eq!(first.status, JobStatus::Running);
        assert!(first.started_at.is_some());
        assert_eq!(first.attempts, 1);

        let second = store.claim_next().await.unwrap().expect("job b");
        assert_eq!(second.id, b);

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_params_round_trip_through_store() {
        let store = store().await;
        let flags = CaptureFlags::parse("--desktop --pdf --delay=1200");
        let id = store.enqueue(7, "https://example.com", &flags).await.unwrap();

        let job = store.get(id).await.unwrap().expect("job");
        assert_eq!(job.params, flags);
        assert_eq!(job.user_id, 7);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_single_job_once() {
        let store = Arc::new(store().await);
        store.enqueue(1, "https://only.example", &CaptureFlags::default()).await.unwrap();

        let claims = futures::future::join_all((0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next().await })
        }))
        .await;

        let winners = claims
            .into_iter()
            .map(|handle| handle.expect("task").expect("claim"))
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_duplicate() {
        let store = Arc::new(store().await);
        for i in 0..40 {
            store.enqueue(i, "https://many.example", &CaptureFlags::default()).await.unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(job) = store.claim_next().await.expect("claim") {
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(total, 40);
        assert_eq!(all.len(), 40);
    }

    #[tokio::test]
    async fn test_position_and_depth() {
        let store = store().await;
        assert_eq!(store.depth().await.unwrap(), 0);

        let a = store.enqueue(1, "https://a.example", &CaptureFlags::default()).await.unwrap();
        let b = store.enqueue(1, "https://b.example", &CaptureFlags::default()).await.unwrap();
        let c = store.enqueue(2, "https://c.example", &CaptureFlags::default()).await.unwrap();
        assert_eq!(store.depth().await.unwrap(), 3);

        assert_eq!(store.position_of(a).await.unwrap(), 1);
        assert_eq!(store.position_of(b).await.unwrap(), 2);
        assert_eq!(store.position_of(c).await.unwrap(), 3);
        assert_eq!(store.position_of(9_999).await.unwrap(), 0);

        // Running jobs still count as ahead in line.
        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, a);
        assert_eq!(store.position_of(c).await.unwrap(), 3);

        store.complete(a, claimed.attempts, true, None).await.unwrap();
        assert_eq!(store.depth().await.unwrap(), 2);
        assert_eq!(store.position_of(a).await.unwrap(), 0);
        assert_eq!(store.position_of(b).await.unwrap(), 1);
        assert_eq!(store.position_of(c).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = store().await;
        let id = store.enqueue(1, "https://a.example", &CaptureFlags::default()).await.unwrap();

        // Not running yet: nothing happens.
        assert!(!store.complete(id, 0, true, None).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Queued);

        let job = store.claim_next().await.unwrap().unwrap();
        assert!(store.complete(id, job.attempts, false, Some("boom")).await.unwrap());
        let failed = store.get(id).await.unwrap().unwrap();

        assert!(!store.complete(id, job.attempts, true, None).await.unwrap());
        let after = store.get(id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.error.as_deref(), Some("boom"));
        assert_eq!(after.finished_at, failed.finished_at);
    }

    #[tokio::test]
    async fn test_reaper_requeues_expired_leases() {
        let store = temp_store(StoreConfig {
            lease_secs: 0,
            max_attempts: 2,
            ..StoreConfig::default()
        })
        .await;
        let id = store.enqueue(1, "https://a.example", &CaptureFlags::default()).await.unwrap();
        let later = store.enqueue(1, "https://b.example", &CaptureFlags::default()).await.unwrap();

        let job = store.claim_next().await.unwrap().unwrap();
        assert_eq!(job.id, id);

        let report = store.reap_expired().await.unwrap();
        assert_eq!(report, ReapReport { requeued: 1, failed: 0 });

        let requeued = store.get(id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.started_at.is_none());
        assert_eq!(requeued.created_at, job.created_at);
        assert_eq!(store.position_of(id).await.unwrap(), 1);
        assert_eq!(store.position_of(later).await.unwrap(), 2);

        // Second claim uses the last attempt; the next expiry fails the job.
        let again = store.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);

        let report = store.reap_expired().await.unwrap();
        assert_eq!(report, ReapReport { requeued: 0, failed: 1 });
        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn test_live_lease_is_not_reaped() {
        let store = store().await;
        let id = store.enqueue(1, "https://a.example", &CaptureFlags::default()).await.unwrap();
        let job = store.claim_next().await.unwrap().unwrap();

        assert!(store.renew_lease(id, job.attempts).await.unwrap());
        assert_eq!(store.reap_expired().await.unwrap(), ReapReport::default());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Running);

        store.complete(id, job.attempts, true, None).await.unwrap();
        assert!(!store.renew_lease(id, job.attempts).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_touch_reclaimed_job() {
        let store = temp_store(StoreConfig {
            lease_secs: 0,
            ..StoreConfig::default()
        })
        .await;
        let id = store.enqueue(1, "https://a.example", &CaptureFlags::default()).await.unwrap();

        let stale = store.claim_next().await.unwrap().unwrap();
        assert_eq!(store.reap_expired().await.unwrap().requeued, 1);
        let current = store.claim_next().await.unwrap().unwrap();
        assert_eq!(current.id, id);
        assert_eq!((stale.attempts, current.attempts), (1, 2));

        // The first holder lost its lease; nothing it reports may land.
        assert!(!store.renew_lease(id, stale.attempts).await.unwrap());
        assert!(!store
            .complete(id, stale.attempts, false, Some("stale worker"))
            .await
            .unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.error.is_none());

        assert!(store.complete(id, current.attempts, true, None).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.error.is_none());
    }
}
