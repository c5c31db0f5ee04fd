use crate::{
    format_duration, truncate_chars, AlertContext, Alerter, Artifact, CaptureError, CapturePlan,
    Job, JobStore, Metrics, Renderer, Transport, WorkerConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const USER_ERROR_CHARS: usize = 300;

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<JobStore>,
    pub renderer: Arc<dyn Renderer>,
    pub transport: Arc<dyn Transport>,
    pub alerter: Arc<Alerter>,
    pub metrics: Arc<Metrics>,
}

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done { delivered: usize, total: usize },
    Failed { error: String },
}

impl JobOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, JobOutcome::Done { .. })
    }
}

#[derive(Clone)]
pub struct CaptureWorker {
    id: usize,
    ctx: WorkerContext,
    config: WorkerConfig,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl CaptureWorker {
    pub fn new(id: usize, ctx: WorkerContext, config: WorkerConfig) -> Self {
        Self {
            id,
            ctx,
            config,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Poll the store until `shutdown` flips to `true`.
    ///
    /// A job that was claimed always runs to completion first. Job failures
    /// never end the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting capture worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        while !*shutdown.borrow() {
            match self.poll_once().await {
                // Straight back to the queue after a job.
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    error!("Worker {} could not claim a job: {}", self.id, e);
                    let context = AlertContext {
                        worker: Some(self.id),
                        ..AlertContext::default()
                    };
                    self.ctx.alerter.report("JobStoreUnavailable", &e, context).await;
                }
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        info!("Capture worker {} stopped", self.id);
    }

    /// Claim and process at most one job.
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>, CaptureError> {
        let Some(job) = self.ctx.store.claim_next().await? else {
            return Ok(None);
        };
        Ok(Some(self.process(job).await))
    }

    async fn process(&self, job: Job) -> JobOutcome {
        let trace_id = short_trace_id();
        let started = Instant::now();
        self.ctx.metrics.jobs_claimed.increment(1);
        info!(
            "[{}] Worker {} picked job {} for user {}: {}",
            trace_id, self.id, job.id, job.user_id, job.url
        );

        let heartbeat = self.spawn_heartbeat(job.id, job.attempts);
        let plan = CapturePlan::from_flags(&job.params);
        debug!("[{}] Job {} plan: {:?}", trace_id, job.id, plan);

        let rendered = self.ctx.renderer.render(&job.url, &plan).await;
        self.ctx.metrics.record_capture(started.elapsed());

        let outcome = match rendered {
            Ok(artifacts) => self.deliver_all(&job, &trace_id, artifacts).await,
            Err(e) => self.report_render_failure(&job, &trace_id, e).await,
        };
        heartbeat.abort();

        let error = match &outcome {
            JobOutcome::Done { .. } => None,
            JobOutcome::Failed { error } => Some(error.as_str()),
        };
        match self
            .ctx
            .store
            .complete(job.id, job.attempts, outcome.is_done(), error)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                "[{}] Job {} was reclaimed or finished elsewhere; outcome dropped",
                trace_id, job.id
            ),
            Err(e) => {
                // The lease will lapse and the reaper hands the job out again.
                error!("[{}] Failed to record completion of job {}: {}", trace_id, job.id, e);
                self.ctx
                    .alerter
                    .report("JobStoreUnavailable", &e, self.alert_context(&job, &trace_id))
                    .await;
            }
        }

        self.ctx.metrics.record_completion(outcome.is_done());
        if outcome.is_done() {
            self.processed_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            "[{}] Job {} finished in {}: {:?}",
            trace_id,
            job.id,
            format_duration(started.elapsed()),
            outcome
        );
        outcome
    }

    async fn deliver_all(&self, job: &Job, trace_id: &str, artifacts: Vec<Artifact>) -> JobOutcome {
        let total = artifacts.len();
        let mut delivered = 0;

        for (index, artifact) in artifacts.iter().enumerate() {
            let caption = (total > 1).then(|| format!("Part {}/{}", index + 1, total));

            match self.ctx.transport.deliver(job.user_id, artifact, caption).await {
                Ok(()) => {
                    delivered += 1;
                    self.ctx.metrics.record_delivery(true);
                }
                Err(e) => {
                    warn!(
                        "[{}] Delivery of {} for job {} failed: {}",
                        trace_id, artifact.filename, job.id, e
                    );
                    self.ctx.metrics.record_delivery(false);
                    self.ctx
                        .alerter
                        .report("SendDocumentFailed", &e, self.alert_context(job, trace_id))
                        .await;
                }
            }
        }

        if delivered > 0 {
            JobOutcome::Done { delivered, total }
        } else {
            JobOutcome::Failed {
                error: format!("send failed: 0/{total} artifacts delivered"),
            }
        }
    }

    async fn report_render_failure(&self, job: &Job, trace_id: &str, err: CaptureError) -> JobOutcome {
        let error = err.to_string();
        error!("[{}] Job {} capture failed: {}", trace_id, job.id, error);

        let notice = format!(
            "❌ Capture failed:\n{}",
            truncate_chars(&error, USER_ERROR_CHARS)
        );
        if let Err(e) = self.ctx.transport.notify_user(job.user_id, &notice).await {
            warn!("[{}] Could not notify user {}: {}", trace_id, job.user_id, e);
        }

        self.ctx
            .alerter
            .report("WorkerCaptureFailed", &err, self.alert_context(job, trace_id))
            .await;

        JobOutcome::Failed { error }
    }

    fn alert_context(&self, job: &Job, trace_id: &str) -> AlertContext {
        AlertContext {
            job_id: Some(job.id),
            url: Some(job.url.clone()),
            user_id: Some(job.user_id),
            trace_id: Some(trace_id.to_string()),
            worker: Some(self.id),
            job_age: Some(job.age()),
        }
    }

    fn spawn_heartbeat(&self, job_id: i64, attempt: i64) -> JoinHandle<()> {
        let store = self.ctx.store.clone();
        let period = self.config.heartbeat_interval().max(Duration::from_millis(10));
        let worker_id = self.id;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; the claim already set the lease.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew_lease(job_id, attempt).await {
                    Ok(true) => debug!("Worker {} renewed lease of job {}", worker_id, job_id),
                    Ok(false) => break,
                    Err(e) => warn!("Worker {} could not renew lease of job {}: {}", worker_id, job_id, e),
                }
            }
        })
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running(),
            processed_count: self.processed_count(),
            error_count: self.error_count(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> usize {
        self.processed_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }
}

fn short_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

/// Fixed set of polling workers plus the orphaned-job reaper.
pub struct WorkerPool {
    workers: Vec<CaptureWorker>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn start(config: &WorkerConfig, ctx: WorkerContext) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(config.count);
        let mut handles = Vec::with_capacity(config.count + 1);

        for id in 0..config.count {
            let worker = CaptureWorker::new(id, ctx.clone(), config.clone());
            let runner = worker.clone();
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { runner.run(rx).await }));
            workers.push(worker);
        }

        handles.push(spawn_reaper(
            ctx.store.clone(),
            ctx.metrics.clone(),
            config.reap_interval(),
            shutdown_rx,
        ));

        info!("Worker pool started with {} workers", config.count);
        Self {
            workers,
            handles,
            shutdown,
        }
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.get_stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed_count()).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(|w| w.error_count()).sum()
    }

    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }

    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        info!("Stopping worker pool...");
        let _ = self.shutdown.send(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

/// Periodically requeue (or fail) jobs whose lease expired.
pub fn spawn_reaper(
    store: Arc<JobStore>,
    metrics: Arc<Metrics>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(10));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match store.reap_expired().await {
                Ok(report) => metrics.record_reap(&report),
                Err(e) => warn!("Reaper sweep failed: {}", e),
            }
            match store.depth().await {
                Ok(depth) => metrics.set_queue_depth(depth),
                Err(e) => debug!("Queue depth unavailable: {}", e),
            }
        }
        debug!("Reaper stopped");
    })
}
