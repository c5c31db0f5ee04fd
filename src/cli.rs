use crate::{
    build_transport, install_prometheus, Alerter, ChromeRenderer, Config, Intake, JobStore,
    Metrics, Renderer, Transport, WorkerContext, WorkerPool,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "shotqueue")]
#[command(about = "Durable web capture queue with a bounded worker pool")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "SHOTQUEUE_DATABASE_URL", help = "Job store URL, e.g. sqlite://data/jobs.db")]
    pub database_url: Option<String>,

    #[arg(long, env = "BOT_TOKEN", hide_env_values = true, help = "Telegram bot token")]
    pub bot_token: Option<String>,

    #[arg(
        long,
        env = "ADMIN_IDS",
        value_delimiter = ',',
        help = "Comma separated operator chat ids"
    )]
    pub admin_ids: Vec<i64>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue a capture request and print its position
    Enqueue {
        #[arg(long, help = "Requesting user (chat) id")]
        user: i64,

        #[arg(long, help = "Force PDF output")]
        pdf: bool,

        /// URL followed by optional flags (--desktop, --full, --slice, --pdf, --slow, --delay=N)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Run the worker pool until interrupted
    Work {
        #[arg(long, help = "Number of workers")]
        workers: Option<usize>,

        #[arg(long, help = "Serve Prometheus metrics on this address")]
        metrics_addr: Option<SocketAddr>,
    },

    /// Show queue depth, or one job and its position
    Status {
        #[arg(long, help = "Job id")]
        job: Option<i64>,
    },

    /// Requeue or fail jobs whose lease expired
    Reap,

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        match command {
            Commands::Enqueue { user, pdf, text } => self.run_enqueue(user, pdf, &text.join(" ")).await,
            Commands::Work {
                workers,
                metrics_addr,
            } => self.run_work(workers, metrics_addr, shutdown).await,
            Commands::Status { job } => self.run_status(job).await,
            Commands::Reap => self.run_reap().await,
            Commands::Validate { config } => validate_config_file(&config).await,
        }
    }

    async fn open_store(&self) -> anyhow::Result<Arc<JobStore>> {
        let store = JobStore::connect(&self.config.store)
            .await
            .with_context(|| format!("opening job store {}", self.config.store.database_url))?;
        Ok(Arc::new(store))
    }

    fn alerter(&self, transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Arc<Alerter> {
        Arc::new(Alerter::new(&self.config.alerts, transport, metrics))
    }

    pub async fn run_enqueue(&self, user_id: i64, force_pdf: bool, text: &str) -> anyhow::Result<()> {
        let store = self.open_store().await?;
        let metrics = Arc::new(Metrics::new());
        let transport = build_transport(&self.config.transport)?;
        let intake = Intake::new(
            store.clone(),
            self.alerter(transport, metrics.clone()),
            metrics,
            self.config.capture.block_private_network,
            self.config.alerts.queue_warn_depth,
        );

        let ticket = intake.submit(user_id, text, force_pdf).await?;
        println!("{ticket}");

        store.close().await;
        Ok(())
    }

    pub async fn run_work(
        &self,
        workers: Option<usize>,
        metrics_addr: Option<SocketAddr>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if let Some(addr) = metrics_addr {
            install_prometheus(addr)?;
        }
        let metrics = Arc::new(Metrics::new());

        let mut worker_config = self.config.workers.clone();
        if let Some(count) = workers {
            anyhow::ensure!(count > 0, "--workers must be greater than 0");
            worker_config.count = count;
        }

        let store = self.open_store().await?;
        let transport = build_transport(&self.config.transport)?;
        let renderer = Arc::new(
            ChromeRenderer::launch(&self.config.capture)
                .await
                .context("launching Chrome")?,
        );

        let ctx = WorkerContext {
            store: store.clone(),
            renderer: renderer.clone() as Arc<dyn Renderer>,
            transport: transport.clone(),
            alerter: self.alerter(transport, metrics.clone()),
            metrics,
        };
        let pool = WorkerPool::start(&worker_config, ctx);

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(
            "Processed {} jobs ({} failed) on {} workers before shutdown",
            pool.total_processed(),
            pool.total_errors(),
            pool.active_workers()
        );
        pool.shutdown().await;
        renderer.shutdown().await;
        store.close().await;
        Ok(())
    }

    pub async fn run_status(&self, job_id: Option<i64>) -> anyhow::Result<()> {
        let store = self.open_store().await?;

        match job_id {
            Some(job_id) => {
                let job = store
                    .get(job_id)
                    .await?
                    .with_context(|| format!("job {job_id} not found"))?;
                let position = store.position_of(job_id).await?;
                let depth = store.depth().await?;

                println!("Job #{}: {}", job.id, job.status);
                println!("  user:     {}", job.user_id);
                println!("  url:      {}", job.url);
                println!("  created:  {}", job.created_at.to_rfc3339());
                if let Some(started) = job.started_at {
                    println!("  started:  {}", started.to_rfc3339());
                }
                if let Some(finished) = job.finished_at {
                    println!("  finished: {}", finished.to_rfc3339());
                }
                if let Some(error) = &job.error {
                    println!("  error:    {error}");
                }
                println!("  attempts: {}", job.attempts);
                if !job.status.is_terminal() {
                    println!("  position: {position} of {depth}");
                }
            }
            None => println!("Queue depth: {}", store.depth().await?),
        }

        store.close().await;
        Ok(())
    }

    pub async fn run_reap(&self) -> anyhow::Result<()> {
        let store = self.open_store().await?;
        let report = store.reap_expired().await?;
        println!("Requeued {}, failed {}", report.requeued, report.failed);
        store.close().await;
        Ok(())
    }
}

/// Parse and validate a JSON config file without touching anything else.
pub async fn validate_config_file(path: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;

    println!("Configuration {} is valid", path.display());
    println!("  store:   {}", config.store.database_url);
    println!("  workers: {}", config.workers.count);
    println!("  alerts:  {} (level {})", if config.alerts.enabled { "on" } else { "off" }, config.alerts.level);
    Ok(())
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
