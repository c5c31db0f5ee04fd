use anyhow::Context;
use clap::Parser;
use shotqueue::{setup_logging, Cli, CliRunner, Config, TransportConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting shotqueue v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config);

    // Graceful shutdown: workers finish the job in hand, then exit.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    if let Err(e) = cli_runner.run(args.command, shutdown_rx).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("shotqueue stopped");
    Ok(())
}

/// Config file first, then command line / environment overrides, then validation.
async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config: Config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("parsing {}", config_path.display()))?
    } else {
        Config::default()
    };

    if let Some(database_url) = &args.database_url {
        config.store.database_url = database_url.clone();
    }

    if !args.admin_ids.is_empty() {
        config.alerts.admin_ids = args.admin_ids.clone();
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.capture.chrome_path = Some(chrome_path.clone());
    }

    if let Some(token) = &args.bot_token {
        match &mut config.transport {
            TransportConfig::Telegram { bot_token, .. } => *bot_token = Some(token.clone()),
            TransportConfig::Directory { .. } => {
                warn!("BOT_TOKEN is set but the configured transport is a directory; ignoring it")
            }
        }
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Job store: {}", config.store.database_url);
    info!("Workers: {}", config.workers.count);
    info!(
        "Alerts: {} admins, level {}, debounce {}s",
        config.alerts.admin_ids.len(),
        config.alerts.level,
        config.alerts.debounce_secs
    );

    Ok(config)
}

fn setup_shutdown_handler(shutdown_tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                if signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT");
                    let _ = shutdown_tx.send(true);
                }
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(true);
    })
}
