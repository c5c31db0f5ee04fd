#[cfg(test)]
mod integration_tests {
    use crate::store::tests::temp_store;
    use crate::{
        AlertConfig, AlertDestination, AlertLevel, Alerter, Artifact, CaptureError, CaptureFlags,
        CapturePlan, CaptureWorker, Cli, Commands, Config, Device, DirectoryTransport, Intake,
        JobOutcome, JobStatus, JobStore, Metrics, MockRenderer, PageStrategy, StoreConfig,
        Transport, TransportConfig, WorkerConfig, WorkerContext,
    };
    use clap::Parser;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.workers.count, 5);
        assert_eq!(config.workers.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.store.lease(), Duration::from_secs(120));
        assert_eq!(config.store.max_attempts, 3);
        assert_eq!(config.capture.navigation_timeout(), Duration::from_secs(25));
        assert_eq!(config.capture.overall_timeout(), Duration::from_secs(40));
        assert_eq!(config.capture.fullpage_max_height_px, 15_000);
        assert_eq!(config.capture.slice_overlap_px, 80);
        assert_eq!(config.capture.max_parts, 10);
        assert!(config.capture.block_private_network);
        assert_eq!(config.capture.blocked_resource_types, vec!["media", "font", "websocket"]);
        assert_eq!(config.alerts.level, AlertLevel::Error);
        assert_eq!(config.alerts.debounce_window(), Duration::from_secs(60));
        assert_eq!(config.alerts.destination, AlertDestination::Dm);
        assert!(matches!(config.transport, TransportConfig::Directory { .. }));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "workers": { "count": 2 },
                "alerts": { "level": "warn", "destination": "group", "group_id": -1001 },
                "transport": { "kind": "telegram", "bot_token": "123:abc" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.workers.count, 2);
        assert_eq!(config.workers.heartbeat_secs, 30);
        assert_eq!(config.alerts.level, AlertLevel::Warn);
        assert_eq!(config.alerts.group_id, Some(-1001));
        match &config.transport {
            TransportConfig::Telegram { api_base, bot_token } => {
                assert_eq!(api_base, "https://api.telegram.org");
                assert_eq!(bot_token.as_deref(), Some("123:abc"));
            }
            other => panic!("unexpected transport {other:?}"),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.workers.count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.lease_secs = config.workers.heartbeat_secs;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.alerts.destination = AlertDestination::Group;
        assert!(config.validate().is_err());
        config.alerts.group_id = Some(-100);
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.capture.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.blocked_resource_types.push(" ".to_string());
        assert!(config.validate().is_err());
        config.capture.blocked_resource_types.clear();
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.transport = TransportConfig::Telegram {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: Some(String::new()),
        };
        assert!(matches!(config.validate(), Err(CaptureError::Configuration(_))));
    }

    #[test]
    fn test_error_alert_levels() {
        assert_eq!(CaptureError::InvalidUrl("x".into()).alert_level(), AlertLevel::Info);
        assert_eq!(CaptureError::Storage("locked".into()).alert_level(), AlertLevel::Critical);
        assert_eq!(CaptureError::Timeout(Duration::from_secs(40)).alert_level(), AlertLevel::Error);
        assert_eq!(
            CaptureError::Timeout(Duration::from_secs(40)).to_string(),
            "Timeout after 40s"
        );
    }

    #[test]
    fn test_plan_from_request_text() {
        let plan = CapturePlan::from_flags(&CaptureFlags::parse(
            "https://example.com --desktop --slow --slice",
        ));
        assert_eq!(plan.device, Device::Desktop);
        assert_eq!(plan.page_strategy, PageStrategy::Slice);
        assert_eq!(plan.delay(), Some(Duration::from_secs(7)));

        let profile = plan.device.profile();
        assert_eq!((profile.width, profile.height), (1920, 1080));
        assert_eq!(Device::Mobile.profile().device_scale_factor, 4.0);
    }

    #[test]
    fn test_cli_enqueue_keeps_flags() {
        let cli = Cli::try_parse_from([
            "shotqueue",
            "enqueue",
            "--user",
            "42",
            "https://example.com",
            "--desktop",
            "--delay=500",
        ])
        .unwrap();

        match cli.command {
            Commands::Enqueue { user, pdf, text } => {
                assert_eq!(user, 42);
                assert!(!pdf);
                assert_eq!(text.join(" "), "https://example.com --desktop --delay=500");
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_cli_work_and_status() {
        let cli = Cli::try_parse_from(["shotqueue", "work", "--workers", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Work { workers: Some(3), metrics_addr: None }));

        let cli = Cli::try_parse_from(["shotqueue", "status", "--job", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { job: Some(7) }));

        assert!(Cli::try_parse_from(["shotqueue", "enqueue", "--user", "1"]).is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_fifo_and_failed_completion() {
        let store = temp_store(StoreConfig::default()).await;

        let a = store.enqueue(1, "https://a.example", &CaptureFlags::default()).await.unwrap();
        let b = store.enqueue(2, "https://b.example", &CaptureFlags::default()).await.unwrap();
        assert_eq!(store.depth().await.unwrap(), 2);

        let claimed = store.claim_next().await.unwrap().expect("A is claimable");
        assert_eq!(claimed.id, a);

        assert!(store.complete(a, claimed.attempts, false, Some("navigation timeout")).await.unwrap());

        let job = store.get(a).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("navigation timeout"));
        assert!(job.finished_at.is_some());

        assert_eq!(store.depth().await.unwrap(), 1);
        assert_eq!(store.position_of(b).await.unwrap(), 1);
        assert_eq!(store.claim_next().await.unwrap().map(|job| job.id), Some(b));
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let path = std::env::temp_dir().join(format!("shotqueue-reopen-{}.db", uuid::Uuid::new_v4()));
        let config = StoreConfig {
            database_url: format!("sqlite://{}", path.display()),
            ..StoreConfig::default()
        };

        let store = JobStore::connect(&config).await.unwrap();
        let id = store
            .enqueue(9, "https://example.com", &CaptureFlags::parse("--pdf"))
            .await
            .unwrap();
        store.close().await;

        let reopened = JobStore::connect(&config).await.unwrap();
        let job = reopened.claim_next().await.unwrap().expect("job persisted");
        assert_eq!(job.id, id);
        assert!(job.params.pdf);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_intake_to_directory_delivery() {
        let store = Arc::new(temp_store(StoreConfig::default()).await);
        let outbox = std::env::temp_dir().join(format!("shotqueue-outbox-{}", uuid::Uuid::new_v4()));
        let transport: Arc<dyn Transport> = Arc::new(DirectoryTransport::new(&outbox));
        let metrics = Arc::new(Metrics::noop());
        let alerter = Arc::new(Alerter::new(&AlertConfig::default(), transport.clone(), metrics.clone()));

        let intake = Intake::new(store.clone(), alerter.clone(), metrics.clone(), true, 50);
        let ticket = intake
            .submit(42, "https://example.com/long --slice", false)
            .await
            .unwrap();
        assert_eq!((ticket.position, ticket.depth), (1, 1));
        assert!(intake.submit(42, "http://127.0.0.1/admin", false).await.is_err());

        let mut renderer = MockRenderer::new();
        renderer
            .expect_render()
            .withf(|_, plan| plan.page_strategy == PageStrategy::Slice)
            .times(1)
            .returning(|_, _| {
                Ok(vec![
                    Artifact::png(vec![1, 2, 3], "screenshot_01.png"),
                    Artifact::png(vec![4, 5, 6], "screenshot_02.png"),
                ])
            });

        let ctx = WorkerContext {
            store: store.clone(),
            renderer: Arc::new(renderer),
            transport,
            alerter,
            metrics,
        };
        let worker = CaptureWorker::new(0, ctx, WorkerConfig::default());

        let outcome = worker.poll_once().await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Done { delivered: 2, total: 2 }));

        let user_dir = outbox.join("42");
        assert_eq!(std::fs::read(user_dir.join("screenshot_02.png")).unwrap(), vec![4, 5, 6]);
        let log = std::fs::read_to_string(user_dir.join("messages.log")).unwrap();
        assert!(log.contains("screenshot_01.png Part 1/2"));

        let job = store.get(ticket.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(store.depth().await.unwrap(), 0);

        let _ = std::fs::remove_dir_all(outbox);
    }
}
