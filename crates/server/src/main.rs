use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info};

use vaiz_core::issue_tracker::init_issue_tracker;
use vaiz_core::logging::{ensure_stderr_destination, init_logging};
use vaiz_core::{init_error_registry, Config, ErrorRegistry};
use vaiz_serial::{ActivationManager, OfflineQueue, SerialClient, SerialStore};

use vaiz_server::error_response::init_register_url_base;
use vaiz_server::keystore::DeviceKeystore;
use vaiz_server::lock::ProcessLock;
use vaiz_server::state::{AppState, ConnectivityMetrics, TaskRegistry, VersionCache};
use vaiz_server::{background, db, resource_guards, router};

/// Blocking work (bundle packaging, sysinfo probes) runs on a bounded pool.
const MAX_BLOCKING_THREADS: usize = 32;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(MAX_BLOCKING_THREADS)
        .build()?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    vaiz_core::config::load_dotenv();
    let config = Config::from_env();

    // Logging comes up before anything else can emit a record.
    init_logging(&config.logging);
    vaiz_core::mark_started();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("serve") | None => serve(config).await,
        _ => {
            println!("vectoraiz-backend v{}", vaiz_core::APP_VERSION);
            println!("Usage: vaiz-server [serve]");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config.log_summary();

    // Startup aborts on a broken registry: no process without a validated
    // error catalog.
    let registry = match std::env::var("VAIZ_ERROR_REGISTRY") {
        Ok(path) => ErrorRegistry::load_path(std::path::Path::new(&path)),
        Err(_) => ErrorRegistry::load_default(),
    }
    .map_err(|e| anyhow::anyhow!("error registry load failed: {e}"))?;
    init_error_registry(registry);

    let tracker = init_issue_tracker(&config.storage.issues_path());
    tracker.reload();

    ensure_stderr_destination();

    // One process per data directory.
    let process_lock = ProcessLock::acquire(&config.storage.lock_path())?;

    if !config.is_standalone() && config.security.internal_api_key.is_none() {
        anyhow::bail!("connected mode requires VAIZ_INTERNAL_API_KEY");
    }

    let pg_pool = db::init_pg_pool(&config.postgres).await;

    let serial_store = Arc::new(SerialStore::on_disk(
        config.storage.serial_state_path(),
        config.metering.failure_threshold,
    ));
    let serial_client = Arc::new(SerialClient::new(
        &config.authority.base_url,
        Some(Duration::from_secs(config.authority.timeout_secs)),
    ));
    let offline_queue = Arc::new(OfflineQueue::new(config.storage.offline_queue_path()));
    init_register_url_base(&config.authority.base_url);

    let keystore = config
        .security
        .keystore_passphrase
        .as_deref()
        .map(|passphrase| {
            Arc::new(DeviceKeystore::new(
                &config.security.keystore_path,
                passphrase,
            ))
        });

    let state = Arc::new(AppState {
        config: config.clone(),
        serial_store: serial_store.clone(),
        serial_client: serial_client.clone(),
        offline_queue,
        keystore: keystore.clone(),
        pg_pool,
        http: reqwest::Client::new(),
        tasks: Arc::new(TaskRegistry::default()),
        metrics: ConnectivityMetrics::default(),
        token_lister: None,
        last_bundle_at: Mutex::new(None),
        version_cache: Mutex::new(VersionCache::default()),
    });

    // Connected mode: make sure the device identity exists, off the boot
    // path. Registration against the platform is fire-and-forget.
    if !config.is_standalone() {
        if let Some(keystore) = keystore {
            state.tasks.spawn("device-registration", async move {
                match tokio::task::spawn_blocking(move || keystore.get_or_create_keys()).await {
                    Ok(Ok(keys)) => {
                        info!(device_id = %keys.device_id, "device identity ready")
                    }
                    Ok(Err(e)) => error!(error = %e, "device keystore unavailable"),
                    Err(e) => error!(error = %e, "device registration task failed"),
                }
            });
        } else {
            tracing::warn!("connected mode without keystore passphrase, trust channel disabled");
        }
    }

    state.tasks.spawn(
        "meter-queue-processor",
        background::meter_queue_processor(state.clone()),
    );
    state.tasks.spawn(
        "resource-monitor",
        resource_guards::resource_monitor_loop(
            config.storage.data_dir.clone(),
            resource_guards::CHECK_INTERVAL,
        ),
    );
    if config.update.feed_url.is_some() {
        state
            .tasks
            .spawn("version-check", background::version_check_loop(state.clone()));
    }

    let manager = Arc::new(
        ActivationManager::new(
            serial_store,
            serial_client,
            &vaiz_diagnostics::system::hostname(),
            vaiz_core::APP_VERSION,
        )
        .with_intervals(
            Duration::from_secs(config.metering.activation_retry_secs),
            Duration::from_secs(config.metering.status_poll_secs),
        ),
    );
    state.tasks.spawn("activation-manager", async move {
        manager.startup().await;
        manager.run().await;
    });

    let app = router::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "vectoraiz control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown: persist what must survive, then stop tasks in reverse
    // order with a bounded grace period.
    info!("shutting down");
    tracker.persist();
    state.tasks.shutdown(Duration::from_secs(5)).await;
    if let Some(pool) = &state.pg_pool {
        pool.close().await;
    }
    drop(process_lock);
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}
