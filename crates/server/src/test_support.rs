//! Shared helpers for handler and middleware tests.

use std::sync::{Arc, Mutex};

use vaiz_core::{init_error_registry, Config, ErrorRegistry};
use vaiz_serial::{OfflineQueue, SerialClient, SerialState, SerialStore};

use crate::collectors::TokenLister;
use crate::keystore::DeviceKeystore;
use crate::state::{AppState, ConnectivityMetrics, TaskRegistry, VersionCache};

pub struct StoreOverrides {
    pub serial_store: Arc<SerialStore>,
    pub token_lister: Option<Arc<dyn TokenLister>>,
    pub keystore: Option<Arc<DeviceKeystore>>,
}

/// Build an `AppState` over a throwaway data directory. The closure can
/// adjust config and swap in store doubles before the state is assembled;
/// the serial client is built from the (possibly overridden) authority URL.
pub async fn test_state(
    customize: impl FnOnce(&mut Config, &mut StoreOverrides),
) -> Arc<AppState> {
    let tmp = tempfile::tempdir().unwrap();

    let mut config = Config::from_env();
    config.storage.data_dir = tmp.path().to_path_buf();
    config.logging.dir = tmp.path().join("logs");
    config.security.internal_api_key = None;
    config.update.feed_url = None;

    let mut stores = StoreOverrides {
        serial_store: Arc::new(SerialStore::in_memory(SerialState::default())),
        token_lister: None,
        keystore: None,
    };
    customize(&mut config, &mut stores);

    init_error_registry(ErrorRegistry::load_default().unwrap());
    vaiz_core::mark_started();

    let serial_client = Arc::new(SerialClient::new(
        &config.authority.base_url,
        Some(std::time::Duration::from_millis(500)),
    ));
    let offline_queue = Arc::new(OfflineQueue::new(config.storage.offline_queue_path()));

    // Keep the tempdir alive for the remainder of the test process.
    std::mem::forget(tmp);

    Arc::new(AppState {
        config,
        serial_store: stores.serial_store,
        serial_client,
        offline_queue,
        keystore: stores.keystore,
        pg_pool: None,
        http: reqwest::Client::new(),
        tasks: Arc::new(TaskRegistry::default()),
        metrics: ConnectivityMetrics::default(),
        token_lister: stores.token_lister,
        last_bundle_at: Mutex::new(None),
        version_cache: Mutex::new(VersionCache::default()),
    })
}
