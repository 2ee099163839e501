use std::sync::Arc;

use crate::batch::BatchRepo;
use crate::batch::limits::{MemoryProbe, ProcessMemory};
use crate::cache::ModelCache;
use crate::config::AppConfig;
use crate::metrics::counters::Counters;
use crate::notify::{BroadcastNotifier, Notifier};
use crate::runner::{UnitFactory, factory_for};
use crate::store::RecordStore;
use crate::wasm::WasmRepo;

/// Everything the services share, built once at startup.
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub cache: Arc<ModelCache>,
    pub store: Arc<RecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub counters: Counters,

    pub wasm: Arc<WasmRepo>,
    pub batches: Arc<BatchRepo>,
}

impl AppContext {
    /// Production wiring: configured runner, broadcast notifier, process RSS probe.
    pub fn new(config: AppConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: AppConfig) -> AppContextBuilder {
        AppContextBuilder {
            config: config.normalized(),
            factory: None,
            notifier: None,
            probe: None,
        }
    }
}

/// Swaps individual collaborators, mostly for tests.
pub struct AppContextBuilder {
    config: AppConfig,
    factory: Option<Arc<dyn UnitFactory>>,
    notifier: Option<Arc<dyn Notifier>>,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl AppContextBuilder {
    pub fn factory(mut self, factory: Arc<dyn UnitFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> AppContext {
        let config = Arc::new(self.config);
        let counters = Counters::default();

        let factory = self.factory.unwrap_or_else(|| factory_for(&config.runner));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(BroadcastNotifier::default()) as Arc<dyn Notifier>);
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcessMemory::new()) as Arc<dyn MemoryProbe>);

        let store = Arc::new(RecordStore::new(config.upload_path.clone()));
        let cache = Arc::new(ModelCache::new(
            config.cache_size,
            factory,
            config.worker_queue_capacity,
            counters.clone(),
        ));

        let wasm = Arc::new(WasmRepo::new(
            cache.clone(),
            store.clone(),
            &config,
            counters.clone(),
        ));
        let batches = Arc::new(
            BatchRepo::new(
                wasm.clone(),
                store.clone(),
                notifier.clone(),
                &config,
                counters.clone(),
            )
            .with_probe(probe),
        );

        AppContext {
            config,
            cache,
            store,
            notifier,
            counters,
            wasm,
            batches,
        }
    }
}
