use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alarms::{AlarmRegistry, AlarmScheduler, AlarmValidator, DeviceAlarms, EventSink, LogSink};
use crate::auth::{CredentialVault, SessionDeps, SessionManager};
use crate::cache::LocalCache;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityHandle;
use crate::feed::{spawn_snapshot_feed, FeedHandle};
use crate::logging::LogScope;
use crate::model::{Collection, OwnerId};
use crate::queue::{SyncReport, SyncService};
use crate::records::RecordOps;
use crate::remote::{RemoteAuth, RemoteStore};
use crate::storage::StoreHandle;
use crate::time::{Clock, SystemClock};
use crate::AppResult;

/// Everything the engine is built from. Nothing is looked up globally.
pub struct EngineParts {
    pub store: StoreHandle,
    pub remote: Arc<dyn RemoteStore>,
    pub remote_auth: Arc<dyn RemoteAuth>,
    pub device: Arc<dyn DeviceAlarms>,
    pub connectivity: ConnectivityHandle,
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn EventSink>,
}

impl EngineParts {
    /// Default config, system clock and a log-only event sink.
    pub fn new(
        store: StoreHandle,
        remote: Arc<dyn RemoteStore>,
        remote_auth: Arc<dyn RemoteAuth>,
        device: Arc<dyn DeviceAlarms>,
        connectivity: ConnectivityHandle,
    ) -> Self {
        Self {
            store,
            remote,
            remote_auth,
            device,
            connectivity,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(LogSink),
        }
    }
}

/// Composition root. Owns every component and the background tasks tying
/// them to connectivity.
pub struct Engine {
    config: Arc<EngineConfig>,
    remote: Arc<dyn RemoteStore>,
    sync: SyncService,
    session: SessionManager,
    scheduler: AlarmScheduler,
    validator: AlarmValidator,
    records: RecordOps,
    connectivity: ConnectivityHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    feeds: Mutex<Vec<FeedHandle>>,
}

impl Engine {
    /// Builds the components, recovers the queue, restores the session and
    /// sweeps stale alarms before any caller can touch them.
    pub async fn init(parts: EngineParts) -> AppResult<Engine> {
        parts.config.validate()?;
        let scope = LogScope::new("engine_init", None);
        let config = Arc::new(parts.config);
        let clock = parts.clock;

        let cache = LocalCache::new(parts.store.clone());
        let sync = SyncService::new(
            cache,
            parts.remote.clone(),
            parts.connectivity.clone(),
            config.clone(),
            clock.clone(),
        );
        let registry = AlarmRegistry::new(parts.store.clone());
        sync.add_listener(Arc::new(registry.clone()));

        let scheduler = AlarmScheduler::new(
            parts.device,
            registry,
            sync.clone(),
            parts.sink,
            config.clone(),
            clock.clone(),
        );
        let validator = AlarmValidator::new(scheduler.clone());
        let records = RecordOps::new(sync.clone(), scheduler.clone(), config.clone(), clock.clone());
        let session = SessionManager::new(SessionDeps {
            remote_auth: parts.remote_auth,
            remote: parts.remote.clone(),
            vault: CredentialVault::new(parts.store, clock.clone()),
            sync: sync.clone(),
            connectivity: parts.connectivity.clone(),
            config: config.clone(),
            clock,
        });

        let recovered = sync.initialize().await?;
        let state = session.initialize().await?;
        let maintenance = match validator.perform_alarm_maintenance().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(target: "dosekeeper", event = "startup_maintenance_failed", code = err.code());
                None
            }
        };

        let engine = Engine {
            config,
            remote: parts.remote,
            sync,
            session,
            scheduler,
            validator,
            records,
            connectivity: parts.connectivity,
            tasks: Mutex::new(Vec::new()),
            feeds: Mutex::new(Vec::new()),
        };
        engine.spawn_connectivity_watcher();

        scope.success(json!({
            "recovered_queue_items": recovered,
            "session": state.label(),
            "maintenance": maintenance,
        }));
        Ok(engine)
    }

    /// On every offline to online edge: reconnect the session, then drain.
    fn spawn_connectivity_watcher(&self) {
        let mut rx = self.connectivity.subscribe();
        let session = self.session.clone();
        let sync = self.sync.clone();
        let task = tokio::spawn(async move {
            // Watchers only wake on real transitions, so waking up online means an
            // offline stretch just ended, even when a quick flip was coalesced.
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online {
                    if let Err(err) = session.handle_reconnect().await {
                        warn!(target: "dosekeeper", event = "reconnect_failed", code = err.code());
                    }
                    match sync.process_queue().await {
                        Ok(report) => debug!(
                            target: "dosekeeper",
                            event = "reconnect_sync",
                            succeeded = report.succeeded,
                            remaining = report.remaining
                        ),
                        Err(err) => {
                            warn!(target: "dosekeeper", event = "reconnect_sync_failed", code = err.code())
                        }
                    }
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn scheduler(&self) -> &AlarmScheduler {
        &self.scheduler
    }

    pub fn validator(&self) -> &AlarmValidator {
        &self.validator
    }

    pub fn records(&self) -> &RecordOps {
        &self.records
    }

    pub fn connectivity(&self) -> &ConnectivityHandle {
        &self.connectivity
    }

    /// Runs one queue pass now.
    pub async fn sync_now(&self) -> AppResult<SyncReport> {
        self.sync.process_queue().await
    }

    /// Mirrors the owner's remote collection into the cache until shutdown.
    pub fn watch_collection(&self, collection: Collection, owner: &OwnerId) {
        let feed = spawn_snapshot_feed(
            self.sync.cache().clone(),
            self.remote.clone(),
            collection,
            owner.clone(),
        );
        self.feeds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(feed);
    }

    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        let feeds = self
            .feeds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .count();
        self.session.shutdown();
        info!(target: "dosekeeper", event = "engine_shutdown", feeds);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}
