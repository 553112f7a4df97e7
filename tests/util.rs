#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify};

use dosekeeper_lib::alarms::{
    AlarmRegistry, AlarmScheduler, AlarmValidator, MemoryDeviceAlarms, RecordingSink,
};
use dosekeeper_lib::auth::{CredentialVault, SessionDeps, SessionManager};
use dosekeeper_lib::cache::LocalCache;
use dosekeeper_lib::config::EngineConfig;
use dosekeeper_lib::connectivity::ConnectivityHandle;
use dosekeeper_lib::queue::SyncService;
use dosekeeper_lib::records::RecordOps;
use dosekeeper_lib::remote::{MemoryRemote, RemoteAuth, RemoteError, RemoteUser};
use dosekeeper_lib::storage::{BatchOp, KeyValueStore, MemoryStore, StoreHandle};
use dosekeeper_lib::time::ManualClock;
use dosekeeper_lib::{AppError, AppResult};

/// Monday 2024-01-15 09:00 UTC.
pub fn monday_nine() -> i64 {
    Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0)
        .unwrap()
        .timestamp_millis()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        timezone: Some("UTC".into()),
        ..EngineConfig::default()
    }
}

pub fn body(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// In-memory store that can be told to refuse writes to one key.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing_key: String,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn failing_on(key: &str) -> Self {
        Self {
            inner: MemoryStore::default(),
            failing_key: key.to_string(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn refuses(&self, key: &str) -> bool {
        self.failing.load(Ordering::SeqCst) && key == self.failing_key
    }

    fn refused(key: &str) -> AppError {
        AppError::new("STORAGE/WRITE_FAILED", "Write refused.").with_context("key", key.to_string())
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        if self.refuses(key) {
            return Err(Self::refused(key));
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        if self.refuses(key) {
            return Err(Self::refused(key));
        }
        self.inner.remove(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        self.inner.keys_with_prefix(prefix).await
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> AppResult<()> {
        if let Some(op) = ops.iter().find(|op| self.refuses(op.key())) {
            return Err(Self::refused(op.key()));
        }
        self.inner.apply_batch(ops).await
    }
}

/// Remote auth over a [`MemoryRemote`] whose `create_account` waits until
/// the test releases it.
#[derive(Clone)]
pub struct GatedAuth {
    inner: MemoryRemote,
    entered: Arc<Notify>,
    release: Arc<Notify>,
    creates: Arc<AtomicUsize>,
}

impl GatedAuth {
    pub fn new(inner: MemoryRemote) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            creates: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Resolves once a `create_account` call is parked on the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteAuth for GatedAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteUser, RemoteError> {
        self.inner.sign_in(email, password).await
    }

    async fn create_account(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<RemoteUser, RemoteError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.create_account(email, password, display_name).await
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.inner.sign_out().await
    }

    fn current_user(&self) -> Option<RemoteUser> {
        self.inner.current_user()
    }

    fn watch_user(&self) -> watch::Receiver<Option<RemoteUser>> {
        self.inner.watch_user()
    }
}

/// Every component wired over in-memory collaborators and a manual clock.
pub struct Harness {
    pub store: StoreHandle,
    pub remote: MemoryRemote,
    pub device: MemoryDeviceAlarms,
    pub connectivity: ConnectivityHandle,
    pub clock: ManualClock,
    pub sink: RecordingSink,
    pub config: Arc<EngineConfig>,
    pub sync: SyncService,
    pub registry: AlarmRegistry,
    pub scheduler: AlarmScheduler,
    pub validator: AlarmValidator,
    pub records: RecordOps,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(StoreHandle::in_memory())
    }

    pub fn with_store(store: StoreHandle) -> Self {
        Self::build(store, MemoryRemote::new(), test_config())
    }

    pub fn build(store: StoreHandle, remote: MemoryRemote, config: EngineConfig) -> Self {
        let device = MemoryDeviceAlarms::new();
        let connectivity = ConnectivityHandle::new(true);
        let clock = ManualClock::new(monday_nine());
        let sink = RecordingSink::new();
        let config = Arc::new(config);

        let sync = SyncService::new(
            LocalCache::new(store.clone()),
            Arc::new(remote.clone()),
            connectivity.clone(),
            config.clone(),
            Arc::new(clock.clone()),
        );
        let registry = AlarmRegistry::new(store.clone());
        sync.add_listener(Arc::new(registry.clone()));
        let scheduler = AlarmScheduler::new(
            Arc::new(device.clone()),
            registry.clone(),
            sync.clone(),
            Arc::new(sink.clone()),
            config.clone(),
            Arc::new(clock.clone()),
        );
        let validator = AlarmValidator::new(scheduler.clone());
        let records = RecordOps::new(
            sync.clone(),
            scheduler.clone(),
            config.clone(),
            Arc::new(clock.clone()),
        );

        Self {
            store,
            remote,
            device,
            connectivity,
            clock,
            sink,
            config,
            sync,
            registry,
            scheduler,
            validator,
            records,
        }
    }

    /// A session manager sharing this harness's store, remote and clock.
    pub fn session(&self) -> SessionManager {
        self.session_with_auth(Arc::new(self.remote.clone()))
    }

    pub fn session_with_auth(&self, remote_auth: Arc<dyn RemoteAuth>) -> SessionManager {
        SessionManager::new(SessionDeps {
            remote_auth,
            remote: Arc::new(self.remote.clone()),
            vault: CredentialVault::new(self.store.clone(), Arc::new(self.clock.clone())),
            sync: self.sync.clone(),
            connectivity: self.connectivity.clone(),
            config: self.config.clone(),
            clock: Arc::new(self.clock.clone()),
        })
    }
}
