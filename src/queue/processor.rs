use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use super::item::{Operation, QueueItem, SyncOutcome, SyncReport};
use super::store::MutationQueue;
use super::Listeners;
use crate::cache::LocalCache;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityHandle;
use crate::id::is_temp_id;
use crate::logging::LogScope;
use crate::remote::{with_deadline, DocumentPath, RemoteError, RemoteStore};
use crate::{AppError, AppResult};

/// Held for the duration of one queue pass; a second pass cannot start.
pub struct ProcessingGuard {
    flag: Arc<AtomicBool>,
}

impl ProcessingGuard {
    fn begin(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                "QUEUE/ALREADY_RUNNING",
                "A queue pass is already running.",
            ));
        }
        Ok(Self { flag })
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

enum Replay {
    Done,
    Created(String),
}

#[derive(Clone)]
pub struct QueueProcessor {
    queue: MutationQueue,
    cache: LocalCache,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityHandle,
    config: Arc<EngineConfig>,
    listeners: Listeners,
    running: Arc<AtomicBool>,
}

impl QueueProcessor {
    pub(crate) fn new(
        queue: MutationQueue,
        cache: LocalCache,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityHandle,
        config: Arc<EngineConfig>,
        listeners: Listeners,
    ) -> Self {
        Self {
            queue,
            cache,
            remote,
            connectivity,
            config,
            listeners,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drains the queue against the remote store. Concurrent calls return
    /// immediately with `SkippedAlreadyRunning`.
    pub async fn process_queue(&self) -> AppResult<SyncReport> {
        let _guard = match ProcessingGuard::begin(self.running.clone()) {
            Ok(guard) => guard,
            Err(_) => {
                info!(target: "dosekeeper", event = "queue_pass_skipped", reason = "already_running");
                let remaining = self.queue.pending_count(None).await;
                return Ok(SyncReport::skipped(SyncOutcome::SkippedAlreadyRunning, remaining));
            }
        };

        if !self.connectivity.is_online() {
            let remaining = self.queue.pending_count(None).await;
            info!(target: "dosekeeper", event = "queue_pass_skipped", reason = "offline", remaining);
            return Ok(SyncReport::skipped(SyncOutcome::SkippedOffline, remaining));
        }

        let scope = LogScope::new("process_queue", None);
        let mut report = SyncReport::skipped(SyncOutcome::Completed, 0);
        let mut visited: HashSet<String> = HashSet::new();
        let mut blocked = HashSet::new();

        loop {
            // Re-read each round: remaps and reference updates change the queue mid-pass.
            let items = self.queue.items(None).await?;
            let next = items.into_iter().find(|item| {
                !visited.contains(&item.id) && !blocked.contains(&item.owner) && item.is_replayable()
            });
            let Some(item) = next else { break };
            visited.insert(item.id.clone());

            if item.owner.is_temporary(&self.config.temp_owner_prefix) {
                // Nothing under a temporary owner can reach the remote before migration.
                blocked.insert(item.owner.clone());
                report.deferred += 1;
                continue;
            }

            self.queue.mark_in_flight(&item.id).await?;
            report.attempted += 1;

            let result = with_deadline(self.config.remote_timeout(), self.replay(&item)).await;
            match result {
                Ok(Replay::Done) => {
                    self.queue.remove(&item.id).await?;
                    report.succeeded += 1;
                }
                Ok(Replay::Created(remote_id)) => {
                    self.queue.remove(&item.id).await?;
                    self.remap(&item, &remote_id).await?;
                    report.succeeded += 1;
                    report.remapped += 1;
                }
                // A failing server is retried like an unreachable one.
                Err(err) if err.is_network_class() => {
                    self.queue.mark_failed(&item.id, &err.to_string()).await?;
                    blocked.insert(item.owner.clone());
                    report.deferred += 1;
                    warn!(
                        target: "dosekeeper",
                        event = "queue_item_deferred",
                        queue_id = %item.id,
                        operation = item.operation.as_str(),
                        collection = item.collection.as_str(),
                        owner = %item.owner,
                        error = %err
                    );
                }
                Err(err) => {
                    // Remote refused for good; the local cache stays the final answer.
                    self.queue.remove(&item.id).await?;
                    report.dropped += 1;
                    warn!(
                        target: "dosekeeper",
                        event = "queue_item_dropped",
                        queue_id = %item.id,
                        operation = item.operation.as_str(),
                        collection = item.collection.as_str(),
                        item_id = %item.item_id,
                        code = err.code(),
                        error = %err
                    );
                }
            }
        }

        report.remaining = self.queue.pending_count(None).await;
        scope.success(json!({
            "attempted": report.attempted,
            "succeeded": report.succeeded,
            "dropped": report.dropped,
            "deferred": report.deferred,
            "remaining": report.remaining,
            "remapped": report.remapped,
        }));
        Ok(report)
    }

    async fn replay(&self, item: &QueueItem) -> Result<Replay, RemoteError> {
        let temp = is_temp_id(&item.item_id, &self.config.temp_record_prefix);
        let doc = DocumentPath::document(&item.owner, item.collection, &item.item_id);

        match item.operation {
            Operation::Create if temp => {
                let collection = DocumentPath::collection(&item.owner, item.collection);
                let id = self.remote.create(&collection, item.payload.clone()).await?;
                Ok(Replay::Created(id))
            }
            Operation::Create => match self.remote.create(&doc, item.payload.clone()).await {
                Ok(_) | Err(RemoteError::AlreadyExists) => Ok(Replay::Done),
                Err(err) => Err(err),
            },
            Operation::Update => {
                self.remote.update(&doc, item.payload.clone()).await?;
                Ok(Replay::Done)
            }
            // A record that never reached the remote has nothing to delete there.
            Operation::Delete if temp => Ok(Replay::Done),
            Operation::Delete => match self.remote.delete(&doc).await {
                Ok(()) | Err(RemoteError::NotFound) => Ok(Replay::Done),
                Err(err) => Err(err),
            },
        }
    }

    async fn remap(&self, item: &QueueItem, remote_id: &str) -> AppResult<()> {
        let rewrites = self
            .cache
            .remap_record_id(item.collection, &item.owner, &item.item_id, remote_id)
            .await?;
        self.queue
            .remap_item_id(&item.owner, &item.item_id, remote_id)
            .await?;
        for rewrite in &rewrites {
            self.queue
                .enqueue(
                    Operation::Update,
                    rewrite.collection,
                    &rewrite.id,
                    &item.owner,
                    rewrite.patch.clone().into_map(),
                )
                .await;
        }

        let listeners = self.listeners.read().map(|l| l.clone()).unwrap_or_default();
        for listener in listeners {
            if let Err(err) = listener
                .on_record_id_remapped(&item.owner, item.collection, &item.item_id, remote_id)
                .await
            {
                warn!(
                    target: "dosekeeper",
                    event = "remap_listener_failed",
                    error = %err
                );
            }
        }

        info!(
            target: "dosekeeper",
            event = "record_id_remapped",
            collection = item.collection.as_str(),
            owner = %item.owner,
            from = %item.item_id,
            to = %remote_id,
            references = rewrites.len()
        );
        Ok(())
    }
}
