use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use dosekeeper_lib::cache::LocalCache;
use dosekeeper_lib::id::is_temp_id;
use dosekeeper_lib::model::{Collection, Medication, MedicationPatch, OwnerId};
use dosekeeper_lib::queue::{Operation, QueueStatus, SyncOutcome, SyncService};
use dosekeeper_lib::remote::{DocumentPath, MemoryRemote, RemoteDocument, RemoteError, RemoteStore};
#[path = "util.rs"]
mod util;

/// Remote whose updates wait for an explicit release.
#[derive(Clone)]
struct GatedRemote {
    inner: MemoryRemote,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedRemote {
    fn new(inner: MemoryRemote) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn get(&self, path: &DocumentPath) -> Result<Option<RemoteDocument>, RemoteError> {
        self.inner.get(path).await
    }

    async fn create(&self, path: &DocumentPath, data: Map<String, Value>) -> Result<String, RemoteError> {
        self.inner.create(path, data).await
    }

    async fn update(&self, path: &DocumentPath, data: Map<String, Value>) -> Result<(), RemoteError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.update(path, data).await
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError> {
        self.inner.delete(path).await
    }

    fn subscribe(&self, collection: &DocumentPath) -> BoxStream<'static, Result<Vec<RemoteDocument>, RemoteError>> {
        self.inner.subscribe(collection)
    }
}

fn seed_habit(remote: &MemoryRemote, owner: &OwnerId, id: &str) {
    remote.seed(
        &DocumentPath::document(owner, Collection::Habits, id),
        util::body(json!({ "name": "Walk" })),
    );
}

#[tokio::test]
async fn second_pass_is_skipped_while_one_is_running() -> Result<()> {
    let h = util::Harness::new();
    let owner = OwnerId::new("user-1");
    seed_habit(&h.remote, &owner, "h1");

    let gate = GatedRemote::new(h.remote.clone());
    let sync = SyncService::new(
        LocalCache::new(h.store.clone()),
        Arc::new(gate.clone()),
        h.connectivity.clone(),
        h.config.clone(),
        Arc::new(h.clock.clone()),
    );
    sync.enqueue(
        Operation::Update,
        Collection::Habits,
        "h1",
        &owner,
        util::body(json!({ "name": "Run" })),
    )
    .await;

    let runner = sync.clone();
    let first = tokio::spawn(async move { runner.process_queue().await });
    gate.entered.notified().await;

    let second = sync.process_queue().await?;
    assert_eq!(second.outcome, SyncOutcome::SkippedAlreadyRunning);
    assert_eq!(second.attempted, 0);
    assert_eq!(second.remaining, 1);

    gate.release.notify_one();
    let first = first.await??;
    assert_eq!(first.outcome, SyncOutcome::Completed);
    assert_eq!(first.succeeded, 1);
    assert_eq!(sync.get_pending_count(None).await, 0);
    assert!(!sync.processor().is_running());
    Ok(())
}

#[tokio::test]
async fn full_drain_leaves_nothing_pending() -> Result<()> {
    let h = util::Harness::new();
    let owner = OwnerId::new("user-1");
    seed_habit(&h.remote, &owner, "h1");
    seed_habit(&h.remote, &owner, "h2");

    h.sync
        .enqueue(Operation::Update, Collection::Habits, "h1", &owner, util::body(json!({ "icon": "a" })))
        .await;
    h.sync
        .enqueue(Operation::Delete, Collection::Habits, "h2", &owner, Map::new())
        .await;
    h.sync
        .enqueue(Operation::Create, Collection::Habits, "h3", &owner, util::body(json!({ "name": "Read" })))
        .await;
    assert_eq!(h.sync.get_pending_count(None).await, 3);

    let report = h.sync.process_queue().await?;
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(h.sync.get_pending_count(None).await, 0);

    let col = DocumentPath::collection(&owner, Collection::Habits);
    let ids: Vec<String> = h.remote.documents_in(&col).into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["h1".to_string(), "h3".to_string()]);
    assert_eq!(
        h.remote
            .document(&col.child("h1"))
            .and_then(|doc| doc.get("icon").cloned()),
        Some(json!("a"))
    );
    Ok(())
}

#[tokio::test]
async fn transient_failure_holds_back_only_that_owner() -> Result<()> {
    let h = util::Harness::new();
    let alice = OwnerId::new("alice");
    let bob = OwnerId::new("bob");
    seed_habit(&h.remote, &alice, "a1");
    seed_habit(&h.remote, &alice, "a2");
    seed_habit(&h.remote, &bob, "b1");

    for (owner, id) in [(&alice, "a1"), (&alice, "a2"), (&bob, "b1")] {
        h.sync
            .enqueue(Operation::Update, Collection::Habits, id, owner, util::body(json!({ "icon": "x" })))
            .await;
    }
    h.remote.fail_next(RemoteError::Network("reset".into()));

    let report = h.sync.process_queue().await?;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.remaining, 2);

    let left = h.sync.queue().items(Some(&alice)).await?;
    assert_eq!(left.len(), 2);
    assert_eq!(left[0].item_id, "a1");
    assert_eq!(left[0].status, QueueStatus::Failed);
    assert_eq!(left[0].attempts, 1);
    assert_eq!(left[1].status, QueueStatus::Pending);
    assert_eq!(h.sync.get_pending_count(Some(&bob)).await, 0);

    // Next pass replays alice in order.
    let report = h.sync.process_queue().await?;
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.remaining, 0);
    Ok(())
}

#[tokio::test]
async fn server_errors_keep_the_item_for_the_next_pass() -> Result<()> {
    let h = util::Harness::new();
    let owner = OwnerId::new("user-1");
    seed_habit(&h.remote, &owner, "h1");
    h.sync
        .enqueue(Operation::Update, Collection::Habits, "h1", &owner, util::body(json!({ "icon": "x" })))
        .await;
    h.remote.fail_next(RemoteError::Internal("503 service unavailable".into()));

    let report = h.sync.process_queue().await?;
    assert_eq!(report.dropped, 0);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.remaining, 1);
    assert_eq!(h.remote.write_count(), 0);
    let left = h.sync.queue().items(Some(&owner)).await?;
    assert_eq!(left[0].status, QueueStatus::Failed);

    let report = h.sync.process_queue().await?;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(h.remote.write_count(), 1);
    Ok(())
}

#[tokio::test]
async fn permanent_rejection_is_dropped_and_cache_kept() -> Result<()> {
    let h = util::Harness::new();
    let owner = OwnerId::new("user-1");
    h.sync
        .save_to_cache(
            Collection::Habits,
            &owner,
            vec![dosekeeper_lib::model::CachedRecord::new("gone").with_field("name", "Local")],
        )
        .await?;
    h.sync
        .enqueue(Operation::Update, Collection::Habits, "gone", &owner, util::body(json!({ "name": "Edited" })))
        .await;

    let report = h.sync.process_queue().await?;
    assert_eq!(report.dropped, 1);
    assert_eq!(report.remaining, 0);
    let cached = h
        .sync
        .get_item_from_cache(Collection::Habits, &owner, "gone")
        .await?
        .expect("cache untouched");
    assert_eq!(cached.str_field("name"), Some("Local"));
    Ok(())
}

#[tokio::test]
async fn offline_and_temporary_owners_are_not_replayed() -> Result<()> {
    let h = util::Harness::new();
    let temp = OwnerId::new("temp_1700000000000_abc");
    h.sync
        .enqueue(Operation::Create, Collection::Habits, "h1", &temp, util::body(json!({ "name": "Walk" })))
        .await;

    h.connectivity.set_online(false);
    let offline = h.sync.process_queue().await?;
    assert_eq!(offline.outcome, SyncOutcome::SkippedOffline);
    assert_eq!(offline.remaining, 1);

    h.connectivity.set_online(true);
    let online = h.sync.process_queue().await?;
    assert_eq!(online.outcome, SyncOutcome::Completed);
    assert_eq!(online.attempted, 0);
    assert_eq!(online.deferred, 1);
    assert_eq!(online.remaining, 1);
    assert_eq!(h.remote.write_count(), 0);
    Ok(())
}

#[tokio::test]
async fn temporary_record_ids_are_swapped_for_remote_ids() -> Result<()> {
    let h = util::Harness::new();
    let owner = OwnerId::new("user-1");
    let created = h
        .records
        .create_item(
            &owner,
            &Medication {
                name: "Metformin".into(),
                ..Medication::default()
            },
        )
        .await?;
    assert!(is_temp_id(&created.id, &h.config.temp_record_prefix));

    let _undo = h
        .records
        .update_item(
            Collection::Medications,
            &owner,
            &created.id,
            &MedicationPatch {
                dose_label: Some("500mg".into()),
                ..MedicationPatch::default()
            },
        )
        .await?;

    let report = h.sync.process_queue().await?;
    assert_eq!(report.remapped, 1);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.remaining, 0);

    let active = h.records.list_active(Collection::Medications, &owner).await?;
    assert_eq!(active.len(), 1);
    let remote_id = active[0].id.clone();
    assert!(!is_temp_id(&remote_id, &h.config.temp_record_prefix));

    let doc = h
        .remote
        .document(&DocumentPath::document(&owner, Collection::Medications, &remote_id))
        .expect("created remotely");
    assert_eq!(doc.get("name"), Some(&json!("Metformin")));
    assert_eq!(doc.get("doseLabel"), Some(&json!("500mg")));
    Ok(())
}

#[tokio::test]
async fn crashed_in_flight_items_are_recovered() -> Result<()> {
    let h = util::Harness::new();
    let owner = OwnerId::new("user-1");
    let id = h
        .sync
        .enqueue(Operation::Update, Collection::Habits, "h1", &owner, Map::new())
        .await
        .expect("enqueued");
    h.sync.queue().mark_in_flight(&id).await?;

    let restarted = util::Harness::with_store(h.store.clone());
    assert_eq!(restarted.sync.initialize().await?, 1);
    let items = restarted.sync.queue().items(None).await?;
    assert_eq!(items[0].status, QueueStatus::Pending);
    Ok(())
}
