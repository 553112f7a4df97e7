use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use dosekeeper_lib::alarms::RecordingSink;
use dosekeeper_lib::connectivity::ConnectivityHandle;
use dosekeeper_lib::feed::spawn_snapshot_feed;
use dosekeeper_lib::model::{CachedRecord, Collection, OwnerId};
use dosekeeper_lib::queue::SyncService;
use dosekeeper_lib::remote::{DocumentPath, RemoteStore};
use dosekeeper_lib::time::ManualClock;
use dosekeeper_lib::{Engine, EngineParts};
#[path = "util.rs"]
mod util;

fn owner() -> OwnerId {
    OwnerId::new("user-1")
}

fn seed(h: &util::Harness, id: &str, name: &str) {
    h.remote.seed(
        &DocumentPath::document(&owner(), Collection::Habits, id),
        util::body(json!({ "name": name })),
    );
}

async fn cached_ids(sync: &SyncService) -> Result<Vec<String>> {
    let mut ids: Vec<String> = sync
        .get_from_cache(Collection::Habits, &owner())
        .await?
        .map(|cached| cached.records().iter().map(|r| r.id.clone()).collect())
        .unwrap_or_default();
    ids.sort();
    Ok(ids)
}

/// Polls the cache until it holds exactly `expected`.
async fn settles_on(sync: &SyncService, expected: &[&str]) -> Result<bool> {
    for _ in 0..100 {
        if cached_ids(sync).await? == expected {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(false)
}

#[tokio::test]
async fn remote_snapshots_replace_the_cached_collection() -> Result<()> {
    let h = util::Harness::new();
    h.sync
        .save_to_cache(
            Collection::Habits,
            &owner(),
            vec![CachedRecord::new("local-only").with_field("name", "Stale")],
        )
        .await?;
    seed(&h, "walk", "Walk");

    let _feed = spawn_snapshot_feed(
        h.sync.cache().clone(),
        Arc::new(h.remote.clone()),
        Collection::Habits,
        owner(),
    );
    assert!(settles_on(&h.sync, &["walk"]).await?, "initial snapshot not applied");

    seed(&h, "read", "Read");
    assert!(settles_on(&h.sync, &["read", "walk"]).await?, "added document missing");

    h.remote
        .delete(&DocumentPath::document(&owner(), Collection::Habits, "walk"))
        .await?;
    assert!(settles_on(&h.sync, &["read"]).await?, "deleted document still cached");

    let read = h
        .sync
        .get_item_from_cache(Collection::Habits, &owner(), "read")
        .await?
        .expect("read cached");
    assert_eq!(read.str_field("name"), Some("Read"));
    Ok(())
}

#[tokio::test]
async fn other_owners_do_not_reach_the_feed() -> Result<()> {
    let h = util::Harness::new();
    let _feed = spawn_snapshot_feed(
        h.sync.cache().clone(),
        Arc::new(h.remote.clone()),
        Collection::Habits,
        owner(),
    );
    seed(&h, "walk", "Walk");
    assert!(settles_on(&h.sync, &["walk"]).await?);

    h.remote.seed(
        &DocumentPath::document(&OwnerId::new("user-2"), Collection::Habits, "swim"),
        util::body(json!({ "name": "Swim" })),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cached_ids(&h.sync).await?, vec!["walk".to_string()]);
    Ok(())
}

#[tokio::test]
async fn dropping_the_handle_stops_the_feed() -> Result<()> {
    let h = util::Harness::new();
    seed(&h, "walk", "Walk");
    let feed = spawn_snapshot_feed(
        h.sync.cache().clone(),
        Arc::new(h.remote.clone()),
        Collection::Habits,
        owner(),
    );
    assert!(settles_on(&h.sync, &["walk"]).await?);

    drop(feed);
    tokio::task::yield_now().await;
    seed(&h, "read", "Read");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cached_ids(&h.sync).await?, vec!["walk".to_string()]);
    Ok(())
}

#[tokio::test]
async fn engine_feeds_stop_at_shutdown() -> Result<()> {
    let h = util::Harness::new();
    let engine = Engine::init(EngineParts {
        store: h.store.clone(),
        remote: Arc::new(h.remote.clone()),
        remote_auth: Arc::new(h.remote.clone()),
        device: Arc::new(h.device.clone()),
        connectivity: ConnectivityHandle::new(true),
        config: util::test_config(),
        clock: Arc::new(ManualClock::new(util::monday_nine())),
        sink: Arc::new(RecordingSink::new()),
    })
    .await?;

    engine.watch_collection(Collection::Habits, &owner());
    seed(&h, "walk", "Walk");
    assert!(settles_on(engine.sync(), &["walk"]).await?, "engine feed not applied");

    engine.shutdown();
    tokio::task::yield_now().await;
    seed(&h, "read", "Read");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cached_ids(engine.sync()).await?, vec!["walk".to_string()]);
    Ok(())
}
