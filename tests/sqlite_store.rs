use anyhow::Result;
use tempfile::tempdir;

use dosekeeper_lib::model::{Collection, Habit, OwnerId};
use dosekeeper_lib::storage::{keys, BatchOp, KeyValueStore, SqliteStore, StoreHandle};
#[path = "util.rs"]
mod util;

#[tokio::test]
async fn open_creates_missing_directories() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nested").join("data").join("dosekeeper.sqlite3");
    let store = SqliteStore::open(&path).await?;
    store.set("k", "v").await?;
    assert!(path.exists());
    assert_eq!(store.get("k").await?.as_deref(), Some("v"));
    Ok(())
}

#[tokio::test]
async fn values_survive_a_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("dosekeeper.sqlite3");
    {
        let store = SqliteStore::open(&path).await?;
        store.set("queue::items", "[]").await?;
        store.set("auth::cached_owner", "\"uid\"").await?;
        store.remove("auth::cached_owner").await?;
        store.pool().close().await;
    }

    let store = SqliteStore::open(&path).await?;
    assert_eq!(store.get("queue::items").await?.as_deref(), Some("[]"));
    assert_eq!(store.get("auth::cached_owner").await?, None);
    Ok(())
}

#[tokio::test]
async fn prefix_listing_treats_underscores_literally() -> Result<()> {
    let store = SqliteStore::open_in_memory().await?;
    store.set("cache::habits::temp_1_a", "[]").await?;
    store.set("cache::habits::tempX1Xa", "[]").await?;
    store.set("cache::medications::temp_1_a", "[]").await?;

    let keys = store.keys_with_prefix("cache::habits::temp_").await?;
    assert_eq!(keys, vec!["cache::habits::temp_1_a".to_string()]);
    assert_eq!(store.keys_with_prefix("cache::").await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn failed_batch_leaves_nothing_behind() -> Result<()> {
    let store = SqliteStore::open_in_memory().await?;
    store.set("keep", "old").await?;
    sqlx::query(
        "CREATE TRIGGER refuse_poison BEFORE INSERT ON kv WHEN NEW.key = 'poison'
         BEGIN SELECT RAISE(ABORT, 'refused'); END",
    )
    .execute(store.pool())
    .await?;

    let result = store
        .apply_batch(vec![
            BatchOp::set("keep", "new"),
            BatchOp::set("added", "1"),
            BatchOp::set("poison", "x"),
        ])
        .await;
    assert!(result.is_err());
    assert_eq!(store.get("keep").await?.as_deref(), Some("old"));
    assert_eq!(store.get("added").await?, None);

    store
        .apply_batch(vec![BatchOp::set("added", "1"), BatchOp::remove("keep")])
        .await?;
    assert_eq!(store.get("added").await?.as_deref(), Some("1"));
    assert_eq!(store.get("keep").await?, None);
    Ok(())
}

#[tokio::test]
async fn cached_records_and_queue_survive_a_restart() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("dosekeeper.sqlite3");
    let owner = OwnerId::new("user-1");
    {
        let h = util::Harness::with_store(StoreHandle::sqlite(SqliteStore::open(&path).await?));
        h.connectivity.set_online(false);
        h.records
            .create_item(
                &owner,
                &Habit {
                    id: "walk".into(),
                    name: "Walk".into(),
                    ..Habit::default()
                },
            )
            .await?;
    }

    let store = StoreHandle::sqlite(SqliteStore::open(&path).await?);
    assert!(store.get_raw(&keys::cache(Collection::Habits, &owner)).await?.is_some());
    let h = util::Harness::with_store(store);
    assert_eq!(h.sync.initialize().await?, 0);
    assert_eq!(h.sync.get_pending_count(Some(&owner)).await, 1);
    let active = h.records.list_active(Collection::Habits, &owner).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].str_field("name"), Some("Walk"));
    Ok(())
}
