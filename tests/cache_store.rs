use anyhow::Result;
use dosekeeper_lib::model::{CachedRecord, Collection, OwnerId, RecordPatch};
use dosekeeper_lib::queue::Operation;
use serde_json::json;
#[path = "util.rs"]
mod util;

fn owner() -> OwnerId {
    OwnerId::new("user-1")
}

#[tokio::test]
async fn save_replaces_the_whole_snapshot() -> Result<()> {
    let h = util::Harness::new();
    h.sync
        .save_to_cache(
            Collection::Habits,
            &owner(),
            vec![
                CachedRecord::new("h1").with_field("name", "Walk"),
                CachedRecord::new("h2").with_field("name", "Read"),
            ],
        )
        .await?;
    h.sync
        .save_to_cache(
            Collection::Habits,
            &owner(),
            vec![CachedRecord::new("h3").with_field("name", "Stretch")],
        )
        .await?;

    let snapshot = h
        .sync
        .get_from_cache(Collection::Habits, &owner())
        .await?
        .expect("snapshot saved");
    let ids: Vec<&str> = snapshot.records().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["h3"]);
    Ok(())
}

#[tokio::test]
async fn update_merges_and_ignores_absent_records() -> Result<()> {
    let h = util::Harness::new();
    h.sync
        .save_to_cache(
            Collection::Medications,
            &owner(),
            vec![CachedRecord::new("m1")
                .with_field("name", "Aspirin")
                .with_field("doseLabel", "100mg")],
        )
        .await?;

    let patch = RecordPatch::new().set("doseLabel", "200mg");
    let previous = h
        .sync
        .update_item_in_cache(Collection::Medications, &owner(), "m1", &patch)
        .await?
        .expect("record exists");
    assert_eq!(previous.str_field("doseLabel"), Some("100mg"));

    let current = h
        .sync
        .get_item_from_cache(Collection::Medications, &owner(), "m1")
        .await?
        .expect("record still cached");
    assert_eq!(current.str_field("doseLabel"), Some("200mg"));
    assert_eq!(current.str_field("name"), Some("Aspirin"));

    let missing = h
        .sync
        .update_item_in_cache(Collection::Medications, &owner(), "nope", &patch)
        .await?;
    assert!(missing.is_none());
    assert!(h
        .sync
        .get_item_from_cache(Collection::Medications, &owner(), "nope")
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn active_and_archived_listings_split_on_the_flag() -> Result<()> {
    let h = util::Harness::new();
    let mut archived = CachedRecord::new("a2").with_field("title", "Dentist");
    archived.is_archived = true;
    h.sync
        .save_to_cache(
            Collection::Appointments,
            &owner(),
            vec![CachedRecord::new("a1").with_field("title", "GP"), archived],
        )
        .await?;

    let active = h.records.list_active(Collection::Appointments, &owner()).await?;
    let archived = h.records.list_archived(Collection::Appointments, &owner()).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "a1");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, "a2");
    Ok(())
}

#[tokio::test]
async fn optimistic_update_is_visible_before_its_queue_entry() -> Result<()> {
    let h = util::Harness::new();
    h.sync
        .save_to_cache(
            Collection::Habits,
            &owner(),
            vec![CachedRecord::new("h1").with_field("name", "Walk")],
        )
        .await?;

    let compensation = h
        .sync
        .apply_update(
            Collection::Habits,
            &owner(),
            "h1",
            RecordPatch::new().set("name", "Run"),
        )
        .await?
        .expect("record cached");

    let cached = h
        .sync
        .get_item_from_cache(Collection::Habits, &owner(), "h1")
        .await?
        .expect("cached");
    assert_eq!(cached.str_field("name"), Some("Run"));
    let queued = h.sync.queue().items(Some(&owner())).await?;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].operation, Operation::Update);
    assert_eq!(queued[0].payload.get("name"), Some(&json!("Run")));

    h.sync.compensate(compensation).await?;
    let restored = h
        .sync
        .get_item_from_cache(Collection::Habits, &owner(), "h1")
        .await?
        .expect("cached");
    assert_eq!(restored.str_field("name"), Some("Walk"));
    assert_eq!(h.sync.get_pending_count(Some(&owner())).await, 0);
    Ok(())
}

#[tokio::test]
async fn remove_drops_only_the_named_record() -> Result<()> {
    let h = util::Harness::new();
    h.sync
        .save_to_cache(
            Collection::Habits,
            &owner(),
            vec![CachedRecord::new("h1"), CachedRecord::new("h2")],
        )
        .await?;
    let removed = h
        .sync
        .remove_item_from_cache(Collection::Habits, &owner(), "h1")
        .await?;
    assert_eq!(removed.map(|r| r.id), Some("h1".to_string()));
    let left = h.records.list_active(Collection::Habits, &owner()).await?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, "h2");
    Ok(())
}
