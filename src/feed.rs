use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::LocalCache;
use crate::model::{CachedRecord, Collection, OwnerId};
use crate::remote::{DocumentPath, RemoteStore};

/// Running remote subscription. Dropping it stops the feed.
pub struct FeedHandle {
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Mirrors every full result set of the owner's remote collection into the
/// cache. Stream errors are logged and leave the cache untouched.
pub fn spawn_snapshot_feed(
    cache: LocalCache,
    remote: Arc<dyn RemoteStore>,
    collection: Collection,
    owner: OwnerId,
) -> FeedHandle {
    let path = DocumentPath::collection(&owner, collection);
    let mut stream = remote.subscribe(&path);

    let task = tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            let documents = match next {
                Ok(documents) => documents,
                Err(err) => {
                    warn!(
                        target: "dosekeeper",
                        event = "feed_error",
                        collection = collection.as_str(),
                        owner = %owner,
                        error = %err
                    );
                    continue;
                }
            };

            let mut records = Vec::with_capacity(documents.len());
            for doc in documents {
                match CachedRecord::from_document(&doc.id, doc.data) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(
                        target: "dosekeeper",
                        event = "feed_document_skipped",
                        collection = collection.as_str(),
                        id = %doc.id,
                        error = %err
                    ),
                }
            }

            let count = records.len();
            if let Err(err) = cache.save(collection, &owner, records).await {
                warn!(
                    target: "dosekeeper",
                    event = "feed_save_failed",
                    collection = collection.as_str(),
                    error = %err
                );
                continue;
            }
            debug!(
                target: "dosekeeper",
                event = "feed_snapshot_applied",
                collection = collection.as_str(),
                owner = %owner,
                records = count
            );
        }
    });

    FeedHandle { task }
}
