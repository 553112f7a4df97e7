use tokio::sync::watch;
use tracing::info;

/// Reachability signal. The platform layer flips it; components read or watch it.
#[derive(Clone)]
pub struct ConnectivityHandle {
    tx: watch::Sender<bool>,
}

impl ConnectivityHandle {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        // Only real transitions wake watchers.
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(target: "dosekeeper", event = "connectivity_changed", online);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new(true)
    }
}
