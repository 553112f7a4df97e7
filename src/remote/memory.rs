use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use super::{DocumentPath, RemoteAuth, RemoteDocument, RemoteError, RemoteStore, RemoteUser};

struct Account {
    uid: String,
    password: String,
    display_name: Option<String>,
    disabled: bool,
}

struct Inner {
    docs: Mutex<BTreeMap<String, Map<String, Value>>>,
    accounts: Mutex<HashMap<String, Account>>,
    failures: Mutex<VecDeque<RemoteError>>,
    online: AtomicBool,
    writes: AtomicUsize,
    user: watch::Sender<Option<RemoteUser>>,
    changes: broadcast::Sender<String>,
}

/// In-process remote store and account service with a reachability switch
/// and one-shot failure injection.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (user, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                accounts: Mutex::new(HashMap::new()),
                failures: Mutex::new(VecDeque::new()),
                online: AtomicBool::new(true),
                writes: AtomicUsize::new(0),
                user,
                changes,
            }),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Queues an error returned by the next remote call instead of its result.
    pub fn fail_next(&self, error: RemoteError) {
        if let Ok(mut guard) = self.inner.failures.lock() {
            guard.push_back(error);
        }
    }

    /// Number of create/update/delete calls that reached the store.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn document(&self, path: &DocumentPath) -> Option<Map<String, Value>> {
        self.inner
            .docs
            .lock()
            .ok()
            .and_then(|docs| docs.get(path.as_str()).cloned())
    }

    pub fn documents_in(&self, collection: &DocumentPath) -> Vec<RemoteDocument> {
        self.inner.snapshot(collection)
    }

    /// Writes a document directly, as another device would, and notifies subscribers.
    pub fn seed(&self, path: &DocumentPath, data: Map<String, Value>) {
        if let Ok(mut docs) = self.inner.docs.lock() {
            docs.insert(path.as_str().to_string(), data);
        }
        self.inner.notify(path);
    }

    pub fn add_account(&self, email: &str, password: &str) -> String {
        let uid = Uuid::new_v4().simple().to_string();
        if let Ok(mut accounts) = self.inner.accounts.lock() {
            accounts.insert(
                email.to_lowercase(),
                Account {
                    uid: uid.clone(),
                    password: password.to_string(),
                    display_name: None,
                    disabled: false,
                },
            );
        }
        uid
    }

    pub fn disable_account(&self, email: &str) {
        if let Ok(mut accounts) = self.inner.accounts.lock() {
            if let Some(account) = accounts.get_mut(&email.to_lowercase()) {
                account.disabled = true;
            }
        }
    }

    pub fn account_uid(&self, email: &str) -> Option<String> {
        self.inner
            .accounts
            .lock()
            .ok()
            .and_then(|accounts| accounts.get(&email.to_lowercase()).map(|a| a.uid.clone()))
    }

    fn check(&self) -> Result<(), RemoteError> {
        if let Some(error) = self.inner.failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(error);
        }
        if !self.is_online() {
            return Err(RemoteError::Network("offline".into()));
        }
        Ok(())
    }
}

impl Inner {
    fn snapshot(&self, collection: &DocumentPath) -> Vec<RemoteDocument> {
        let prefix = format!("{}/", collection.as_str());
        let Ok(docs) = self.docs.lock() else {
            return Vec::new();
        };
        docs.range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, data)| RemoteDocument {
                id: key[prefix.len()..].to_string(),
                data: data.clone(),
            })
            .collect()
    }

    fn notify(&self, path: &DocumentPath) {
        let _ = self.changes.send(path.parent().as_str().to_string());
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, path: &DocumentPath) -> Result<Option<RemoteDocument>, RemoteError> {
        self.check()?;
        let id = path.id().unwrap_or_default().to_string();
        Ok(self.document(path).map(|data| RemoteDocument { id, data }))
    }

    async fn create(&self, path: &DocumentPath, data: Map<String, Value>) -> Result<String, RemoteError> {
        self.check()?;
        let target = if path.is_document() {
            path.clone()
        } else {
            path.child(&Uuid::now_v7().simple().to_string())
        };
        {
            let mut docs = self
                .inner
                .docs
                .lock()
                .map_err(|_| RemoteError::Internal("store poisoned".into()))?;
            if docs.contains_key(target.as_str()) {
                return Err(RemoteError::AlreadyExists);
            }
            docs.insert(target.as_str().to_string(), data);
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.notify(&target);
        Ok(target.id().unwrap_or_default().to_string())
    }

    async fn update(&self, path: &DocumentPath, data: Map<String, Value>) -> Result<(), RemoteError> {
        self.check()?;
        {
            let mut docs = self
                .inner
                .docs
                .lock()
                .map_err(|_| RemoteError::Internal("store poisoned".into()))?;
            let existing = docs.get_mut(path.as_str()).ok_or(RemoteError::NotFound)?;
            existing.extend(data);
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.notify(path);
        Ok(())
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError> {
        self.check()?;
        {
            let mut docs = self
                .inner
                .docs
                .lock()
                .map_err(|_| RemoteError::Internal("store poisoned".into()))?;
            docs.remove(path.as_str()).ok_or(RemoteError::NotFound)?;
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.notify(path);
        Ok(())
    }

    fn subscribe(&self, collection: &DocumentPath) -> BoxStream<'static, Result<Vec<RemoteDocument>, RemoteError>> {
        let inner = self.inner.clone();
        let receiver = self.inner.changes.subscribe();
        let watched = collection.clone();

        stream::unfold(
            (inner, receiver, watched, true),
            |(inner, mut receiver, watched, first)| async move {
                if first {
                    let snapshot = inner.snapshot(&watched);
                    return Some((Ok(snapshot), (inner, receiver, watched, false)));
                }
                loop {
                    match receiver.recv().await {
                        Ok(changed) if changed == watched.as_str() => {
                            let snapshot = inner.snapshot(&watched);
                            return Some((Ok(snapshot), (inner, receiver, watched, false)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let snapshot = inner.snapshot(&watched);
                            return Some((Ok(snapshot), (inner, receiver, watched, false)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed()
    }
}

#[async_trait]
impl RemoteAuth for MemoryRemote {
    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteUser, RemoteError> {
        self.check()?;
        let user = {
            let accounts = self
                .inner
                .accounts
                .lock()
                .map_err(|_| RemoteError::Internal("accounts poisoned".into()))?;
            let account = accounts
                .get(&email.to_lowercase())
                .ok_or(RemoteError::UserNotFound)?;
            if account.disabled {
                return Err(RemoteError::UserDisabled);
            }
            if account.password != password {
                return Err(RemoteError::InvalidCredential);
            }
            RemoteUser {
                uid: account.uid.clone(),
                email: Some(email.to_lowercase()),
                display_name: account.display_name.clone(),
            }
        };
        self.inner.user.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn create_account(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<RemoteUser, RemoteError> {
        self.check()?;
        if password.len() < 6 {
            return Err(RemoteError::WeakPassword);
        }
        let user = {
            let mut accounts = self
                .inner
                .accounts
                .lock()
                .map_err(|_| RemoteError::Internal("accounts poisoned".into()))?;
            let key = email.to_lowercase();
            if accounts.contains_key(&key) {
                return Err(RemoteError::EmailInUse);
            }
            let uid = Uuid::new_v4().simple().to_string();
            accounts.insert(
                key.clone(),
                Account {
                    uid: uid.clone(),
                    password: password.to_string(),
                    display_name: display_name.map(str::to_owned),
                    disabled: false,
                },
            );
            RemoteUser {
                uid,
                email: Some(key),
                display_name: display_name.map(str::to_owned),
            }
        };
        self.inner.user.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.inner.user.send_replace(None);
        Ok(())
    }

    fn current_user(&self) -> Option<RemoteUser> {
        self.inner.user.borrow().clone()
    }

    fn watch_user(&self) -> watch::Receiver<Option<RemoteUser>> {
        self.inner.user.subscribe()
    }
}
