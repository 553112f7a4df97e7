use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::connectivity::ConnectivityHandle;
use crate::id::new_temp_id;
use crate::logging::{email_fingerprint, LogScope};
use crate::model::OwnerId;
use crate::queue::SyncService;
use crate::remote::{with_deadline, DocumentPath, RemoteAuth, RemoteError, RemoteStore, RemoteUser};
use crate::time::Clock;
use crate::{AppError, AppResult};

mod types;
mod validate;
mod vault;

pub use types::{
    AuthOutcome, CachedCredentials, CachedUser, FinalizeOutcome, PendingRegistration,
    RecoveryCredentials, RegisterParams, SessionMode, SessionState,
};
pub use validate::{
    normalize_email, validate_register, validate_sign_in, NormalizedRegistration, MIN_PASSWORD_LEN,
};
pub use vault::{generate_salt, hash_password, verify_password, CredentialVault};

pub type SessionListener = Arc<dyn Fn(&SessionState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Collaborators the session manager is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub remote_auth: Arc<dyn RemoteAuth>,
    pub remote: Arc<dyn RemoteStore>,
    pub vault: CredentialVault,
    pub sync: SyncService,
    pub connectivity: ConnectivityHandle,
    pub config: Arc<EngineConfig>,
    pub clock: Arc<dyn Clock>,
}

struct SessionInner {
    deps: SessionDeps,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<(ListenerId, SessionListener)>>,
    next_listener: AtomicU64,
    init: OnceCell<()>,
    finalizing: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the single-flight flag of a finalization pass when dropped.
struct FinalizeGuard {
    flag: Arc<AtomicBool>,
}

impl FinalizeGuard {
    fn try_begin(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Owns the current identity: online and offline sign-in, deferred
/// registration and its finalization. Clones share all state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                deps,
                state: Mutex::new(SessionState::Uninitialized),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                init: OnceCell::new(),
                finalizing: Arc::new(AtomicBool::new(false)),
                watcher: Mutex::new(None),
            }),
        }
    }

    fn deps(&self) -> &SessionDeps {
        &self.inner.deps
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.inner.deps.vault
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn current_user(&self) -> Option<CachedUser> {
        self.state().user().cloned()
    }

    pub fn current_identity(&self) -> Option<OwnerId> {
        self.current_user().map(|user| user.uid)
    }

    fn set_state(&self, next: SessionState) {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *state = next.clone();
        }
        debug!(target: "dosekeeper", event = "session_state", state = next.label());
        let listeners: Vec<SessionListener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&next);
        }
    }

    fn authenticate(&self, user: CachedUser, mode: SessionMode) -> AuthOutcome {
        self.set_state(SessionState::Authenticated {
            user: user.clone(),
            mode,
        });
        AuthOutcome { user, mode }
    }

    /// Registers a listener and calls it right away with the current state.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        let listener: SessionListener = Arc::new(listener);
        listener(&self.state());
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Runs once per manager; concurrent callers await the same pass.
    pub async fn initialize(&self) -> AppResult<SessionState> {
        self.inner
            .init
            .get_or_try_init(|| self.run_initialize())
            .await?;
        Ok(self.state())
    }

    async fn run_initialize(&self) -> AppResult<()> {
        let scope = LogScope::new("session_initialize", None);
        self.set_state(SessionState::Initializing);

        if self.deps().connectivity.is_online() {
            if let Err(err) = self.finalize_pending_registration_if_any().await {
                warn!(
                    target: "dosekeeper",
                    event = "finalize_on_init_failed",
                    code = err.code()
                );
            }
        }
        self.attempt_remote_restore().await?;

        if let Err(err) = self.restore_session().await {
            self.set_state(SessionState::SignedOut);
            scope.fail(&err);
            return Err(err);
        }
        self.spawn_watcher();
        scope.success(json!({ "state": self.state().label() }));
        Ok(())
    }

    async fn restore_session(&self) -> AppResult<()> {
        let pending = self.vault().pending().await?;
        if let (Some(remote), None) = (self.deps().remote_auth.current_user(), pending.as_ref()) {
            let user = self.cache_remote_user(&remote, None).await?;
            self.authenticate(user, SessionMode::Online);
            return Ok(());
        }
        match self.vault().cached_user().await? {
            Some(user) => {
                self.authenticate(user, SessionMode::Offline);
            }
            None => self.set_state(SessionState::SignedOut),
        }
        Ok(())
    }

    fn spawn_watcher(&self) {
        let mut rx = self.deps().remote_auth.watch_user();
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else { break };
                let manager = SessionManager { inner };
                if let Some(remote) = current {
                    if let Err(err) = manager.on_remote_user(&remote).await {
                        warn!(
                            target: "dosekeeper",
                            event = "remote_user_refresh_failed",
                            code = err.code()
                        );
                    }
                }
            }
        });
        let mut watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = watcher.replace(task) {
            previous.abort();
        }
    }

    /// Keeps the cached profile in step with the remote session. A pending
    /// registration owns the identity until it is finalized.
    async fn on_remote_user(&self, remote: &RemoteUser) -> AppResult<()> {
        if self.vault().pending().await?.is_some() {
            return Ok(());
        }
        let user = self.cache_remote_user(remote, None).await?;
        if let SessionState::Authenticated { user: current, .. } = self.state() {
            if current.uid == user.uid {
                self.authenticate(user, SessionMode::Online);
            }
        }
        Ok(())
    }

    /// Writes the cached profile and owner for a remote account, keeping
    /// profile fields already known for the same uid.
    async fn cache_remote_user(&self, remote: &RemoteUser, email: Option<&str>) -> AppResult<CachedUser> {
        let now = self.deps().clock.now_ms();
        let uid = OwnerId::new(remote.uid.clone());
        let previous = self
            .vault()
            .cached_user()
            .await?
            .filter(|user| user.uid == uid);
        let email = remote
            .email
            .clone()
            .or_else(|| email.map(str::to_owned))
            .or_else(|| previous.as_ref().map(|user| user.email.clone()))
            .unwrap_or_default();
        let user = CachedUser {
            uid: uid.clone(),
            email: normalize_email(&email),
            display_name: remote
                .display_name
                .clone()
                .or_else(|| previous.as_ref().and_then(|user| user.display_name.clone())),
            full_name: previous.as_ref().and_then(|user| user.full_name.clone()),
            username: previous.as_ref().and_then(|user| user.username.clone()),
            phone: previous.as_ref().and_then(|user| user.phone.clone()),
            role: previous.as_ref().and_then(|user| user.role.clone()),
            is_pending_registration: false,
            pending_created_at: None,
            cached_at: now,
            last_online_login: now,
        };
        self.vault().set_cached_user(&user).await?;
        self.vault().set_cached_owner(&uid).await?;
        Ok(user)
    }

    /// Folds the remote profile document into the cached user. Failures
    /// leave the user as it was.
    async fn enrich_profile(&self, mut user: CachedUser) -> CachedUser {
        let path = DocumentPath::user(user.uid.as_str());
        let fetched = with_deadline(self.deps().config.remote_timeout(), self.deps().remote.get(&path)).await;
        let doc = match fetched {
            Ok(Some(doc)) => doc,
            Ok(None) => return user,
            Err(err) => {
                debug!(target: "dosekeeper", event = "profile_fetch_failed", error = %err);
                return user;
            }
        };
        let text = |key: &str| {
            doc.data
                .get(key)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };
        if let Some(name) = text("fullName").or_else(|| text("displayName")) {
            user.full_name = Some(name);
        }
        user.username = text("username").or(user.username);
        user.phone = text("phone").or(user.phone);
        user.role = text("role").or(user.role);
        if let Err(err) = self.vault().set_cached_user(&user).await {
            debug!(target: "dosekeeper", event = "profile_cache_failed", code = err.code());
        }
        user
    }

    /// Creates or merges `users/<uid>`. Best-effort.
    async fn write_profile(&self, uid: &str, email: &str, full_name: &str, username: &str) {
        let now = self.deps().clock.now_ms();
        let path = DocumentPath::user(uid);
        let mut body = Map::new();
        body.insert("uid".into(), json!(uid));
        body.insert("email".into(), json!(email));
        body.insert("fullName".into(), json!(full_name));
        body.insert("username".into(), json!(username));
        body.insert("createdAt".into(), json!(now));
        body.insert("updatedAt".into(), json!(now));

        let timeout = self.deps().config.remote_timeout();
        let result = match with_deadline(timeout, self.deps().remote.create(&path, body.clone())).await {
            Err(RemoteError::AlreadyExists) => {
                body.remove("createdAt");
                with_deadline(timeout, self.deps().remote.update(&path, body)).await
            }
            other => other.map(|_| ()),
        };
        if let Err(err) = result {
            warn!(target: "dosekeeper", event = "profile_write_failed", error = %err);
        }
    }

    /// Validates, then signs in remotely when reachable. Network-class
    /// failures fall back to the offline credential check.
    pub async fn sign_in(&self, email: &str, password: &str) -> AppResult<AuthOutcome> {
        let email = validate_sign_in(email, password)?;
        let scope = LogScope::new("sign_in", None);

        if !self.deps().connectivity.is_online() {
            return self.scoped(&scope, self.offline_login(&email, password).await);
        }

        let timeout = self.deps().config.remote_timeout();
        match with_deadline(timeout, self.deps().remote_auth.sign_in(&email, password)).await {
            Ok(remote) => {
                let result = self.complete_online_login(&remote, &email, password).await;
                self.scoped(&scope, result)
            }
            Err(err) if err.is_network_class() => {
                info!(
                    target: "dosekeeper",
                    event = "sign_in_offline_fallback",
                    email = %email_fingerprint(&email),
                    error = %err
                );
                self.scoped(&scope, self.offline_login(&email, password).await)
            }
            Err(err) => {
                let err = AppError::from(err);
                scope.fail(&err);
                Err(err)
            }
        }
    }

    fn scoped(&self, scope: &LogScope, result: AppResult<AuthOutcome>) -> AppResult<AuthOutcome> {
        match &result {
            Ok(outcome) => scope.success(json!({
                "uid": outcome.user.uid.as_str(),
                "offline": outcome.is_offline(),
            })),
            Err(err) => scope.fail(err),
        }
        result
    }

    async fn complete_online_login(
        &self,
        remote: &RemoteUser,
        email: &str,
        password: &str,
    ) -> AppResult<AuthOutcome> {
        let user = self.cache_remote_user(remote, Some(email)).await?;
        self.vault().store_credentials(email, password).await?;
        self.vault().set_recovery(email, password).await?;
        let user = self.enrich_profile(user).await;
        Ok(self.authenticate(user, SessionMode::Online))
    }

    /// Signs in against the cached credential record only.
    pub async fn sign_in_offline(&self, email: &str, password: &str) -> AppResult<AuthOutcome> {
        let email = validate_sign_in(email, password)?;
        let scope = LogScope::new("sign_in_offline", None);
        self.scoped(&scope, self.offline_login(&email, password).await)
    }

    async fn offline_login(&self, email: &str, password: &str) -> AppResult<AuthOutcome> {
        let Some(credentials) = self.vault().credentials().await? else {
            return Err(AppError::new(
                "OFFLINE/NO_CACHED_SESSION",
                "No saved session on this device. Connect once to sign in.",
            ));
        };
        if credentials.owner_email != normalize_email(email) {
            return Err(AppError::new(
                "OFFLINE/EMAIL_MISMATCH",
                "This device has a saved session for a different email.",
            ));
        }
        if !verify_password(password, &credentials)? {
            return Err(AppError::new("OFFLINE/WRONG_PASSWORD", "Incorrect password."));
        }
        let Some(user) = self.vault().cached_user().await? else {
            return Err(AppError::new(
                "OFFLINE/NO_CACHED_USER",
                "Saved profile is missing. Connect once to sign in.",
            ));
        };
        self.vault().touch_last_used().await?;
        self.vault().set_cached_owner(&user.uid).await?;
        Ok(self.authenticate(user, SessionMode::Offline))
    }

    /// Creates the account remotely when reachable, otherwise as a pending
    /// registration under a temporary identity that is usable right away.
    pub async fn register(&self, params: &RegisterParams) -> AppResult<AuthOutcome> {
        let input = validate_register(params)?;
        let scope = LogScope::new("register", None);

        if !self.deps().connectivity.is_online() {
            return self.scoped(&scope, self.register_pending(&input).await);
        }

        let timeout = self.deps().config.remote_timeout();
        let created = with_deadline(
            timeout,
            self.deps()
                .remote_auth
                .create_account(&input.email, &input.password, Some(&input.full_name)),
        )
        .await;
        match created {
            Ok(remote) => {
                let result = self.complete_online_registration(&remote, &input).await;
                self.scoped(&scope, result)
            }
            Err(err) if err.is_network_class() => {
                info!(
                    target: "dosekeeper",
                    event = "register_pending_fallback",
                    email = %email_fingerprint(&input.email),
                    error = %err
                );
                self.scoped(&scope, self.register_pending(&input).await)
            }
            Err(err) => {
                let err = AppError::from(err);
                scope.fail(&err);
                Err(err)
            }
        }
    }

    async fn complete_online_registration(
        &self,
        remote: &RemoteUser,
        input: &NormalizedRegistration,
    ) -> AppResult<AuthOutcome> {
        self.write_profile(&remote.uid, &input.email, &input.full_name, &input.username)
            .await;
        let mut user = self.cache_remote_user(remote, Some(&input.email)).await?;
        user.full_name = Some(input.full_name.clone());
        user.display_name = user.display_name.or_else(|| Some(input.full_name.clone()));
        user.username = Some(input.username.clone());
        self.vault().set_cached_user(&user).await?;
        self.vault().store_credentials(&input.email, &input.password).await?;
        self.vault().set_recovery(&input.email, &input.password).await?;
        Ok(self.authenticate(user, SessionMode::Online))
    }

    async fn register_pending(&self, input: &NormalizedRegistration) -> AppResult<AuthOutcome> {
        let now = self.deps().clock.now_ms();
        // Re-registering the same email keeps the namespace already in use.
        let temporary = match self.vault().pending().await? {
            Some(existing) if existing.email == input.email => existing.temporary_identity,
            _ => OwnerId::new(new_temp_id(&self.deps().config.temp_owner_prefix, now)),
        };
        let pending = PendingRegistration {
            temporary_identity: temporary.clone(),
            email: input.email.clone(),
            password: input.password.clone(),
            display_name: input.full_name.clone(),
            username: input.username.clone(),
            created_at: now,
        };
        self.vault().set_pending(&pending).await?;

        let user = CachedUser {
            uid: temporary.clone(),
            email: input.email.clone(),
            display_name: Some(input.full_name.clone()),
            full_name: Some(input.full_name.clone()),
            username: Some(input.username.clone()),
            phone: None,
            role: None,
            is_pending_registration: true,
            pending_created_at: Some(now),
            cached_at: now,
            last_online_login: 0,
        };
        self.vault().set_cached_user(&user).await?;
        self.vault().set_cached_owner(&temporary).await?;
        self.vault().store_credentials(&input.email, &input.password).await?;
        self.vault().set_recovery(&input.email, &input.password).await?;
        info!(
            target: "dosekeeper",
            event = "registration_pending",
            owner = %temporary
        );
        Ok(self.authenticate(user, SessionMode::Offline))
    }

    /// Turns a pending registration into a remote account and migrates the
    /// temporary namespace onto it. Safe to call repeatedly.
    pub async fn finalize_pending_registration_if_any(&self) -> AppResult<FinalizeOutcome> {
        let Some(_guard) = FinalizeGuard::try_begin(&self.inner.finalizing) else {
            return Ok(FinalizeOutcome::AlreadyRunning);
        };
        if !self.deps().connectivity.is_online() {
            return Ok(FinalizeOutcome::Offline);
        }
        let Some(pending) = self.vault().pending().await? else {
            return Ok(FinalizeOutcome::NothingPending);
        };

        let scope = LogScope::new("finalize_registration", Some(pending.temporary_identity.as_str()));
        match self.finalize(&pending).await {
            Ok(outcome) => {
                if let FinalizeOutcome::Finalized { to, .. } = &outcome {
                    scope.success(json!({ "to": to.as_str() }));
                }
                Ok(outcome)
            }
            Err(err) => {
                scope.fail(&err);
                Err(err)
            }
        }
    }

    async fn finalize(&self, pending: &PendingRegistration) -> AppResult<FinalizeOutcome> {
        let timeout = self.deps().config.remote_timeout();
        let same_email = |user: &RemoteUser| {
            user.email
                .as_deref()
                .map(normalize_email)
                .is_some_and(|email| email == pending.email)
        };

        let (remote, created) = match self.deps().remote_auth.current_user() {
            Some(user) if same_email(&user) => (user, false),
            _ => {
                let attempt = with_deadline(
                    timeout,
                    self.deps().remote_auth.create_account(
                        &pending.email,
                        &pending.password,
                        Some(&pending.display_name),
                    ),
                )
                .await;
                match attempt {
                    Ok(user) => (user, true),
                    Err(RemoteError::EmailInUse) => {
                        let user = with_deadline(
                            timeout,
                            self.deps().remote_auth.sign_in(&pending.email, &pending.password),
                        )
                        .await?;
                        (user, false)
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let from = pending.temporary_identity.clone();
        let to = OwnerId::new(remote.uid.clone());
        if created {
            self.write_profile(&remote.uid, &pending.email, &pending.display_name, &pending.username)
                .await;
        }
        self.deps().sync.migrate_user_namespace(&from, &to).await?;

        let mut user = self.cache_remote_user(&remote, Some(&pending.email)).await?;
        user.full_name = user.full_name.or_else(|| Some(pending.display_name.clone()));
        user.username = user.username.or_else(|| Some(pending.username.clone()));
        let user = self.enrich_profile(user).await;
        self.vault().set_cached_user(&user).await?;
        self.vault().store_credentials(&pending.email, &pending.password).await?;
        self.vault().set_recovery(&pending.email, &pending.password).await?;
        self.vault().set_cached_owner(&to).await?;
        self.vault().clear_pending().await?;

        let on_temporary = self
            .current_identity()
            .is_some_and(|current| current == from);
        if on_temporary {
            self.authenticate(user, SessionMode::Online);
        }
        Ok(FinalizeOutcome::Finalized { from, to })
    }

    /// Signs the remote back in from the recovery pair when no remote session
    /// exists. Returns whether a session was restored.
    pub async fn attempt_remote_restore(&self) -> AppResult<bool> {
        if self.deps().remote_auth.current_user().is_some() || !self.deps().connectivity.is_online() {
            return Ok(false);
        }
        if self.vault().pending().await?.is_some() {
            return Ok(false);
        }
        let Some(recovery) = self.vault().recovery().await? else {
            return Ok(false);
        };
        let timeout = self.deps().config.remote_timeout();
        match with_deadline(
            timeout,
            self.deps().remote_auth.sign_in(&recovery.email, &recovery.password),
        )
        .await
        {
            Ok(user) => {
                info!(target: "dosekeeper", event = "remote_session_restored", uid = %user.uid);
                Ok(true)
            }
            Err(err) => {
                warn!(
                    target: "dosekeeper",
                    event = "remote_restore_failed",
                    email = %email_fingerprint(&recovery.email),
                    error = %err
                );
                Ok(false)
            }
        }
    }

    /// Connectivity came back: finalize, restore, then refresh the profile.
    pub async fn handle_reconnect(&self) -> AppResult<()> {
        let owner = self.current_identity();
        let scope = LogScope::new("handle_reconnect", owner.as_ref().map(OwnerId::as_str));

        if let Err(err) = self.finalize_pending_registration_if_any().await {
            warn!(target: "dosekeeper", event = "finalize_on_reconnect_failed", code = err.code());
        }
        if self.deps().remote_auth.current_user().is_none() {
            self.attempt_remote_restore().await?;
        }
        if let Some(remote) = self.deps().remote_auth.current_user() {
            if self.vault().pending().await?.is_none() {
                let user = self.cache_remote_user(&remote, None).await?;
                let user = self.enrich_profile(user).await;
                let same_user = self
                    .current_identity()
                    .is_some_and(|current| current == user.uid);
                if same_user {
                    self.authenticate(user, SessionMode::Online);
                }
            }
        }
        scope.success(json!({ "state": self.state().label() }));
        Ok(())
    }

    /// Always ends the in-memory session. Cached data, credentials and any
    /// pending registration are wiped only when `clear_cache` is set.
    pub async fn sign_out(&self, clear_cache: bool) -> AppResult<()> {
        let owner = self.current_identity();
        let scope = LogScope::new("sign_out", owner.as_ref().map(OwnerId::as_str));
        let timeout = self.deps().config.remote_timeout();
        if let Err(err) = with_deadline(timeout, self.deps().remote_auth.sign_out()).await {
            warn!(target: "dosekeeper", event = "remote_sign_out_failed", error = %err);
        }
        self.set_state(SessionState::SignedOut);

        if clear_cache {
            let cleared = async {
                let collections = self.deps().sync.clear_all().await?;
                self.vault().clear_all().await?;
                Ok::<usize, AppError>(collections)
            }
            .await;
            match cleared {
                Ok(collections) => scope.success(json!({ "cleared_collections": collections })),
                Err(err) => {
                    scope.fail(&err);
                    return Err(err);
                }
            }
        } else {
            scope.success(json!({ "cleared_collections": 0 }));
        }
        Ok(())
    }

    /// Stops the remote auth watcher and drops every listener.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        debug!(target: "dosekeeper", event = "session_shutdown");
    }
}
