use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{CachedCredentials, CachedUser, PendingRegistration, RecoveryCredentials};
use crate::logging::email_fingerprint;
use crate::model::OwnerId;
use crate::storage::{keys, BatchOp, StoreHandle};
use crate::time::Clock;
use crate::{AppError, AppResult};

const HASH_LEN: usize = 32;
// Argon2id at 19 MiB, two passes, one lane.
const MEMORY_KIB: u32 = 19 * 1024;
const ITERATIONS: u32 = 2;
const PARALLELISM: u32 = 1;

fn hash_error(err: argon2::Error) -> AppError {
    AppError::new("AUTH/HASH_FAILED", "Could not secure the password on this device.")
        .with_context("detail", err.to_string())
}

/// Hex-encoded Argon2id digest of `password` under the stored `salt`.
pub fn hash_password(password: &str, salt: &str) -> AppResult<String> {
    let params = Params::new(MEMORY_KIB, ITERATIONS, PARALLELISM, Some(HASH_LEN)).map_err(hash_error)?;
    let mut digest = [0u8; HASH_LEN];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut digest)
        .map_err(hash_error)?;
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Constant-time check of `password` against the cached record.
pub fn verify_password(password: &str, credentials: &CachedCredentials) -> AppResult<bool> {
    let candidate = hash_password(password, &credentials.salt)?;
    Ok(candidate
        .as_bytes()
        .ct_eq(credentials.password_hash.as_bytes())
        .into())
}

pub fn generate_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Device-local identity material: offline-login hash, recovery pair,
/// pending registration and the cached profile.
#[derive(Clone)]
pub struct CredentialVault {
    store: StoreHandle,
    clock: Arc<dyn Clock>,
}

impl CredentialVault {
    pub fn new(store: StoreHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Replaces the single credential record with a freshly salted hash.
    pub async fn store_credentials(&self, email: &str, password: &str) -> AppResult<()> {
        let now = self.clock.now_ms();
        let salt = generate_salt();
        let record = CachedCredentials {
            owner_email: email.to_lowercase(),
            password_hash: hash_password(password, &salt)?,
            salt,
            created_at: now,
            last_used_at: now,
        };
        self.store.set_json(keys::CREDENTIALS, &record).await?;
        debug!(
            target: "dosekeeper",
            event = "credentials_stored",
            email = %email_fingerprint(email)
        );
        Ok(())
    }

    pub async fn credentials(&self) -> AppResult<Option<CachedCredentials>> {
        self.store.get_json(keys::CREDENTIALS).await
    }

    pub async fn touch_last_used(&self) -> AppResult<()> {
        if let Some(mut record) = self.credentials().await? {
            record.last_used_at = self.clock.now_ms();
            self.store.set_json(keys::CREDENTIALS, &record).await?;
        }
        Ok(())
    }

    pub async fn set_recovery(&self, email: &str, password: &str) -> AppResult<()> {
        let recovery = RecoveryCredentials {
            email: email.to_lowercase(),
            password: password.to_string(),
        };
        self.store.set_json(keys::RECOVERY, &recovery).await
    }

    pub async fn recovery(&self) -> AppResult<Option<RecoveryCredentials>> {
        self.store.get_json(keys::RECOVERY).await
    }

    pub async fn set_pending(&self, pending: &PendingRegistration) -> AppResult<()> {
        self.store.set_json(keys::PENDING_REGISTRATION, pending).await
    }

    pub async fn pending(&self) -> AppResult<Option<PendingRegistration>> {
        self.store.get_json(keys::PENDING_REGISTRATION).await
    }

    pub async fn clear_pending(&self) -> AppResult<()> {
        self.store.remove(keys::PENDING_REGISTRATION).await
    }

    pub async fn set_cached_user(&self, user: &CachedUser) -> AppResult<()> {
        self.store.set_json(keys::CACHED_USER, user).await
    }

    pub async fn cached_user(&self) -> AppResult<Option<CachedUser>> {
        self.store.get_json(keys::CACHED_USER).await
    }

    pub async fn set_cached_owner(&self, owner: &OwnerId) -> AppResult<()> {
        self.store.set_json(keys::CACHED_OWNER, owner).await
    }

    pub async fn cached_owner(&self) -> AppResult<Option<OwnerId>> {
        self.store.get_json(keys::CACHED_OWNER).await
    }

    /// Removes every piece of identity material in one batch.
    pub async fn clear_all(&self) -> AppResult<()> {
        let ops = [
            keys::CACHED_USER,
            keys::CACHED_OWNER,
            keys::CREDENTIALS,
            keys::RECOVERY,
            keys::PENDING_REGISTRATION,
        ]
        .into_iter()
        .map(BatchOp::remove)
        .collect();
        self.store.apply_batch(ops).await?;
        info!(target: "dosekeeper", event = "vault_cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn vault() -> (CredentialVault, ManualClock) {
        let clock = ManualClock::new(1_000);
        let vault = CredentialVault::new(StoreHandle::in_memory(), Arc::new(clock.clone()));
        (vault, clock)
    }

    #[test]
    fn hash_depends_on_salt() {
        let a = hash_password("secret1", "salt-aaaa").unwrap();
        let b = hash_password("secret1", "salt-bbbb").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, hash_password("secret1", "salt-aaaa").unwrap());
    }

    #[test]
    fn too_short_salt_is_an_error_not_a_panic() {
        let err = hash_password("secret1", "abc").unwrap_err();
        assert_eq!(err.code(), "AUTH/HASH_FAILED");
    }

    #[tokio::test]
    async fn verification_accepts_only_the_stored_password() {
        let (vault, _) = vault();
        vault.store_credentials("ana@example.com", "secret1").await.unwrap();
        let stored = vault.credentials().await.unwrap().unwrap();
        assert!(verify_password("secret1", &stored).unwrap());
        assert!(!verify_password("secret2", &stored).unwrap());
        assert!(!verify_password("", &stored).unwrap());

        let mut tampered = stored.clone();
        tampered.password_hash.truncate(10);
        assert!(!verify_password("secret1", &tampered).unwrap());
    }

    #[tokio::test]
    async fn credentials_are_salted_and_touched() {
        let (vault, clock) = vault();
        vault.store_credentials("Ana@Example.com", "secret1").await.unwrap();
        let stored = vault.credentials().await.unwrap().unwrap();
        assert_eq!(stored.owner_email, "ana@example.com");
        assert_eq!(stored.password_hash, hash_password("secret1", &stored.salt).unwrap());
        assert_eq!(stored.salt.len(), 32);
        assert_eq!(stored.last_used_at, 1_000);

        clock.set(5_000);
        vault.touch_last_used().await.unwrap();
        let touched = vault.credentials().await.unwrap().unwrap();
        assert_eq!(touched.created_at, 1_000);
        assert_eq!(touched.last_used_at, 5_000);
    }

    #[tokio::test]
    async fn clear_all_removes_every_key() {
        let (vault, _) = vault();
        vault.store_credentials("ana@example.com", "secret1").await.unwrap();
        vault.set_recovery("ana@example.com", "secret1").await.unwrap();
        vault.set_cached_owner(&OwnerId::new("u1")).await.unwrap();
        vault
            .set_pending(&PendingRegistration {
                temporary_identity: OwnerId::new("temp_1_abc"),
                email: "ana@example.com".into(),
                password: "secret1".into(),
                display_name: "Ana".into(),
                username: "ana".into(),
                created_at: 1,
            })
            .await
            .unwrap();

        vault.clear_all().await.unwrap();
        assert!(vault.credentials().await.unwrap().is_none());
        assert!(vault.recovery().await.unwrap().is_none());
        assert!(vault.pending().await.unwrap().is_none());
        assert!(vault.cached_owner().await.unwrap().is_none());
    }
}
