use serde::{Deserialize, Serialize};

use crate::model::OwnerId;

/// Locally cached profile of the current identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedUser {
    pub uid: OwnerId,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_pending_registration: bool,
    #[serde(default)]
    pub pending_created_at: Option<i64>,
    pub cached_at: i64,
    pub last_online_login: i64,
}

/// Salted hash enabling offline sign-in. One per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredentials {
    pub owner_email: String,
    pub password_hash: String,
    pub salt: String,
    pub created_at: i64,
    pub last_used_at: i64,
}

/// Plaintext pair used to restore the remote session without user input.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for RecoveryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCredentials")
            .field("email", &crate::logging::email_fingerprint(&self.email))
            .finish_non_exhaustive()
    }
}

/// Account created while offline, waiting for the remote to mint its identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRegistration {
    pub temporary_identity: OwnerId,
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub username: String,
    pub created_at: i64,
}

impl std::fmt::Debug for PendingRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistration")
            .field("temporary_identity", &self.temporary_identity)
            .field("username", &self.username)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegisterParams {
    pub full_name: String,
    pub email: String,
    pub username: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Authenticated { user: CachedUser, mode: SessionMode },
    SignedOut,
}

impl SessionState {
    pub fn user(&self) -> Option<&CachedUser> {
        match self {
            SessionState::Authenticated { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Authenticated {
                mode: SessionMode::Online,
                ..
            } => "authenticated_online",
            SessionState::Authenticated {
                mode: SessionMode::Offline,
                ..
            } => "authenticated_offline",
            SessionState::SignedOut => "signed_out",
        }
    }
}

/// Result of a successful sign-in or registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub user: CachedUser,
    pub mode: SessionMode,
}

impl AuthOutcome {
    pub fn is_offline(&self) -> bool {
        self.mode == SessionMode::Offline
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    NothingPending,
    AlreadyRunning,
    Offline,
    Finalized { from: OwnerId, to: OwnerId },
}
