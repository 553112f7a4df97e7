use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{Collection, OwnerId};

mod auth;
mod memory;

pub use auth::{RemoteAuth, RemoteUser};
pub use memory::MemoryRemote;

/// Slash-separated path into the remote document tree. An even number of
/// segments addresses a document, an odd number a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentPath(String);

impl DocumentPath {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim_matches('/').to_string())
    }

    pub fn user(uid: &str) -> Self {
        Self(format!("users/{uid}"))
    }

    pub fn collection(owner: &OwnerId, collection: Collection) -> Self {
        Self(format!("users/{}/{}", owner.as_str(), collection.as_str()))
    }

    pub fn document(owner: &OwnerId, collection: Collection, id: &str) -> Self {
        Self(format!("users/{}/{}/{id}", owner.as_str(), collection.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segment_count(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split('/').count()
        }
    }

    pub fn is_document(&self) -> bool {
        let count = self.segment_count();
        count > 0 && count % 2 == 0
    }

    /// Last segment of a document path.
    pub fn id(&self) -> Option<&str> {
        if self.is_document() {
            self.0.rsplit('/').next()
        } else {
            None
        }
    }

    /// Collection a document lives in, or the path itself for collections.
    pub fn parent(&self) -> DocumentPath {
        if self.is_document() {
            match self.0.rsplit_once('/') {
                Some((parent, _)) => DocumentPath(parent.to_string()),
                None => self.clone(),
            }
        } else {
            self.clone()
        }
    }

    pub fn child(&self, id: &str) -> DocumentPath {
        DocumentPath(format!("{}/{id}", self.0))
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub data: Map<String, Value>,
}

/// Failures reported by the remote store or remote auth.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Network(String),
    #[error("remote call timed out")]
    Timeout,
    #[error("document not found")]
    NotFound,
    #[error("document already exists")]
    AlreadyExists,
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("email already in use")]
    EmailInUse,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("user not found")]
    UserNotFound,
    #[error("too many requests")]
    TooManyRequests,
    #[error("user disabled")]
    UserDisabled,
    #[error("password rejected as weak")]
    WeakPassword,
    #[error("remote internal error: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Worth retrying later without user involvement.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout)
    }

    /// The service could not be reached or could not serve the call. Sign-in
    /// falls back offline and the queue keeps the item for a later pass.
    pub fn is_network_class(&self) -> bool {
        self.is_transient() || matches!(self, RemoteError::Internal(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::Network(_) => "REMOTE/NETWORK",
            RemoteError::Timeout => "REMOTE/TIMEOUT",
            RemoteError::NotFound => "REMOTE/NOT_FOUND",
            RemoteError::AlreadyExists => "REMOTE/ALREADY_EXISTS",
            RemoteError::Rejected(_) => "REMOTE/REJECTED",
            RemoteError::EmailInUse => "REMOTE/EMAIL_IN_USE",
            RemoteError::InvalidCredential => "REMOTE/INVALID_CREDENTIAL",
            RemoteError::UserNotFound => "REMOTE/USER_NOT_FOUND",
            RemoteError::TooManyRequests => "REMOTE/TOO_MANY_REQUESTS",
            RemoteError::UserDisabled => "REMOTE/USER_DISABLED",
            RemoteError::WeakPassword => "AUTH/WEAK_PASSWORD",
            RemoteError::Internal(_) => "REMOTE/INTERNAL",
        }
    }

    pub(crate) fn user_message(&self) -> &'static str {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => {
                "Could not reach the server. Changes are kept on this device."
            }
            RemoteError::NotFound => "The item no longer exists on the server.",
            RemoteError::AlreadyExists => "The item already exists on the server.",
            RemoteError::Rejected(_) => "The server rejected the change.",
            RemoteError::EmailInUse => "This email is already registered.",
            RemoteError::InvalidCredential => "Email or password is incorrect.",
            RemoteError::UserNotFound => "No account exists for this email.",
            RemoteError::TooManyRequests => "Too many attempts. Try again later.",
            RemoteError::UserDisabled => "This account has been disabled.",
            RemoteError::WeakPassword => "Password must be at least 6 characters.",
            RemoteError::Internal(_) => "The server failed to process the request.",
        }
    }
}

/// Remote document API. Paths follow [`DocumentPath`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, path: &DocumentPath) -> Result<Option<RemoteDocument>, RemoteError>;

    /// Creating under a collection path lets the store assign the id; a
    /// document path fixes it and fails with `AlreadyExists` if taken.
    async fn create(&self, path: &DocumentPath, data: Map<String, Value>) -> Result<String, RemoteError>;

    /// Shallow merge into an existing document.
    async fn update(&self, path: &DocumentPath, data: Map<String, Value>) -> Result<(), RemoteError>;

    async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError>;

    /// Full result sets of a collection, current state first, until dropped.
    fn subscribe(&self, collection: &DocumentPath) -> BoxStream<'static, Result<Vec<RemoteDocument>, RemoteError>>;
}

/// Bounds a remote call. An elapsed deadline reads as `Timeout` for this call only.
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    }
}
