use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Remote account service.
#[async_trait]
pub trait RemoteAuth: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteUser, RemoteError>;

    async fn create_account(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<RemoteUser, RemoteError>;

    async fn sign_out(&self) -> Result<(), RemoteError>;

    fn current_user(&self) -> Option<RemoteUser>;

    /// Observes remote session changes for the lifetime of the receiver.
    fn watch_user(&self) -> watch::Receiver<Option<RemoteUser>>;
}
