//! Clients for the external services provisioning talks to.
//!
//! Drivers only see these traits; the production implementations wrap the
//! provider CLIs and the Kubernetes API.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::model::AccessKeyPair;

mod cli;
mod identity;
mod kube_secret;
mod object_storage;

pub use identity::CliIdentity;
pub use kube_secret::KubeSecretStore;
pub use object_storage::CliObjectStorage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    Throttled(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("client unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled(_) | ProviderError::Transient(_) | ProviderError::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

impl From<kube::Error> for ProviderError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(response) => match response.code {
                404 => ProviderError::NotFound(response.message),
                409 => ProviderError::AlreadyExists(response.message),
                401 | 403 => ProviderError::PermissionDenied(response.message),
                429 => ProviderError::Throttled(response.message),
                code if code >= 500 => ProviderError::Transient(response.message),
                _ => ProviderError::Other(response.message),
            },
            kube::Error::HyperError(e) => ProviderError::Transient(e.to_string()),
            kube::Error::Service(e) => ProviderError::Transient(e.to_string()),
            other => ProviderError::Other(other.to_string()),
        }
    }
}

/// Region-scoped object storage.
#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    async fn ensure_available(&self) -> Result<(), ProviderError>;
    async fn bucket_exists(&self, name: &str) -> Result<bool, ProviderError>;
    async fn create_bucket(&self, name: &str) -> Result<(), ProviderError>;
    async fn delete_bucket(&self, name: &str) -> Result<(), ProviderError>;
    /// Returns the provider's handle for the key together with the issued pair.
    async fn create_access_key(
        &self,
        label: &str,
        bucket: &str,
    ) -> Result<(String, AccessKeyPair), ProviderError>;
    async fn access_key_exists(&self, id: &str) -> Result<bool, ProviderError>;
    async fn delete_access_key(&self, id: &str) -> Result<(), ProviderError>;
}

/// Identity service holding the SMTP principal.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn ensure_available(&self) -> Result<(), ProviderError>;
    async fn get_user(&self, name: &str) -> Result<Option<String>, ProviderError>;
    async fn create_user(&self, name: &str) -> Result<String, ProviderError>;
    async fn delete_user(&self, name: &str) -> Result<(), ProviderError>;
    async fn find_policy(&self, name: &str) -> Result<Option<String>, ProviderError>;
    async fn policy_exists(&self, arn: &str) -> Result<bool, ProviderError>;
    async fn create_policy(&self, name: &str, document: &str) -> Result<String, ProviderError>;
    async fn delete_policy(&self, arn: &str) -> Result<(), ProviderError>;
    async fn attach_policy(&self, user: &str, arn: &str) -> Result<(), ProviderError>;
    async fn detach_policy(&self, user: &str, arn: &str) -> Result<(), ProviderError>;
    async fn list_attached_policies(&self, user: &str) -> Result<Vec<String>, ProviderError>;
    async fn create_access_key(&self, user: &str) -> Result<AccessKeyPair, ProviderError>;
    async fn list_access_keys(&self, user: &str) -> Result<Vec<String>, ProviderError>;
    async fn delete_access_key(&self, user: &str, key_id: &str) -> Result<(), ProviderError>;
}

/// Key-value destination for generated credentials.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn ensure_available(&self) -> Result<(), ProviderError>;
    /// Creates or overwrites a single key.
    async fn upsert(&self, key: &str, value: &str) -> Result<(), ProviderError>;
}
