use async_trait::async_trait;

use crate::controller::Error;
use crate::model::{ResourceKind, ResourceRecord};

mod access_key;
mod bucket;
mod identity_key;
pub mod negotiator;
mod policy;
mod user;
mod utils;

pub use access_key::ObjectAccessKeyDriver;
pub use bucket::BucketDriver;
pub use identity_key::IdentityAccessKeyDriver;
pub use policy::IdentityPolicyDriver;
pub use user::IdentityUserDriver;

pub use utils::{perform_operation, Operation, RetryPolicy};

/// Lifecycle shared by every driver. Creation takes kind-specific inputs, so
/// `create` lives on each driver; the coordinator only needs these to resume
/// and roll back.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    fn kind(&self) -> ResourceKind;
    async fn exists(&self, record: &ResourceRecord) -> Result<bool, Error>;
    /// Deleting something that is already gone succeeds.
    async fn delete(&self, record: &ResourceRecord) -> Result<(), Error>;
}
