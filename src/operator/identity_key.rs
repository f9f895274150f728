use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{perform_operation, Operation, ResourceDriver, RetryPolicy};
use crate::controller::Error;
use crate::model::{ResourceKind, ResourceRecord};
use crate::provider::IdentityClient;

const KIND: ResourceKind = ResourceKind::IdentityAccessKey;

/// Access key of the SMTP principal; its secret feeds the SMTP password.
#[derive(Clone)]
pub struct IdentityAccessKeyDriver {
    client: Arc<dyn IdentityClient>,
    policy: RetryPolicy,
}

impl IdentityAccessKeyDriver {
    pub fn new(client: Arc<dyn IdentityClient>, policy: RetryPolicy) -> IdentityAccessKeyDriver {
        IdentityAccessKeyDriver { client, policy }
    }

    pub async fn create(&self, user: &str) -> Result<ResourceRecord, Error> {
        let pair = perform_operation(&self.policy, Operation::Create, user, || {
            self.client.create_access_key(user)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Create))?;

        info!(user = %user, access_key_id = %pair.access_key_id, "Identity access key created");
        Ok(ResourceRecord::new(KIND, pair.access_key_id.clone())
            .with_parent(user)
            .with_credential(pair))
    }

    fn user_of<'a>(&self, record: &'a ResourceRecord) -> Result<&'a str, Error> {
        record.parent.as_deref().ok_or_else(|| {
            Error::Validation(format!("{} record has no principal", record.message()))
        })
    }
}

#[async_trait]
impl ResourceDriver for IdentityAccessKeyDriver {
    fn kind(&self) -> ResourceKind {
        KIND
    }

    async fn exists(&self, record: &ResourceRecord) -> Result<bool, Error> {
        let user = self.user_of(record)?;
        match perform_operation(&self.policy, Operation::Exists, &record.id, || {
            self.client.list_access_keys(user)
        })
        .await
        {
            Ok(keys) => Ok(keys.iter().any(|k| *k == record.id)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::provider(KIND, Operation::Exists)(e)),
        }
    }

    async fn delete(&self, record: &ResourceRecord) -> Result<(), Error> {
        let user = self.user_of(record)?;
        match perform_operation(&self.policy, Operation::Delete, &record.id, || {
            self.client.delete_access_key(user, &record.id)
        })
        .await
        {
            Ok(()) => {
                info!(user = %user, access_key_id = %record.id, "Identity access key deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::provider(KIND, Operation::Delete)(e)),
        }
    }
}
