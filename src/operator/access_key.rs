use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{perform_operation, Operation, ResourceDriver, RetryPolicy};
use crate::controller::Error;
use crate::model::{ResourceKind, ResourceRecord};
use crate::provider::ObjectStorageClient;

const KIND: ResourceKind = ResourceKind::ObjectAccessKey;

/// Access key limited to a single bucket.
#[derive(Clone)]
pub struct ObjectAccessKeyDriver {
    client: Arc<dyn ObjectStorageClient>,
    policy: RetryPolicy,
}

impl ObjectAccessKeyDriver {
    pub fn new(client: Arc<dyn ObjectStorageClient>, policy: RetryPolicy) -> ObjectAccessKeyDriver {
        ObjectAccessKeyDriver { client, policy }
    }

    pub async fn create(&self, bucket: &str, label: &str) -> Result<ResourceRecord, Error> {
        let (id, pair) = perform_operation(&self.policy, Operation::Create, label, || {
            self.client.create_access_key(label, bucket)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Create))?;

        info!(key = %id, access_key_id = %pair.access_key_id, bucket = %bucket, "Object storage key created");
        Ok(ResourceRecord::new(KIND, id)
            .with_parent(bucket)
            .with_credential(pair))
    }
}

#[async_trait]
impl ResourceDriver for ObjectAccessKeyDriver {
    fn kind(&self) -> ResourceKind {
        KIND
    }

    async fn exists(&self, record: &ResourceRecord) -> Result<bool, Error> {
        perform_operation(&self.policy, Operation::Exists, &record.id, || {
            self.client.access_key_exists(&record.id)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Exists))
    }

    async fn delete(&self, record: &ResourceRecord) -> Result<(), Error> {
        match perform_operation(&self.policy, Operation::Delete, &record.id, || {
            self.client.delete_access_key(&record.id)
        })
        .await
        {
            Ok(()) => {
                info!(key = %record.id, "Object storage key revoked");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::provider(KIND, Operation::Delete)(e)),
        }
    }
}
