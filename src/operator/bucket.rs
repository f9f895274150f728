use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::negotiator::{reserve, DEFAULT_MAX_ATTEMPTS};
use super::{perform_operation, Operation, ResourceDriver, RetryPolicy};
use crate::controller::Error;
use crate::model::{ResourceKind, ResourceRecord};
use crate::provider::ObjectStorageClient;

const KIND: ResourceKind = ResourceKind::ObjectBucket;

/// Private, region-scoped bucket with a negotiated unique name.
#[derive(Clone)]
pub struct BucketDriver {
    client: Arc<dyn ObjectStorageClient>,
    policy: RetryPolicy,
    max_name_attempts: u32,
}

impl BucketDriver {
    pub fn new(client: Arc<dyn ObjectStorageClient>, policy: RetryPolicy) -> BucketDriver {
        BucketDriver {
            client,
            policy,
            max_name_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    async fn name_taken(&self, name: &str) -> Result<bool, Error> {
        perform_operation(&self.policy, Operation::Exists, name, || {
            self.client.bucket_exists(name)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Exists))
    }

    pub async fn create(&self, base: &str) -> Result<ResourceRecord, Error> {
        let name = reserve(
            base,
            |candidate| async move { self.name_taken(&candidate).await },
            self.max_name_attempts,
        )
        .await?;

        perform_operation(&self.policy, Operation::Create, &name, || {
            self.client.create_bucket(&name)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Create))?;

        info!(bucket = %name, "Bucket created");
        Ok(ResourceRecord::new(KIND, name))
    }
}

#[async_trait]
impl ResourceDriver for BucketDriver {
    fn kind(&self) -> ResourceKind {
        KIND
    }

    async fn exists(&self, record: &ResourceRecord) -> Result<bool, Error> {
        self.name_taken(&record.id).await
    }

    async fn delete(&self, record: &ResourceRecord) -> Result<(), Error> {
        match perform_operation(&self.policy, Operation::Delete, &record.id, || {
            self.client.delete_bucket(&record.id)
        })
        .await
        {
            Ok(()) => {
                info!(bucket = %record.id, "Bucket deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::provider(KIND, Operation::Delete)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_policy, FakeCloud};
    use crate::provider::ProviderError;

    #[tokio::test]
    async fn create_negotiates_a_free_name() {
        let cloud = FakeCloud::new();
        let driver = BucketDriver::new(cloud.object_storage(), fast_policy());

        let record = driver.create("demo").await.unwrap();
        assert_eq!(record.kind, ResourceKind::ObjectBucket);
        assert!(record.id.starts_with("demo-"));
        assert!(driver.exists(&record).await.unwrap());
        assert_eq!(
            cloud.calls_matching("bucket"),
            vec![format!("bucket_exists:{}", record.id), format!("create_bucket:{}", record.id)]
        );
    }

    #[tokio::test]
    async fn exhausted_names_surface_as_uniqueness_error() {
        let cloud = FakeCloud::new();
        cloud.all_bucket_names_taken();
        let driver = BucketDriver::new(cloud.object_storage(), fast_policy());

        let result = driver.create("demo").await;
        assert!(matches!(
            result,
            Err(Error::UniquenessExhausted { attempts: DEFAULT_MAX_ATTEMPTS, .. })
        ));
        assert!(cloud.calls_matching("create_bucket").is_empty());
    }

    #[tokio::test]
    async fn delete_tolerates_missing_bucket() {
        let cloud = FakeCloud::new();
        let driver = BucketDriver::new(cloud.object_storage(), fast_policy());
        let record = ResourceRecord::new(KIND, "demo-000000");
        driver.delete(&record).await.unwrap();
    }

    #[tokio::test]
    async fn permanent_create_failures_are_not_retried() {
        let cloud = FakeCloud::new();
        cloud.fail("create_bucket", ProviderError::QuotaExceeded("buckets".into()), None);
        let driver = BucketDriver::new(cloud.object_storage(), fast_policy());

        let result = driver.create("demo").await;
        assert!(matches!(
            result,
            Err(Error::Provider { kind: ResourceKind::ObjectBucket, source: ProviderError::QuotaExceeded(_), .. })
        ));
        assert_eq!(cloud.calls_matching("create_bucket").len(), 1);
    }
}
