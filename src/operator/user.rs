use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::policy::IdentityPolicyDriver;
use super::{perform_operation, Operation, ResourceDriver, RetryPolicy};
use crate::controller::Error;
use crate::model::{ResourceKind, ResourceRecord};
use crate::provider::IdentityClient;

const KIND: ResourceKind = ResourceKind::IdentityUser;

/// Named principal for SMTP sending. Creating a user that already exists
/// returns the existing one.
#[derive(Clone)]
pub struct IdentityUserDriver {
    client: Arc<dyn IdentityClient>,
    policy: RetryPolicy,
    policies: IdentityPolicyDriver,
}

impl IdentityUserDriver {
    pub fn new(
        client: Arc<dyn IdentityClient>,
        policy: RetryPolicy,
        policies: IdentityPolicyDriver,
    ) -> IdentityUserDriver {
        IdentityUserDriver {
            client,
            policy,
            policies,
        }
    }

    async fn lookup(&self, name: &str) -> Result<Option<String>, Error> {
        perform_operation(&self.policy, Operation::Exists, name, || {
            self.client.get_user(name)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Exists))
    }

    pub async fn create(&self, name: &str) -> Result<ResourceRecord, Error> {
        if let Some(arn) = self.lookup(name).await? {
            warn!(user = %name, arn = %arn, "User already exists, adopting it");
            return Ok(ResourceRecord::new(KIND, name).adopted());
        }

        let arn = perform_operation(&self.policy, Operation::Create, name, || {
            self.client.create_user(name)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Create))?;

        info!(user = %name, arn = %arn, "User created");
        Ok(ResourceRecord::new(KIND, name))
    }
}

#[async_trait]
impl ResourceDriver for IdentityUserDriver {
    fn kind(&self) -> ResourceKind {
        KIND
    }

    async fn exists(&self, record: &ResourceRecord) -> Result<bool, Error> {
        Ok(self.lookup(&record.id).await?.is_some())
    }

    async fn delete(&self, record: &ResourceRecord) -> Result<(), Error> {
        self.policies.release_principal(&record.id).await?;

        match perform_operation(&self.policy, Operation::Delete, &record.id, || {
            self.client.delete_user(&record.id)
        })
        .await
        {
            Ok(()) => {
                info!(user = %record.id, "User deleted");
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

    fn driver(cloud: &FakeCloud) -> IdentityUserDriver {
        let policies = IdentityPolicyDriver::new(cloud.identity(), fast_policy());
        IdentityUserDriver::new(cloud.identity(), fast_policy(), policies)
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let cloud = FakeCloud::new();
        let users = driver(&cloud);

        let first = users.create("demo-smtp").await.unwrap();
        let second = users.create("demo-smtp").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(cloud.calls_matching("create_user").len(), 1);
    }

    #[tokio::test]
    async fn existing_user_is_adopted() {
        let cloud = FakeCloud::new();
        cloud.seed_user("demo-smtp");
        let users = driver(&cloud);

        let record = users.create("demo-smtp").await.unwrap();
        assert!(record.adopted);
        assert!(cloud.calls_matching("create_user").is_empty());

        let cloud = FakeCloud::new();
        let record = driver(&cloud).create("demo-smtp").await.unwrap();
        assert!(!record.adopted);
    }

    #[tokio::test]
    async fn delete_releases_attached_credentials_first() {
        let cloud = FakeCloud::new();
        let users = driver(&cloud);
        let identity = cloud.identity();

        let record = users.create("demo-smtp").await.unwrap();
        IdentityPolicyDriver::new(identity.clone(), fast_policy())
            .create("demo-smtp", "demo-send-email")
            .await
            .unwrap();
        identity.create_access_key("demo-smtp").await.unwrap();

        users.delete(&record).await.unwrap();
        assert!(!users.exists(&record).await.unwrap());

        let calls = cloud.calls();
        let delete_user = calls.iter().position(|c| c.starts_with("delete_user:")).unwrap();
        let detach = calls.iter().position(|c| c.starts_with("detach_policy")).unwrap();
        let delete_key = calls.iter().position(|c| c.starts_with("delete_user_key")).unwrap();
        assert!(detach < delete_user);
        assert!(delete_key < delete_user);
    }
}
