use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::controller::Error;
use crate::model::{AccessKeyPair, DerivedCredential};
use crate::operator::{perform_operation, Operation, RetryPolicy};
use crate::provider::SecretStore;

pub const OBJECT_STORAGE_ACCESS_KEY_ID: &str = "OBJECT_STORAGE_ACCESS_KEY_ID";
pub const OBJECT_STORAGE_SECRET_ACCESS_KEY: &str = "OBJECT_STORAGE_SECRET_ACCESS_KEY";
pub const SMTP_USERNAME: &str = "SMTP_USERNAME";
pub const SMTP_PASSWORD: &str = "SMTP_PASSWORD";

/// The four values cluster bootstrap consumes.
pub fn credentials(bucket_key: &AccessKeyPair, smtp: &DerivedCredential) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    values.insert(OBJECT_STORAGE_ACCESS_KEY_ID.to_string(), bucket_key.access_key_id.clone());
    values.insert(
        OBJECT_STORAGE_SECRET_ACCESS_KEY.to_string(),
        bucket_key.secret_access_key.clone(),
    );
    values.insert(SMTP_USERNAME.to_string(), smtp.username.clone());
    values.insert(SMTP_PASSWORD.to_string(), smtp.derived_password.clone());
    values
}

pub struct SecretPropagator {
    store: Arc<dyn SecretStore>,
    policy: RetryPolicy,
}

impl SecretPropagator {
    pub fn new(store: Arc<dyn SecretStore>, policy: RetryPolicy) -> SecretPropagator {
        SecretPropagator { store, policy }
    }

    /// Upserts every key independently. On partial failure the error lists
    /// exactly the keys that still need publishing.
    pub async fn publish(&self, credentials: &BTreeMap<String, String>) -> Result<(), Error> {
        let results = join_all(credentials.iter().map(|(key, value)| async move {
            let result = perform_operation(&self.policy, Operation::Publish, key, || {
                self.store.upsert(key, value)
            })
            .await;
            (key.clone(), result)
        }))
        .await;

        let mut pending = Vec::new();
        let mut cause = None;
        for (key, result) in results {
            match result {
                Ok(()) => info!(key = %key, "Published credential"),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to publish credential");
                    cause.get_or_insert_with(|| e.to_string());
                    pending.push(key);
                }
            }
        }

        match cause {
            None => Ok(()),
            Some(cause) => Err(Error::Propagation { pending, cause }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::testing::{fast_policy, FakeCloud};

    fn sample() -> BTreeMap<String, String> {
        let bucket_key = AccessKeyPair {
            access_key_id: "OBJKEY".into(),
            secret_access_key: "objsecret".into(),
        };
        let smtp = DerivedCredential::from_access_key(&AccessKeyPair {
            access_key_id: "AKIA1".into(),
            secret_access_key: "secretKeyValue".into(),
        })
        .unwrap();
        credentials(&bucket_key, &smtp)
    }

    #[test]
    fn credential_set_has_four_keys() {
        let values = sample();
        assert_eq!(values.len(), 4);
        assert_eq!(values[SMTP_USERNAME], "AKIA1");
        assert_eq!(values[SMTP_PASSWORD], "iM4wCBq/bG6srvGmRniCJF0ayTK9Mm7LMRF9Y3vUtvQ=");
        assert_eq!(values[OBJECT_STORAGE_SECRET_ACCESS_KEY], "objsecret");
    }

    #[tokio::test]
    async fn publishes_every_key() {
        let cloud = FakeCloud::new();
        let propagator = SecretPropagator::new(cloud.secrets(), fast_policy());
        propagator.publish(&sample()).await.unwrap();
        assert_eq!(cloud.published(), sample());
    }

    #[tokio::test]
    async fn partial_failure_reports_remaining_keys() {
        let cloud = FakeCloud::new();
        cloud.fail(
            &format!("upsert:{}", SMTP_PASSWORD),
            ProviderError::PermissionDenied("secrets".into()),
            None,
        );
        let propagator = SecretPropagator::new(cloud.secrets(), fast_policy());

        match propagator.publish(&sample()).await {
            Err(Error::Propagation { pending, .. }) => {
                assert_eq!(pending, vec![SMTP_PASSWORD.to_string()])
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(cloud.published().len(), 3);
    }

    #[tokio::test]
    async fn existing_keys_are_overwritten() {
        let cloud = FakeCloud::new();
        let propagator = SecretPropagator::new(cloud.secrets(), fast_policy());
        let mut first = BTreeMap::new();
        first.insert(SMTP_USERNAME.to_string(), "old".to_string());
        propagator.publish(&first).await.unwrap();

        propagator.publish(&sample()).await.unwrap();
        assert_eq!(cloud.published()[SMTP_USERNAME], "AKIA1");
    }
}
