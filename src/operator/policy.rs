use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::{perform_operation, Operation, ResourceDriver, RetryPolicy};
use crate::controller::Error;
use crate::model::{ResourceKind, ResourceRecord};
use crate::provider::IdentityClient;

const KIND: ResourceKind = ResourceKind::IdentityPolicy;

/// Send-only email permission.
pub fn send_email_document() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": ["ses:SendRawEmail"],
            "Resource": "*"
        }]
    })
    .to_string()
}

/// Owns the identity service's ordering rules: a policy is detached before
/// it is deleted, and a principal is stripped of every policy and key before
/// it can be removed.
#[derive(Clone)]
pub struct IdentityPolicyDriver {
    client: Arc<dyn IdentityClient>,
    policy: RetryPolicy,
}

impl IdentityPolicyDriver {
    pub fn new(client: Arc<dyn IdentityClient>, policy: RetryPolicy) -> IdentityPolicyDriver {
        IdentityPolicyDriver { client, policy }
    }

    fn user_of<'a>(&self, record: &'a ResourceRecord) -> Result<&'a str, Error> {
        record.parent.as_deref().ok_or_else(|| {
            Error::Validation(format!("{} record has no principal", record.message()))
        })
    }

    /// Creates the policy (or reuses one with the same name) and attaches it.
    pub async fn create(&self, user: &str, name: &str) -> Result<ResourceRecord, Error> {
        let existing = perform_operation(&self.policy, Operation::Exists, name, || {
            self.client.find_policy(name)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Exists))?;

        let created = existing.is_none();
        let arn = match existing {
            Some(arn) => {
                warn!(policy = %arn, "Policy already exists, adopting it");
                arn
            }
            None => {
                let document = send_email_document();
                perform_operation(&self.policy, Operation::Create, name, || {
                    self.client.create_policy(name, &document)
                })
                .await
                .map_err(Error::provider(KIND, Operation::Create))?
            }
        };

        let attached = perform_operation(&self.policy, Operation::Create, &arn, || {
            self.client.attach_policy(user, &arn)
        })
        .await;
        if let Err(e) = attached {
            // the policy is not journaled yet, so clean it up here
            if created {
                if let Err(cleanup) = self.client.delete_policy(&arn).await {
                    warn!(policy = %arn, error = %cleanup, "Failed to remove unattached policy");
                }
            }
            return Err(Error::provider(KIND, Operation::Create)(e));
        }

        info!(policy = %arn, user = %user, "Policy attached");
        let record = ResourceRecord::new(KIND, arn).with_parent(user);
        if created {
            return Ok(record);
        }
        Ok(record.adopted())
    }

    /// Detaches every policy and deletes every access key of `user`.
    pub async fn release_principal(&self, user: &str) -> Result<(), Error> {
        let attached = perform_operation(&self.policy, Operation::Exists, user, || {
            self.client.list_attached_policies(user)
        })
        .await;
        let attached = match attached {
            Ok(arns) => arns,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(Error::provider(KIND, Operation::Delete)(e)),
        };
        for arn in attached {
            self.detach(user, &arn).await?;
        }

        let keys = perform_operation(&self.policy, Operation::Exists, user, || {
            self.client.list_access_keys(user)
        })
        .await;
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                return Err(Error::provider(ResourceKind::IdentityAccessKey, Operation::Delete)(e))
            }
        };
        for key in keys {
            match perform_operation(&self.policy, Operation::Delete, &key, || {
                self.client.delete_access_key(user, &key)
            })
            .await
            {
                Ok(()) => info!(key = %key, user = %user, "Access key deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(Error::provider(ResourceKind::IdentityAccessKey, Operation::Delete)(e))
                }
            }
        }
        Ok(())
    }

    async fn detach(&self, user: &str, arn: &str) -> Result<(), Error> {
        match perform_operation(&self.policy, Operation::Delete, arn, || {
            self.client.detach_policy(user, arn)
        })
        .await
        {
            Ok(()) => {
                info!(policy = %arn, user = %user, "Policy detached");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::provider(KIND, Operation::Delete)(e)),
        }
    }
}

#[async_trait]
impl ResourceDriver for IdentityPolicyDriver {
    fn kind(&self) -> ResourceKind {
        KIND
    }

    /// The policy counts as present only while it is attached to its user.
    async fn exists(&self, record: &ResourceRecord) -> Result<bool, Error> {
        let user = self.user_of(record)?;
        let present = perform_operation(&self.policy, Operation::Exists, &record.id, || {
            self.client.policy_exists(&record.id)
        })
        .await
        .map_err(Error::provider(KIND, Operation::Exists))?;
        if !present {
            return Ok(false);
        }

        match perform_operation(&self.policy, Operation::Exists, user, || {
            self.client.list_attached_policies(user)
        })
        .await
        {
            Ok(arns) => Ok(arns.iter().any(|arn| *arn == record.id)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::provider(KIND, Operation::Exists)(e)),
        }
    }

    async fn delete(&self, record: &ResourceRecord) -> Result<(), Error> {
        let user = self.user_of(record)?;
        self.detach(user, &record.id).await?;

        match perform_operation(&self.policy, Operation::Delete, &record.id, || {
            self.client.delete_policy(&record.id)
        })
        .await
        {
            Ok(()) => {
                info!(policy = %record.id, "Policy deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::provider(KIND, Operation::Delete)(e)),
        }
    }
}
