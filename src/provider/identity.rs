use async_trait::async_trait;
use serde::Deserialize;

use super::cli::CliRunner;
use super::{IdentityClient, ProviderError};
use crate::model::AccessKeyPair;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserEnvelope {
    user: User,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct User {
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyEnvelope {
    policy: Policy,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Policy {
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyList {
    #[serde(default)]
    policies: Vec<NamedPolicy>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NamedPolicy {
    policy_name: String,
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedPolicies {
    #[serde(default)]
    attached_policies: Vec<AttachedPolicy>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedPolicy {
    policy_arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccessKeyEnvelope {
    access_key: IssuedKey,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IssuedKey {
    access_key_id: String,
    secret_access_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccessKeyList {
    #[serde(default)]
    access_key_metadata: Vec<AccessKeyMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccessKeyMetadata {
    access_key_id: String,
}

/// Identity service through the `aws` CLI.
#[derive(Debug, Clone)]
pub struct CliIdentity {
    runner: CliRunner,
}

impl CliIdentity {
    pub fn new(
        binary: &str,
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
        region: &str,
    ) -> CliIdentity {
        CliIdentity {
            runner: CliRunner::new(binary)
                .env("AWS_ACCESS_KEY_ID", access_key_id)
                .env("AWS_SECRET_ACCESS_KEY", secret_access_key)
                .env("AWS_DEFAULT_REGION", Some(region))
                .env("AWS_PAGER", Some("")),
        }
    }

    async fn iam<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T, ProviderError> {
        let mut full = vec!["iam"];
        full.extend_from_slice(args);
        full.extend_from_slice(&["--output", "json"]);
        self.runner.run_json(&full).await
    }

    async fn iam_unit(&self, args: &[&str]) -> Result<(), ProviderError> {
        let mut full = vec!["iam"];
        full.extend_from_slice(args);
        self.runner.run(&full).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityClient for CliIdentity {
    async fn ensure_available(&self) -> Result<(), ProviderError> {
        self.runner.ensure_available().await
    }

    async fn get_user(&self, name: &str) -> Result<Option<String>, ProviderError> {
        match self.iam::<UserEnvelope>(&["get-user", "--user-name", name]).await {
            Ok(envelope) => Ok(Some(envelope.user.arn)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_user(&self, name: &str) -> Result<String, ProviderError> {
        let envelope: UserEnvelope = self.iam(&["create-user", "--user-name", name]).await?;
        Ok(envelope.user.arn)
    }

    async fn delete_user(&self, name: &str) -> Result<(), ProviderError> {
        self.iam_unit(&["delete-user", "--user-name", name]).await
    }

    async fn find_policy(&self, name: &str) -> Result<Option<String>, ProviderError> {
        let list: PolicyList = self.iam(&["list-policies", "--scope", "Local"]).await?;
        Ok(list
            .policies
            .into_iter()
            .find(|p| p.policy_name == name)
            .map(|p| p.arn))
    }

    async fn policy_exists(&self, arn: &str) -> Result<bool, ProviderError> {
        match self.iam::<PolicyEnvelope>(&["get-policy", "--policy-arn", arn]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_policy(&self, name: &str, document: &str) -> Result<String, ProviderError> {
        let envelope: PolicyEnvelope = self
            .iam(&["create-policy", "--policy-name", name, "--policy-document", document])
            .await?;
        Ok(envelope.policy.arn)
    }

    async fn delete_policy(&self, arn: &str) -> Result<(), ProviderError> {
        self.iam_unit(&["delete-policy", "--policy-arn", arn]).await
    }

    async fn attach_policy(&self, user: &str, arn: &str) -> Result<(), ProviderError> {
        self.iam_unit(&["attach-user-policy", "--user-name", user, "--policy-arn", arn])
            .await
    }

    async fn detach_policy(&self, user: &str, arn: &str) -> Result<(), ProviderError> {
        self.iam_unit(&["detach-user-policy", "--user-name", user, "--policy-arn", arn])
            .await
    }

    async fn list_attached_policies(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        let attached: AttachedPolicies = self
            .iam(&["list-attached-user-policies", "--user-name", user])
            .await?;
        Ok(attached
            .attached_policies
            .into_iter()
            .map(|p| p.policy_arn)
            .collect())
    }

    async fn create_access_key(&self, user: &str) -> Result<AccessKeyPair, ProviderError> {
        let envelope: AccessKeyEnvelope = self.iam(&["create-access-key", "--user-name", user]).await?;
        Ok(AccessKeyPair {
            access_key_id: envelope.access_key.access_key_id,
            secret_access_key: envelope.access_key.secret_access_key,
        })
    }

    async fn list_access_keys(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        let keys: AccessKeyList = self.iam(&["list-access-keys", "--user-name", user]).await?;
        Ok(keys
            .access_key_metadata
            .into_iter()
            .map(|k| k.access_key_id)
            .collect())
    }

    async fn delete_access_key(&self, user: &str, key_id: &str) -> Result<(), ProviderError> {
        self.iam_unit(&["delete-access-key", "--user-name", user, "--access-key-id", key_id])
            .await
    }
}
