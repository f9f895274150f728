use async_trait::async_trait;
use serde::Deserialize;

use super::cli::CliRunner;
use super::{ObjectStorageClient, ProviderError};
use crate::model::AccessKeyPair;

#[derive(Deserialize)]
struct IssuedKey {
    id: u64,
    access_key: String,
    secret_key: String,
}

/// Object storage through `linode-cli`, scoped to one region.
#[derive(Debug, Clone)]
pub struct CliObjectStorage {
    runner: CliRunner,
    region: String,
}

impl CliObjectStorage {
    pub fn new(binary: &str, token: Option<&str>, region: &str) -> CliObjectStorage {
        CliObjectStorage {
            runner: CliRunner::new(binary)
                .env("LINODE_CLI_TOKEN", token)
                .env("LINODE_CLI_SUPPRESS_VERSION_WARNING", Some("true")),
            region: region.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStorageClient for CliObjectStorage {
    async fn ensure_available(&self) -> Result<(), ProviderError> {
        self.runner.ensure_available().await
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool, ProviderError> {
        match self
            .runner
            .run(&["object-storage", "bucket-view", &self.region, name, "--json"])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, name: &str) -> Result<(), ProviderError> {
        self.runner
            .run(&[
                "object-storage",
                "buckets-create",
                "--region",
                &self.region,
                "--label",
                name,
                "--acl",
                "private",
                "--json",
            ])
            .await?;
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), ProviderError> {
        self.runner
            .run(&["object-storage", "bucket-remove", &self.region, name])
            .await?;
        Ok(())
    }

    async fn create_access_key(
        &self,
        label: &str,
        bucket: &str,
    ) -> Result<(String, AccessKeyPair), ProviderError> {
        let issued: Vec<IssuedKey> = self
            .runner
            .run_json(&[
                "object-storage",
                "keys-create",
                "--label",
                label,
                "--bucket_access.region",
                &self.region,
                "--bucket_access.bucket_name",
                bucket,
                "--bucket_access.permissions",
                "read_write",
                "--json",
            ])
            .await?;
        let key = issued
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Other("keys-create returned no key".into()))?;
        Ok((
            key.id.to_string(),
            AccessKeyPair {
                access_key_id: key.access_key,
                secret_access_key: key.secret_key,
            },
        ))
    }

    async fn access_key_exists(&self, id: &str) -> Result<bool, ProviderError> {
        match self
            .runner
            .run(&["object-storage", "keys-view", id, "--json"])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_access_key(&self, id: &str) -> Result<(), ProviderError> {
        self.runner
            .run(&["object-storage", "keys-delete", id])
            .await?;
        Ok(())
    }
}
