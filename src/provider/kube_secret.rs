use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::OnceCell;
use tracing::info;

use super::{ProviderError, SecretStore};

/// Publishes credentials as keys of one Kubernetes `Secret`, where cluster
/// bootstrap picks them up.
pub struct KubeSecretStore {
    client: OnceCell<Client>,
    namespace: String,
    name: String,
}

impl KubeSecretStore {
    pub fn new(namespace: &str, name: &str) -> KubeSecretStore {
        KubeSecretStore {
            client: OnceCell::new(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    async fn api(&self) -> Result<Api<Secret>, ProviderError> {
        let client = self
            .client
            .get_or_try_init(|| async {
                Client::try_default()
                    .await
                    .map_err(|e| ProviderError::Unavailable(format!("kubernetes client: {}", e)))
            })
            .await?;
        Ok(Api::namespaced(client.clone(), &self.namespace))
    }

    fn secret(&self, key: &str, value: &str) -> Secret {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        labels.insert("app.kubernetes.io/managed-by".into(), "env-provisioner".into());

        let mut data: BTreeMap<String, String> = BTreeMap::new();
        data.insert(key.to_string(), value.to_string());

        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            string_data: Some(data),
            type_: Some("Opaque".into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn ensure_available(&self) -> Result<(), ProviderError> {
        let api = self.api().await?;
        match api.get_opt(&self.name).await {
            Ok(_) => Ok(()),
            Err(e) => Err(ProviderError::Unavailable(format!(
                "secret {}/{}: {}",
                self.namespace, self.name, e
            ))),
        }
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<(), ProviderError> {
        let api = self.api().await?;
        let patch_body: Value = json!({
            "stringData": {
                key: value
            }
        });
        let patch: Patch<&Value> = Patch::Merge(&patch_body);

        match api.patch(&self.name, &PatchParams::default(), &patch).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                info!(secret = %self.name, namespace = %self.namespace, "Creating secret");
                match api.create(&PostParams::default(), &self.secret(key, value)).await {
                    Ok(_) => Ok(()),
                    // lost a race with another writer; the patch will now apply
                    Err(kube::Error::Api(response)) if response.code == 409 => {
                        api.patch(&self.name, &PatchParams::default(), &patch).await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
