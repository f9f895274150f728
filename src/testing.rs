//! In-memory stand-ins for the object storage, identity and secret services.
//!
//! Every call is logged as `name:args` so tests can assert on ordering, and
//! failures can be injected per call label.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::controller::Clients;
use crate::model::{AccessKeyPair, ProvisioningRequest, ResourceKind};
use crate::operator::RetryPolicy;
use crate::provider::{IdentityClient, ObjectStorageClient, ProviderError, SecretStore};

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        call_timeout: Duration::from_millis(200),
    }
}

pub fn request() -> ProvisioningRequest {
    ProvisioningRequest {
        deployment_id: "demo".into(),
        region: "us-east-1".into(),
        email_region: "us-east-1".into(),
        domain: "demo.example.com".into(),
        object_storage_token: Some("token".into()),
        identity_access_key_id: Some("AKIAOPERATOR".into()),
        identity_secret_access_key: Some("operator-secret".into()),
    }
}

struct Failure {
    label: String,
    error: ProviderError,
    remaining: Option<usize>,
}

#[derive(Default)]
struct User {
    policies: Vec<String>,
    keys: BTreeMap<String, String>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<String>,
    failures: Vec<Failure>,
    cancel_on: Vec<(String, CancellationToken)>,
    created: Vec<ResourceKind>,
    deleted: Vec<ResourceKind>,
    buckets_taken: bool,
    buckets: BTreeSet<String>,
    object_keys: BTreeMap<String, String>,
    users: BTreeMap<String, User>,
    policies: BTreeMap<String, String>,
    secrets: BTreeMap<String, String>,
    next_id: u32,
}

impl Inner {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn user(&mut self, name: &str) -> Result<&mut User, ProviderError> {
        self.users
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("user {}", name)))
    }
}

fn label_matches(label: &str, call: &str) -> bool {
    call == label || call.starts_with(&format!("{}:", label))
}

#[derive(Clone, Default)]
pub struct FakeCloud {
    inner: Arc<Mutex<Inner>>,
}

impl FakeCloud {
    pub fn new() -> FakeCloud {
        FakeCloud::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Logs `call`, fires cancel hooks and injected failures.
    fn enter(&self, call: String) -> Result<MutexGuard<'_, Inner>, ProviderError> {
        let mut inner = self.lock();
        for (label, token) in &inner.cancel_on {
            if label_matches(label, &call) {
                token.cancel();
            }
        }
        let failure = inner.failures.iter_mut().find(|f| {
            label_matches(&f.label, &call) && f.remaining.map_or(true, |n| n > 0)
        });
        let injected = failure.map(|f| {
            if let Some(n) = f.remaining.as_mut() {
                *n -= 1;
            }
            f.error.clone()
        });
        inner.calls.push(call);
        match injected {
            Some(e) => Err(e),
            None => Ok(inner),
        }
    }

    pub fn object_storage(&self) -> Arc<dyn ObjectStorageClient> {
        Arc::new(FakeObjectStorage(self.clone()))
    }

    pub fn identity(&self) -> Arc<dyn IdentityClient> {
        Arc::new(FakeIdentity(self.clone()))
    }

    pub fn secrets(&self) -> Arc<dyn SecretStore> {
        Arc::new(FakeSecrets(self.clone()))
    }

    pub fn clients(&self) -> Clients {
        Clients {
            object_storage: self.object_storage(),
            identity: self.identity(),
            secrets: self.secrets(),
        }
    }

    /// Fails calls labelled `label` (or `label:...`) with `error`, forever
    /// when `times` is `None`.
    pub fn fail(&self, label: &str, error: ProviderError, times: Option<usize>) {
        self.lock().failures.push(Failure {
            label: label.to_string(),
            error,
            remaining: times,
        });
    }

    /// Cancels `token` as soon as a call labelled `label` is made.
    pub fn cancel_on(&self, label: &str, token: CancellationToken) {
        self.lock().cancel_on.push((label.to_string(), token));
    }

    pub fn all_bucket_names_taken(&self) {
        self.lock().buckets_taken = true;
    }

    pub fn seed_user(&self, name: &str) {
        self.lock().users.entry(name.to_string()).or_default();
    }

    /// Drops every user behind the provisioner's back.
    pub fn remove_all_users(&self) {
        self.lock().users.clear();
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().buckets.len()
    }

    pub fn object_key_count(&self) -> usize {
        self.lock().object_keys.len()
    }

    pub fn policy_count(&self) -> usize {
        self.lock().policies.len()
    }

    pub fn attached_policies(&self, user: &str) -> Vec<String> {
        self.lock()
            .users
            .get(user)
            .map(|u| u.policies.clone())
            .unwrap_or_default()
    }

    pub fn user_exists(&self, user: &str) -> bool {
        self.lock().users.contains_key(user)
    }

    pub fn identity_secret(&self, access_key_id: &str) -> Option<String> {
        self.lock()
            .users
            .values()
            .find_map(|u| u.keys.get(access_key_id).cloned())
    }

    pub fn published(&self) -> BTreeMap<String, String> {
        self.lock().secrets.clone()
    }

    /// Kinds of every resource successfully created, in order.
    pub fn created_kinds(&self) -> Vec<ResourceKind> {
        self.lock().created.clone()
    }

    /// Kinds of every existing resource successfully deleted, in order.
    pub fn deleted_kinds(&self) -> Vec<ResourceKind> {
        self.lock().deleted.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    /// Forgets the call, creation and deletion logs but keeps the resources.
    pub fn clear_calls(&self) {
        let mut inner = self.lock();
        inner.calls.clear();
        inner.created.clear();
        inner.deleted.clear();
    }
}

struct FakeObjectStorage(FakeCloud);

#[async_trait]
impl ObjectStorageClient for FakeObjectStorage {
    async fn ensure_available(&self) -> Result<(), ProviderError> {
        self.0.enter("ensure_available:object_storage".into())?;
        Ok(())
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool, ProviderError> {
        let inner = self.0.enter(format!("bucket_exists:{}", name))?;
        Ok(inner.buckets_taken || inner.buckets.contains(name))
    }

    async fn create_bucket(&self, name: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("create_bucket:{}", name))?;
        if !inner.buckets.insert(name.to_string()) {
            return Err(ProviderError::AlreadyExists(format!("bucket {}", name)));
        }
        inner.created.push(ResourceKind::ObjectBucket);
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("delete_bucket:{}", name))?;
        if !inner.buckets.remove(name) {
            return Err(ProviderError::NotFound(format!("bucket {}", name)));
        }
        inner.deleted.push(ResourceKind::ObjectBucket);
        Ok(())
    }

    async fn create_access_key(
        &self,
        label: &str,
        bucket: &str,
    ) -> Result<(String, AccessKeyPair), ProviderError> {
        let mut inner = self.0.enter(format!("create_object_key:{}", label))?;
        let n = inner.next_id();
        let id = n.to_string();
        inner.object_keys.insert(id.clone(), bucket.to_string());
        inner.created.push(ResourceKind::ObjectAccessKey);
        Ok((
            id,
            AccessKeyPair {
                access_key_id: format!("OBJ{:08}", n),
                secret_access_key: format!("objsecret{}", n),
            },
        ))
    }

    async fn access_key_exists(&self, id: &str) -> Result<bool, ProviderError> {
        let inner = self.0.enter(format!("object_key_exists:{}", id))?;
        Ok(inner.object_keys.contains_key(id))
    }

    async fn delete_access_key(&self, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("delete_object_key:{}", id))?;
        if inner.object_keys.remove(id).is_none() {
            return Err(ProviderError::NotFound(format!("key {}", id)));
        }
        inner.deleted.push(ResourceKind::ObjectAccessKey);
        Ok(())
    }
}

struct FakeIdentity(FakeCloud);

fn policy_arn(name: &str) -> String {
    format!("arn:aws:iam::000000000000:policy/{}", name)
}

fn user_arn(name: &str) -> String {
    format!("arn:aws:iam::000000000000:user/{}", name)
}

#[async_trait]
impl IdentityClient for FakeIdentity {
    async fn ensure_available(&self) -> Result<(), ProviderError> {
        self.0.enter("ensure_available:identity".into())?;
        Ok(())
    }

    async fn get_user(&self, name: &str) -> Result<Option<String>, ProviderError> {
        let inner = self.0.enter(format!("get_user:{}", name))?;
        Ok(inner.users.contains_key(name).then(|| user_arn(name)))
    }

    async fn create_user(&self, name: &str) -> Result<String, ProviderError> {
        let mut inner = self.0.enter(format!("create_user:{}", name))?;
        if inner.users.contains_key(name) {
            return Err(ProviderError::AlreadyExists(format!("user {}", name)));
        }
        inner.users.insert(name.to_string(), User::default());
        inner.created.push(ResourceKind::IdentityUser);
        Ok(user_arn(name))
    }

    async fn delete_user(&self, name: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("delete_user:{}", name))?;
        let user = inner.user(name)?;
        if !user.policies.is_empty() || !user.keys.is_empty() {
            return Err(ProviderError::Other(format!(
                "DeleteConflict: user {} still has attachments",
                name
            )));
        }
        inner.users.remove(name);
        inner.deleted.push(ResourceKind::IdentityUser);
        Ok(())
    }

    async fn find_policy(&self, name: &str) -> Result<Option<String>, ProviderError> {
        let inner = self.0.enter(format!("find_policy:{}", name))?;
        Ok(inner
            .policies
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(arn, _)| arn.clone()))
    }

    async fn policy_exists(&self, arn: &str) -> Result<bool, ProviderError> {
        let inner = self.0.enter(format!("policy_exists:{}", arn))?;
        Ok(inner.policies.contains_key(arn))
    }

    async fn create_policy(&self, name: &str, _document: &str) -> Result<String, ProviderError> {
        let mut inner = self.0.enter(format!("create_policy:{}", name))?;
        let arn = policy_arn(name);
        if inner.policies.contains_key(&arn) {
            return Err(ProviderError::AlreadyExists(format!("policy {}", name)));
        }
        inner.policies.insert(arn.clone(), name.to_string());
        inner.created.push(ResourceKind::IdentityPolicy);
        Ok(arn)
    }

    async fn delete_policy(&self, arn: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("delete_policy:{}", arn))?;
        if !inner.policies.contains_key(arn) {
            return Err(ProviderError::NotFound(format!("policy {}", arn)));
        }
        if inner.users.values().any(|u| u.policies.iter().any(|p| p == arn)) {
            return Err(ProviderError::Other(format!(
                "DeleteConflict: policy {} is still attached",
                arn
            )));
        }
        inner.policies.remove(arn);
        inner.deleted.push(ResourceKind::IdentityPolicy);
        Ok(())
    }

    async fn attach_policy(&self, user: &str, arn: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("attach_policy:{}:{}", user, arn))?;
        if !inner.policies.contains_key(arn) {
            return Err(ProviderError::NotFound(format!("policy {}", arn)));
        }
        let user = inner.user(user)?;
        if !user.policies.iter().any(|p| p == arn) {
            user.policies.push(arn.to_string());
        }
        Ok(())
    }

    async fn detach_policy(&self, user: &str, arn: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("detach_policy:{}:{}", user, arn))?;
        let user = inner.user(user)?;
        let before = user.policies.len();
        user.policies.retain(|p| p != arn);
        if user.policies.len() == before {
            return Err(ProviderError::NotFound(format!("attachment {}", arn)));
        }
        Ok(())
    }

    async fn list_attached_policies(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        let mut inner = self.0.enter(format!("list_attached_policies:{}", user))?;
        Ok(inner.user(user)?.policies.clone())
    }

    async fn create_access_key(&self, user: &str) -> Result<AccessKeyPair, ProviderError> {
        let mut inner = self.0.enter(format!("create_user_key:{}", user))?;
        let n = inner.next_id();
        let pair = AccessKeyPair {
            access_key_id: format!("AKIA{:016}", n),
            secret_access_key: format!("secret{}", n),
        };
        inner
            .user(user)?
            .keys
            .insert(pair.access_key_id.clone(), pair.secret_access_key.clone());
        inner.created.push(ResourceKind::IdentityAccessKey);
        Ok(pair)
    }

    async fn list_access_keys(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        let mut inner = self.0.enter(format!("list_access_keys:{}", user))?;
        Ok(inner.user(user)?.keys.keys().cloned().collect())
    }

    async fn delete_access_key(&self, user: &str, key_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("delete_user_key:{}:{}", user, key_id))?;
        if inner.user(user)?.keys.remove(key_id).is_none() {
            return Err(ProviderError::NotFound(format!("key {}", key_id)));
        }
        inner.deleted.push(ResourceKind::IdentityAccessKey);
        Ok(())
    }
}

struct FakeSecrets(FakeCloud);

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn ensure_available(&self) -> Result<(), ProviderError> {
        self.0.enter("ensure_available:secrets".into())?;
        Ok(())
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<(), ProviderError> {
        let mut inner = self.0.enter(format!("upsert:{}", key))?;
        inner.secrets.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
