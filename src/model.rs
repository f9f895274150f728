use chrono::offset::Utc;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::derive::derive_smtp_password;
use crate::controller::Error;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ResourceKind {
    ObjectBucket,
    ObjectAccessKey,
    IdentityUser,
    IdentityPolicy,
    IdentityAccessKey,
}

/// What a resumed run does with a journaled resource that still exists.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResumePolicy {
    /// Skip creation and keep using the existing resource.
    Reuse,
    /// Reuse only when the journal still carries the issued secret,
    /// otherwise revoke and issue a fresh one.
    ReuseWithSecret,
}

impl ResourceKind {
    /// Dependency order of the creation steps.
    pub const CREATION_ORDER: [ResourceKind; 5] = [
        ResourceKind::ObjectBucket,
        ResourceKind::ObjectAccessKey,
        ResourceKind::IdentityUser,
        ResourceKind::IdentityPolicy,
        ResourceKind::IdentityAccessKey,
    ];

    pub fn resume_policy(&self) -> ResumePolicy {
        match self {
            ResourceKind::ObjectBucket | ResourceKind::IdentityUser | ResourceKind::IdentityPolicy => {
                ResumePolicy::Reuse
            }
            ResourceKind::ObjectAccessKey | ResourceKind::IdentityAccessKey => {
                ResumePolicy::ReuseWithSecret
            }
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message = match self {
            ResourceKind::ObjectBucket => "ObjectBucket",
            ResourceKind::ObjectAccessKey => "ObjectAccessKey",
            ResourceKind::IdentityUser => "IdentityUser",
            ResourceKind::IdentityPolicy => "IdentityPolicy",
            ResourceKind::IdentityAccessKey => "IdentityAccessKey",
        };
        write!(f, "{}", message)
    }
}

/// Key pair issued by a provider. Only the key id is ever printed.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccessKeyPair {
    #[serde(rename = "accessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: String,
}

impl fmt::Debug for AccessKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AccessKeyPair")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// One externally created resource, identified precisely enough to delete it
/// without re-querying anything.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<AccessKeyPair>,
    /// Found already in place rather than created; rollback leaves it alone.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub adopted: bool,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> ResourceRecord {
        ResourceRecord {
            kind,
            id: id.into(),
            parent: None,
            created_at: Utc::now(),
            credential: None,
            adopted: false,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> ResourceRecord {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_credential(mut self, credential: AccessKeyPair) -> ResourceRecord {
        self.credential = Some(credential);
        self
    }

    pub fn adopted(mut self) -> ResourceRecord {
        self.adopted = true;
        self
    }

    pub fn message(&self) -> String {
        let message = match &self.parent {
            Some(p) => format!("{} {} (on {})", self.kind, self.id, p),
            None => format!("{} {}", self.kind, self.id),
        };
        if self.adopted {
            return format!("{} [adopted]", message);
        }
        message
    }
}

/// Ordered log of everything a provisioning run has created.
///
/// Records are kept in creation order, so iterating them in reverse is always
/// a valid deletion order.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct Journal {
    #[serde(rename = "deploymentId")]
    pub deployment_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    pub records: Vec<ResourceRecord>,
    /// Secret keys a previous propagation attempt failed to publish.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unpublished: Vec<String>,
}

impl Journal {
    pub fn new(deployment_id: impl Into<String>) -> Journal {
        Journal {
            deployment_id: deployment_id.into(),
            started_at: Utc::now(),
            records: Vec::new(),
            unpublished: Vec::new(),
        }
    }

    pub fn position(&self, kind: ResourceKind) -> Option<usize> {
        self.records.iter().position(|r| r.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Operator supplied input, read-only for the whole run.
#[derive(Clone, Default)]
pub struct ProvisioningRequest {
    pub deployment_id: String,
    pub region: String,
    pub email_region: String,
    pub domain: String,
    pub object_storage_token: Option<String>,
    pub identity_access_key_id: Option<String>,
    pub identity_secret_access_key: Option<String>,
}

impl ProvisioningRequest {
    pub fn bucket_base(&self) -> String {
        self.deployment_id.to_lowercase()
    }

    pub fn access_key_label(&self) -> String {
        format!("{}-object-storage", self.deployment_id)
    }

    pub fn user_name(&self) -> String {
        format!("{}-smtp", self.deployment_id)
    }

    pub fn policy_name(&self) -> String {
        format!("{}-send-email", self.deployment_id)
    }
}

impl fmt::Debug for ProvisioningRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProvisioningRequest")
            .field("deployment_id", &self.deployment_id)
            .field("region", &self.region)
            .field("email_region", &self.email_region)
            .field("domain", &self.domain)
            .field("object_storage_token", &self.object_storage_token.as_ref().map(|_| "<redacted>"))
            .field("identity_access_key_id", &self.identity_access_key_id)
            .field(
                "identity_secret_access_key",
                &self.identity_secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// SMTP credential computed from an identity access key. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedCredential {
    pub username: String,
    pub secret_key: String,
    pub derived_password: String,
}

impl DerivedCredential {
    pub fn from_access_key(key: &AccessKeyPair) -> Result<DerivedCredential, Error> {
        Ok(DerivedCredential {
            username: key.access_key_id.clone(),
            secret_key: key.secret_access_key.clone(),
            derived_password: derive_smtp_password(&key.secret_access_key)?,
        })
    }
}

impl fmt::Debug for DerivedCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DerivedCredential")
            .field("username", &self.username)
            .field("secret_key", &"<redacted>")
            .field("derived_password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NameCandidate {
    pub base: String,
    pub suffix: String,
}

impl NameCandidate {
    pub fn name(&self) -> String {
        format!("{}-{}", self.base, self.suffix)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Init,
    Validating,
    Creating,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    FailedRollback,
    Aborted,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message = match self {
            State::Init => "INIT",
            State::Validating => "VALIDATING",
            State::Creating => "CREATING",
            State::Committing => "COMMITTING",
            State::Committed => "COMMITTED",
            State::RollingBack => "ROLLING_BACK",
            State::RolledBack => "ROLLED_BACK",
            State::FailedRollback => "FAILED_ROLLBACK",
            State::Aborted => "ABORTED",
        };
        write!(f, "{}", message)
    }
}

/// Terminal result of one coordinator run.
#[derive(Clone, Debug)]
pub enum Outcome {
    Committed,
    Aborted { missing: Vec<String> },
    RolledBack { cause: String },
    FailedRollback { cause: String, remaining: Vec<ResourceRecord> },
    PropagationPending { cause: String, pending: Vec<String> },
}

impl Outcome {
    pub fn state(&self) -> State {
        match self {
            Outcome::Committed => State::Committed,
            Outcome::Aborted { .. } => State::Aborted,
            Outcome::RolledBack { .. } => State::RolledBack,
            Outcome::FailedRollback { .. } => State::FailedRollback,
            Outcome::PropagationPending { .. } => State::Committing,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Committed => 0,
            Outcome::Aborted { .. } => 1,
            Outcome::RolledBack { .. } => 2,
            Outcome::FailedRollback { .. } => 3,
            Outcome::PropagationPending { .. } => 4,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Outcome::Committed => "COMMITTED: all resources created and credentials published".into(),
            Outcome::Aborted { missing } => {
                format!("ABORTED: missing prerequisites: {}", missing.join(", "))
            }
            Outcome::RolledBack { cause } => {
                format!("ROLLED_BACK: {}; every created resource was removed", cause)
            }
            Outcome::FailedRollback { cause, remaining } => format!(
                "FAILED_ROLLBACK: {}; {} resources need manual cleanup",
                cause,
                remaining.len()
            ),
            Outcome::PropagationPending { cause, pending } => format!(
                "COMMITTING incomplete: {}; re-run to publish {}",
                cause,
                pending.join(", ")
            ),
        }
    }
}
