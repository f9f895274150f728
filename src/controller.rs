use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::journal::{JournalError, JournalStore};
use crate::model::{
    AccessKeyPair, DerivedCredential, Journal, Outcome, ProvisioningRequest, ResourceKind,
    ResourceRecord, ResumePolicy, State,
};
use crate::operator::{
    BucketDriver, IdentityAccessKeyDriver, IdentityPolicyDriver, IdentityUserDriver,
    ObjectAccessKeyDriver, Operation, ResourceDriver, RetryPolicy,
};
use crate::propagator::{credentials, SecretPropagator};
use crate::provider::{IdentityClient, ObjectStorageClient, ProviderError, SecretStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error("ValidationError: {0}")]
    Validation(String),
    #[error("ProviderError: {operation} {kind} failed: {source}")]
    Provider {
        kind: ResourceKind,
        operation: Operation,
        source: ProviderError,
    },
    #[error("UniquenessExhausted: no free name for {base} after {attempts} attempts")]
    UniquenessExhausted { base: String, attempts: u32 },
    #[error("RollbackError: {failed} deletions failed")]
    Rollback { failed: usize },
    #[error("PropagationError: {cause}; unpublished: {pending:?}")]
    Propagation { pending: Vec<String>, cause: String },
    #[error("UnableToDeriveCredential: {0}")]
    Credential(String),
    #[error("Interrupted by operator")]
    Interrupted,
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl Error {
    pub fn provider(kind: ResourceKind, operation: Operation) -> impl FnOnce(ProviderError) -> Error {
        move |source| Error::Provider {
            kind,
            operation,
            source,
        }
    }
}

#[derive(Clone)]
pub struct Clients {
    pub object_storage: Arc<dyn ObjectStorageClient>,
    pub identity: Arc<dyn IdentityClient>,
    pub secrets: Arc<dyn SecretStore>,
}

/// Which prerequisites a run has to check before touching anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Needs {
    object_storage: bool,
    identity: bool,
    publishing: bool,
}

impl Needs {
    const ALL: Needs = Needs {
        object_storage: true,
        identity: true,
        publishing: true,
    };

    fn for_records(records: &[ResourceRecord]) -> Needs {
        let has = |kinds: &[ResourceKind]| records.iter().any(|r| kinds.contains(&r.kind));
        Needs {
            object_storage: has(&[ResourceKind::ObjectBucket, ResourceKind::ObjectAccessKey]),
            identity: has(&[
                ResourceKind::IdentityUser,
                ResourceKind::IdentityPolicy,
                ResourceKind::IdentityAccessKey,
            ]),
            publishing: false,
        }
    }
}

/// Record produced by one creation step.
struct Stepped {
    record: ResourceRecord,
    /// Created by this run rather than resumed from the journal.
    fresh: bool,
}

struct Provisioned {
    bucket_key: AccessKeyPair,
    smtp: DerivedCredential,
    created: usize,
}

/// Drives one provisioning run for a deployment identifier.
///
/// INIT loads the journal, VALIDATING checks prerequisites, CREATING runs the
/// five steps in dependency order journaling each one, COMMITTING publishes
/// credentials. Any failure while creating rolls the journal back in reverse.
pub struct Coordinator {
    request: ProvisioningRequest,
    clients: Clients,
    state_dir: PathBuf,
    cancel: CancellationToken,
    state: State,
    bucket: BucketDriver,
    object_key: ObjectAccessKeyDriver,
    user: IdentityUserDriver,
    policy: IdentityPolicyDriver,
    identity_key: IdentityAccessKeyDriver,
    propagator: SecretPropagator,
}

impl Coordinator {
    pub fn new(
        request: ProvisioningRequest,
        clients: Clients,
        state_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Coordinator {
        let policy = IdentityPolicyDriver::new(clients.identity.clone(), retry.clone());
        Coordinator {
            bucket: BucketDriver::new(clients.object_storage.clone(), retry.clone()),
            object_key: ObjectAccessKeyDriver::new(clients.object_storage.clone(), retry.clone()),
            user: IdentityUserDriver::new(clients.identity.clone(), retry.clone(), policy.clone()),
            identity_key: IdentityAccessKeyDriver::new(clients.identity.clone(), retry.clone()),
            propagator: SecretPropagator::new(clients.secrets.clone(), retry),
            policy,
            request,
            clients,
            state_dir: state_dir.into(),
            cancel,
            state: State::Init,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, next: State) {
        info!(
            deployment = %self.request.deployment_id,
            from = %self.state,
            to = %next,
            "State transition"
        );
        self.state = next;
    }

    fn driver(&self, kind: ResourceKind) -> &dyn ResourceDriver {
        match kind {
            ResourceKind::ObjectBucket => &self.bucket,
            ResourceKind::ObjectAccessKey => &self.object_key,
            ResourceKind::IdentityUser => &self.user,
            ResourceKind::IdentityPolicy => &self.policy,
            ResourceKind::IdentityAccessKey => &self.identity_key,
        }
    }

    fn open_journal(&mut self) -> Result<Result<(JournalStore, Journal), Outcome>, Error> {
        self.state = State::Init;
        let store = match JournalStore::acquire(&self.state_dir, &self.request.deployment_id) {
            Ok(store) => store,
            Err(JournalError::InvalidDeploymentId(id)) => {
                self.transition(State::Aborted);
                return Ok(Err(Outcome::Aborted {
                    missing: vec![format!("valid deployment identifier (got {:?})", id)],
                }));
            }
            Err(e) => return Err(e.into()),
        };
        let journal = store
            .load()?
            .unwrap_or_else(|| Journal::new(self.request.deployment_id.clone()));
        Ok(Ok((store, journal)))
    }

    /// Runs (or resumes) provisioning and reports the terminal outcome.
    ///
    /// `Err` is reserved for failures that leave no trustworthy journal, such
    /// as a lost write or a concurrent run holding the lock.
    pub async fn run(&mut self) -> Result<Outcome, Error> {
        let (store, mut journal) = match self.open_journal()? {
            Ok(opened) => opened,
            Err(outcome) => return Ok(outcome),
        };
        if !journal.is_empty() {
            info!(
                deployment = %self.request.deployment_id,
                records = journal.records.len(),
                "Resuming interrupted run"
            );
        }

        if let Some(outcome) = self.validate(Needs::ALL).await {
            return Ok(outcome);
        }

        self.transition(State::Creating);
        let provisioned = match self.create_all(&store, &mut journal).await {
            Ok(provisioned) => provisioned,
            Err(e @ Error::Journal(_)) => return Err(e),
            Err(e) => {
                error!(deployment = %self.request.deployment_id, error = %e, "Provisioning failed");
                return self.roll_back(&store, &mut journal, e.to_string()).await;
            }
        };

        self.transition(State::Committing);
        let mut values = credentials(&provisioned.bucket_key, &provisioned.smtp);
        if provisioned.created == 0 && !journal.unpublished.is_empty() {
            values.retain(|key, _| journal.unpublished.contains(key));
            info!(keys = ?journal.unpublished, "Retrying unpublished credentials only");
        }

        match self.propagator.publish(&values).await {
            Ok(()) => {
                store.clear()?;
                self.transition(State::Committed);
                Ok(Outcome::Committed)
            }
            Err(Error::Propagation { pending, cause }) => {
                journal.unpublished = pending.clone();
                store.write(&journal)?;
                warn!(
                    deployment = %self.request.deployment_id,
                    journal = %store.path().display(),
                    pending = ?pending,
                    "Resources are in place but credentials were not fully published"
                );
                Ok(Outcome::PropagationPending { cause, pending })
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes everything left in the journal without provisioning anything.
    ///
    /// Only the clients owning journaled kinds are checked, so cleanup works
    /// without access to the secret store.
    pub async fn roll_back_journal(&mut self) -> Result<Outcome, Error> {
        let (store, mut journal) = match self.open_journal()? {
            Ok(opened) => opened,
            Err(outcome) => return Ok(outcome),
        };
        if let Some(outcome) = self.validate(Needs::for_records(&journal.records)).await {
            return Ok(outcome);
        }
        self.roll_back(&store, &mut journal, "rollback requested by operator".into())
            .await
    }

    async fn validate(&mut self, needs: Needs) -> Option<Outcome> {
        self.transition(State::Validating);

        let mut missing: Vec<String> = Vec::new();
        let r = &self.request;
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());

        if needs.object_storage {
            if r.region.trim().is_empty() {
                missing.push("object storage region (--region)".into());
            }
            if blank(&r.object_storage_token) {
                missing.push("object storage token (OBJECT_STORAGE_TOKEN)".into());
            }
            if let Err(e) = self.clients.object_storage.ensure_available().await {
                missing.push(format!("object storage client: {}", e));
            }
        }
        if needs.identity {
            if blank(&r.identity_access_key_id) {
                missing.push("identity access key id (AWS_ACCESS_KEY_ID)".into());
            }
            if blank(&r.identity_secret_access_key) {
                missing.push("identity secret access key (AWS_SECRET_ACCESS_KEY)".into());
            }
            if let Err(e) = self.clients.identity.ensure_available().await {
                missing.push(format!("identity client: {}", e));
            }
        }
        if needs.publishing {
            if r.email_region.trim().is_empty() {
                missing.push("email region (--email-region)".into());
            }
            if r.domain.trim().is_empty() {
                missing.push("domain (--domain)".into());
            }
            if let Err(e) = self.clients.secrets.ensure_available().await {
                missing.push(format!("secret store: {}", e));
            }
        }

        if missing.is_empty() {
            return None;
        }
        for prerequisite in &missing {
            error!(deployment = %self.request.deployment_id, prerequisite = %prerequisite, "Missing prerequisite");
        }
        self.transition(State::Aborted);
        Some(Outcome::Aborted { missing })
    }

    fn checkpoint(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            warn!(deployment = %self.request.deployment_id, "Interrupt received, stopping before the next step");
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    async fn create_all(
        &self,
        store: &JournalStore,
        journal: &mut Journal,
    ) -> Result<Provisioned, Error> {
        let r = &self.request;
        let mut created = 0;

        let bucket_base = r.bucket_base();
        let bucket = self
            .step(
                store,
                journal,
                ResourceKind::ObjectBucket,
                None,
                &mut created,
                || self.bucket.create(&bucket_base),
            )
            .await?;

        let label = r.access_key_label();
        let object_key = self
            .step(
                store,
                journal,
                ResourceKind::ObjectAccessKey,
                Some(&bucket),
                &mut created,
                || self.object_key.create(&bucket.record.id, &label),
            )
            .await?;

        let user_name = r.user_name();
        let user = self
            .step(
                store,
                journal,
                ResourceKind::IdentityUser,
                None,
                &mut created,
                || self.user.create(&user_name),
            )
            .await?;

        let policy_name = r.policy_name();
        self.step(
            store,
            journal,
            ResourceKind::IdentityPolicy,
            Some(&user),
            &mut created,
            || self.policy.create(&user.record.id, &policy_name),
        )
        .await?;

        let identity_key = self
            .step(
                store,
                journal,
                ResourceKind::IdentityAccessKey,
                Some(&user),
                &mut created,
                || self.identity_key.create(&user.record.id),
            )
            .await?;

        let bucket_key = credential_of(&object_key.record)?;
        let smtp = DerivedCredential::from_access_key(&credential_of(&identity_key.record)?)?;

        Ok(Provisioned {
            bucket_key,
            smtp,
            created,
        })
    }

    /// Resumes the journaled resource of `kind` or creates a new one.
    async fn step<F, Fut>(
        &self,
        store: &JournalStore,
        journal: &mut Journal,
        kind: ResourceKind,
        parent: Option<&Stepped>,
        created: &mut usize,
        create: F,
    ) -> Result<Stepped, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResourceRecord, Error>>,
    {
        self.checkpoint()?;

        if let Some(record) = self.resume(store, journal, kind, parent).await? {
            return Ok(Stepped {
                record,
                fresh: false,
            });
        }

        let record = create().await?;
        let message = record.message();
        if let Err(e) = store.append(journal, record.clone()) {
            error!(resource = %message, error = %e, "Resource created but not journaled, delete it manually");
            return Err(e.into());
        }
        *created += 1;
        Ok(Stepped {
            record,
            fresh: true,
        })
    }

    /// A journaled record is reusable only while it still hangs off the
    /// resumed (not re-created) parent, still exists, and carries whatever
    /// secret its kind needs. Anything else is discarded and created again
    /// after its parent, which keeps the journal in creation order.
    async fn resume(
        &self,
        store: &JournalStore,
        journal: &mut Journal,
        kind: ResourceKind,
        parent: Option<&Stepped>,
    ) -> Result<Option<ResourceRecord>, Error> {
        let index = match journal.position(kind) {
            Some(index) => index,
            None => return Ok(None),
        };
        let record = journal.records[index].clone();
        let driver = self.driver(kind);

        let attached = parent.map_or(true, |p| {
            !p.fresh && record.parent.as_deref() == Some(p.record.id.as_str())
        });
        let exists = attached && driver.exists(&record).await?;
        let reusable = exists
            && match kind.resume_policy() {
                ResumePolicy::Reuse => true,
                ResumePolicy::ReuseWithSecret => record.credential.is_some(),
            };

        if reusable {
            info!(resource = %record.message(), "Already provisioned, skipping");
            return Ok(Some(record));
        }

        if exists || !attached {
            warn!(resource = %record.message(), "Journaled resource cannot be reused, replacing it");
        } else {
            warn!(resource = %record.message(), "Journaled resource no longer exists, recreating");
        }
        // a policy that is no longer attached still exists and must go too
        self.discard(&record).await?;
        store.remove(journal, index)?;
        Ok(None)
    }

    /// Deletes a record's resource, except for resources this deployment
    /// adopted instead of creating, which are only dropped from the journal.
    async fn discard(&self, record: &ResourceRecord) -> Result<(), Error> {
        if record.adopted {
            warn!(resource = %record.message(), "Leaving adopted resource in place");
            return Ok(());
        }
        self.driver(record.kind).delete(record).await
    }

    async fn roll_back(
        &mut self,
        store: &JournalStore,
        journal: &mut Journal,
        cause: String,
    ) -> Result<Outcome, Error> {
        self.transition(State::RollingBack);

        match self.sweep(store, journal).await {
            Ok(()) => {
                store.clear()?;
                self.transition(State::RolledBack);
                Ok(Outcome::RolledBack { cause })
            }
            Err(e) => {
                error!(
                    deployment = %self.request.deployment_id,
                    journal = %store.path().display(),
                    error = %e,
                    "Rollback incomplete"
                );
                for record in &journal.records {
                    error!(resource = %record.message(), "Requires manual cleanup");
                }
                self.transition(State::FailedRollback);
                Ok(Outcome::FailedRollback {
                    cause,
                    remaining: journal.records.clone(),
                })
            }
        }
    }

    /// Deletes journaled resources newest first. A failed deletion is counted
    /// and the sweep moves on; successfully deleted records leave the journal.
    async fn sweep(&self, store: &JournalStore, journal: &mut Journal) -> Result<(), Error> {
        let mut failed = 0;
        for index in (0..journal.records.len()).rev() {
            let record = journal.records[index].clone();
            match self.discard(&record).await {
                Ok(()) => {
                    info!(kind = %self.driver(record.kind).kind(), id = %record.id, "Rolled back");
                    if let Err(e) = store.remove(journal, index) {
                        warn!(resource = %record.message(), error = %e, "Deleted but journal not updated");
                    }
                }
                Err(e) => {
                    error!(resource = %record.message(), error = %e, "Rollback deletion failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(Error::Rollback { failed });
        }
        Ok(())
    }
}

fn credential_of(record: &ResourceRecord) -> Result<AccessKeyPair, Error> {
    record
        .credential
        .clone()
        .ok_or_else(|| Error::Validation(format!("{} has no issued secret", record.message())))
}
