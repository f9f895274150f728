use clap::{Args, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod controller;
mod derive;
mod journal;
mod model;
mod operator;
mod propagator;
mod provider;
#[cfg(test)]
mod testing;

use controller::{Clients, Coordinator};
use model::{Outcome, ProvisioningRequest};
use operator::RetryPolicy;
use provider::{CliIdentity, CliObjectStorage, KubeSecretStore};

/// Exit code for failures that end before a terminal state is reached.
const EXIT_INTERNAL: u8 = 5;

#[derive(Parser)]
#[command(name = "env-provisioner")]
#[command(bin_name = "env-provisioner")]
enum ProvisionerCli {
    /// Create (or resume creating) the environment's cloud resources.
    Provision(ProvisionArgs),
    /// Print the journal left by an unfinished run.
    Status(StatusArgs),
    /// Delete everything recorded in a leftover journal.
    Rollback(ProvisionArgs),
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct StatusArgs {
    #[arg(long, env = "PROVISION_DEPLOYMENT_ID")]
    deployment_id: String,
    #[arg(long, env = "PROVISION_STATE_DIR", default_value = ".provisioner")]
    state_dir: PathBuf,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct ProvisionArgs {
    #[arg(long, env = "PROVISION_DEPLOYMENT_ID")]
    deployment_id: String,
    #[arg(long, env = "PROVISION_REGION", default_value = "")]
    region: String,
    #[arg(long, env = "PROVISION_EMAIL_REGION", default_value = "")]
    email_region: String,
    #[arg(long, env = "PROVISION_DOMAIN", default_value = "")]
    domain: String,
    #[arg(long, env = "OBJECT_STORAGE_TOKEN", hide_env_values = true)]
    object_storage_token: Option<String>,
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    identity_access_key_id: Option<String>,
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    identity_secret_access_key: Option<String>,
    #[arg(long, env = "PROVISION_STATE_DIR", default_value = ".provisioner")]
    state_dir: PathBuf,
    #[arg(long, default_value = "flux-system")]
    secret_namespace: String,
    /// Defaults to `<deployment-id>-credentials`.
    #[arg(long)]
    secret_name: Option<String>,
    #[arg(long, default_value = "linode-cli")]
    object_storage_cli: String,
    #[arg(long, default_value = "aws")]
    identity_cli: String,
}

impl ProvisionArgs {
    fn request(&self) -> ProvisioningRequest {
        ProvisioningRequest {
            deployment_id: self.deployment_id.clone(),
            region: self.region.clone(),
            email_region: self.email_region.clone(),
            domain: self.domain.clone(),
            object_storage_token: self.object_storage_token.clone(),
            identity_access_key_id: self.identity_access_key_id.clone(),
            identity_secret_access_key: self.identity_secret_access_key.clone(),
        }
    }

    fn clients(&self) -> Clients {
        let secret_name = self
            .secret_name
            .clone()
            .unwrap_or_else(|| format!("{}-credentials", self.deployment_id));
        Clients {
            object_storage: Arc::new(CliObjectStorage::new(
                &self.object_storage_cli,
                self.object_storage_token.as_deref(),
                &self.region,
            )),
            identity: Arc::new(CliIdentity::new(
                &self.identity_cli,
                self.identity_access_key_id.as_deref(),
                self.identity_secret_access_key.as_deref(),
                &self.email_region,
            )),
            secrets: Arc::new(KubeSecretStore::new(&self.secret_namespace, &secret_name)),
        }
    }

    fn coordinator(&self, cancel: CancellationToken) -> Coordinator {
        Coordinator::new(
            self.request(),
            self.clients(),
            self.state_dir.clone(),
            RetryPolicy::default(),
            cancel,
        )
    }
}

fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current step");
            token.cancel();
        }
    });
    cancel
}

fn report(outcome: Result<Outcome, controller::Error>) -> ExitCode {
    match outcome {
        Ok(outcome) => {
            info!(state = %outcome.state(), "Run finished");
            println!("{}", outcome.message());
            if let Outcome::FailedRollback { remaining, .. } = &outcome {
                println!("Delete these resources manually, or re-run `rollback`:");
                for record in remaining {
                    println!("  {}", record.message());
                }
            }
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            error!(error = %e, "Provisioning stopped");
            eprintln!("{}", e);
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

fn status(args: StatusArgs) -> ExitCode {
    match journal::inspect(&args.state_dir, &args.deployment_id) {
        Ok(Some(journal)) => {
            println!(
                "Journal for {} (started {})",
                journal.deployment_id, journal.started_at
            );
            for record in &journal.records {
                println!(
                    "  {:<18} {:<40} parent={} created={}",
                    record.kind.to_string(),
                    record.id,
                    record.parent.as_deref().unwrap_or("-"),
                    record.created_at
                );
            }
            if !journal.unpublished.is_empty() {
                println!("  unpublished: {}", journal.unpublished.join(", "));
            }
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("No journal for {}", args.deployment_id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

/// something to drive the provisioner
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match ProvisionerCli::parse() {
        ProvisionerCli::Provision(args) => {
            let mut coordinator = args.coordinator(interrupt_token());
            let outcome = coordinator.run().await;
            debug!(state = %coordinator.state(), "Coordinator stopped");
            report(outcome)
        }
        ProvisionerCli::Rollback(args) => {
            let mut coordinator = args.coordinator(interrupt_token());
            let outcome = coordinator.roll_back_journal().await;
            debug!(state = %coordinator.state(), "Coordinator stopped");
            report(outcome)
        }
        ProvisionerCli::Status(args) => status(args),
    }
}
