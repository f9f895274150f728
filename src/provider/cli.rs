use serde::de::DeserializeOwned;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::ProviderError;

/// Runs one provider CLI with credentials passed through its environment.
#[derive(Clone)]
pub struct CliRunner {
    binary: String,
    envs: Vec<(String, String)>,
}

impl fmt::Debug for CliRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CliRunner")
            .field("binary", &self.binary)
            .field("envs", &names)
            .finish()
    }
}

impl CliRunner {
    pub fn new(binary: impl Into<String>) -> CliRunner {
        CliRunner {
            binary: binary.into(),
            envs: Vec::new(),
        }
    }

    pub fn env(mut self, key: &str, value: Option<&str>) -> CliRunner {
        if let Some(value) = value {
            self.envs.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub async fn ensure_available(&self) -> Result<(), ProviderError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("{}: {}", self.binary, e)))?;
        if !output.status.success() {
            return Err(ProviderError::Unavailable(format!(
                "{} --version exited with {}",
                self.binary, output.status
            )));
        }
        Ok(())
    }

    pub async fn run(&self, args: &[&str]) -> Result<String, ProviderError> {
        debug!(binary = %self.binary, command = %args.first().unwrap_or(&""), "Running provider CLI");
        let output = Command::new(&self.binary)
            .args(args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("{}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify(stderr.trim()))
        }
    }

    pub async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, ProviderError> {
        let stdout = self.run(args).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| ProviderError::Other(format!("unexpected {} output: {}", self.binary, e)))
    }
}

/// Maps a CLI error message to a `ProviderError`.
pub fn classify(stderr: &str) -> ProviderError {
    let message = stderr.to_string();
    let lower = stderr.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["throttl", "requestlimitexceeded", "toomanyrequests", "rate limit", "429"]) {
        ProviderError::Throttled(message)
    } else if has(&["nosuchentity", "not found", "notfound", "404"]) {
        ProviderError::NotFound(message)
    } else if has(&["entityalreadyexists", "already exists", "alreadyexists", "409"]) {
        ProviderError::AlreadyExists(message)
    } else if has(&["accessdenied", "unauthorized", "invalidclienttokenid", "forbidden", "401", "403"]) {
        ProviderError::PermissionDenied(message)
    } else if has(&["limitexceeded", "quota"]) {
        ProviderError::QuotaExceeded(message)
    } else if has(&[
        "timed out",
        "timeout",
        "could not connect",
        "connection reset",
        "connection refused",
        "serviceunavailable",
        "internalfailure",
        "500",
        "502",
        "503",
    ]) {
        ProviderError::Transient(message)
    } else {
        ProviderError::Other(message)
    }
}
