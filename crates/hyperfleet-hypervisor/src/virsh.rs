//! Thin async wrapper around the `virsh` client.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use hyperfleet_core::{GatewayError, GatewayResult, HostSpec};

/// How a failed virsh invocation should be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The domain or volume does not exist.
    NotFound,
    /// The domain or volume already exists.
    Exists,
    /// The domain is not running (e.g. `destroy` of a shut-off domain).
    NotRunning,
    Unreachable(String),
    Other(String),
}

impl Failure {
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_ascii_lowercase();
        let message = stderr.trim().to_string();
        if lower.contains("domain not found")
            || lower.contains("failed to get domain")
            || lower.contains("storage volume not found")
            || lower.contains("failed to get vol")
        {
            Failure::NotFound
        } else if lower.contains("already exists") || lower.contains("already active") {
            Failure::Exists
        } else if lower.contains("domain is not running") {
            Failure::NotRunning
        } else if lower.contains("failed to connect")
            || lower.contains("unable to connect")
            || lower.contains("cannot recv data")
            || lower.contains("connection refused")
            || lower.contains("no route to host")
        {
            Failure::Unreachable(message)
        } else {
            Failure::Other(message)
        }
    }

    pub fn into_gateway_error(self, host: &str) -> GatewayError {
        match self {
            Failure::Unreachable(msg) => GatewayError::Unreachable(format!("{host}: {msg}")),
            Failure::Other(msg) => GatewayError::Rejected(msg),
            Failure::NotFound => GatewayError::Rejected("not found".into()),
            Failure::Exists => GatewayError::Rejected("already exists".into()),
            Failure::NotRunning => GatewayError::Rejected("domain is not running".into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Virsh {
    binary: PathBuf,
}

impl Default for Virsh {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("virsh"),
        }
    }
}

impl Virsh {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `virsh -c <uri> <args..>` and return stdout.
    ///
    /// A non-zero exit is returned as a classified [`Failure`] so callers
    /// can treat "not found" or "already exists" as success where that
    /// keeps an operation idempotent.
    pub async fn run(
        &self,
        host: &HostSpec,
        args: &[&str],
        stdin: Option<&str>,
    ) -> GatewayResult<Result<String, Failure>> {
        let uri = host.connection_uri();
        debug!(host = %host.name, %uri, ?args, "virsh");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-q")
            .arg("-c")
            .arg(&uri)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::Unreachable(format!("{}: failed to run {}: {e}", host.name, self.binary.display()))
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| GatewayError::Protocol(format!("writing virsh stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| GatewayError::Protocol(format!("waiting for virsh: {e}")))?;

        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let failure = Failure::classify(&stderr);
            if matches!(failure, Failure::Other(_) | Failure::Unreachable(_)) {
                warn!(host = %host.name, ?args, stderr = %stderr.trim(), "virsh failed");
            }
            Ok(Err(failure))
        }
    }

    /// Like [`Virsh::run`] but every failure is an error.
    pub async fn run_ok(&self, host: &HostSpec, args: &[&str]) -> GatewayResult<String> {
        self.run(host, args, None)
            .await?
            .map_err(|f| f.into_gateway_error(&host.name))
    }
}
