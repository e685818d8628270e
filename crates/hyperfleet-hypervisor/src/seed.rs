//! NoCloud seed images.
//!
//! The seed is an ISO9660 volume labelled `cidata` holding the files from
//! [`NoCloudSeed::files`]. It is built locally with `genisoimage` and then
//! uploaded into the host's storage pool by the gateway.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use hyperfleet_core::{GatewayError, GatewayResult};

use crate::domain::NoCloudSeed;

#[derive(Debug, Clone)]
pub struct SeedBuilder {
    binary: PathBuf,
}

impl Default for SeedBuilder {
    fn default() -> Self {
        Self::new("genisoimage")
    }
}

/// A built seed image. The backing directory is removed on drop.
#[derive(Debug)]
pub struct SeedImage {
    _dir: TempDir,
    path: PathBuf,
    len: u64,
}

impl SeedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl SeedBuilder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub async fn build(&self, seed: &NoCloudSeed) -> GatewayResult<SeedImage> {
        let io = |what: &str, e: std::io::Error| {
            GatewayError::Protocol(format!("seed image: {what}: {e}"))
        };
        let dir = tempfile::tempdir().map_err(|e| io("temp dir", e))?;

        let mut files = Vec::new();
        for (name, contents) in seed.files() {
            let path = dir.path().join(name);
            tokio::fs::write(&path, contents)
                .await
                .map_err(|e| io(name, e))?;
            files.push(path);
        }

        let path = dir.path().join("seed.iso");
        let output = Command::new(&self.binary)
            .arg("-output")
            .arg(&path)
            .args(["-volid", "cidata", "-joliet", "-rock", "-quiet"])
            .args(&files)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| GatewayError::Protocol(format!("failed to run {}: {e}", self.binary.display())))?;
        if !output.status.success() {
            return Err(GatewayError::Protocol(format!(
                "{} failed: {}",
                self.binary.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let len = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io("seed.iso", e))?
            .len();
        debug!(path = %path.display(), len, "seed image built");
        Ok(SeedImage {
            _dir: dir,
            path,
            len,
        })
    }
}
