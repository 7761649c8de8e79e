//! Running the netavark binary

use crate::error::{NetworkError, Result};
use crate::network::types::{Network, NetworkOptions, StatusBlock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::level_filters::LevelFilter;
use tracing::{debug, trace};

/// JSON document written to netavark's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct NetavarkRequest {
    #[serde(flatten)]
    pub options: NetworkOptions,
    /// Full definitions of the networks named in `options.networks`.
    pub network_info: HashMap<String, Network>,
}

#[derive(Debug, Deserialize)]
struct NetavarkErrorOutput {
    error: String,
}

/// Executes netavark setup and teardown.
#[async_trait]
pub trait NetavarkExec: Send + Sync {
    async fn setup(
        &self,
        namespace_path: &str,
        request: &NetavarkRequest,
    ) -> Result<HashMap<String, StatusBlock>>;

    async fn teardown(&self, namespace_path: &str, request: &NetavarkRequest) -> Result<()>;
}

/// [`NetavarkExec`] spawning the real binary.
#[derive(Debug, Clone)]
pub struct ProcessNetavark {
    binary: PathBuf,
    run_dir: PathBuf,
    timeout: Duration,
}

impl ProcessNetavark {
    pub fn new(binary: PathBuf, run_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            run_dir,
            timeout,
        }
    }

    async fn exec(&self, args: &[&str], request: &NetavarkRequest) -> Result<Vec<u8>> {
        let binary = self.binary.display().to_string();
        let payload = serde_json::to_vec(request)?;
        trace!(binary = %binary, ?args, payload = %String::from_utf8_lossy(&payload), "running netavark");

        let mut command = Command::new(&self.binary);
        command
            .arg("--config")
            .arg(&self.run_dir)
            .args(args)
            .envs(log_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| NetworkError::Exec {
            binary: binary.clone(),
            source,
        })?;

        // The write counts against the timeout too, a stuck child may never drain stdin.
        let stdin = child.stdin.take();
        let run = async {
            if let Some(mut stdin) = stdin {
                // netavark may exit before reading; its output explains why.
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| NetworkError::Timeout {
                binary: binary.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| NetworkError::Exec { binary, source })?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let code = output.status.code().unwrap_or(-1);
        let message = match serde_json::from_slice::<NetavarkErrorOutput>(&output.stdout) {
            Ok(err) => err.error,
            Err(_) => {
                let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if raw.is_empty() {
                    "unknown error".to_string()
                } else {
                    raw
                }
            }
        };
        Err(NetworkError::Netavark { code, message })
    }
}

#[async_trait]
impl NetavarkExec for ProcessNetavark {
    async fn setup(
        &self,
        namespace_path: &str,
        request: &NetavarkRequest,
    ) -> Result<HashMap<String, StatusBlock>> {
        let stdout = self.exec(&["setup", namespace_path], request).await?;
        let status: HashMap<String, StatusBlock> = serde_json::from_slice(&stdout).map_err(|e| {
            NetworkError::Internal(format!("failed to decode netavark setup output: {}", e))
        })?;
        debug!(networks = status.len(), "netavark setup finished");
        Ok(status)
    }

    async fn teardown(&self, namespace_path: &str, request: &NetavarkRequest) -> Result<()> {
        self.exec(&["teardown", namespace_path], request).await?;
        debug!("netavark teardown finished");
        Ok(())
    }
}

/// Pass our own verbosity through to netavark.
fn log_env() -> Vec<(&'static str, String)> {
    let level = LevelFilter::current();
    let mut env = vec![(
        "RUST_LOG",
        format!("netavark={}", level.to_string().to_lowercase()),
    )];
    if level >= LevelFilter::DEBUG {
        env.push(("RUST_BACKTRACE", "1".to_string()));
    }
    env
}
