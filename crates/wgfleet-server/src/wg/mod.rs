// Copyright (C) 2025 the wgfleet authors
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

pub mod alloc;
pub mod ifname;
pub mod interface;
pub mod keys;
pub mod render;
pub mod stats;

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum WgError {
    #[error("failed to invoke {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with an error: {detail}")]
    Tool { program: &'static str, detail: String },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        program: &'static str,
        timeout: Duration,
    },

    #[error("interface is not running")]
    NotRunning,

    #[error("config file error: {0}")]
    Filesystem(#[from] std::io::Error),
}

pub type Result<T, E = WgError> = std::result::Result<T, E>;

/// Process boundary to the privileged WireGuard tooling (`wg`, `wg-quick`).
///
/// Everything that shells out goes through this trait so the lifecycle
/// controller, key generator, and stats collector can be exercised against a
/// recording mock in tests.
pub trait WgRunner: Send + Sync {
    /// Run `program` with `args`, optionally feeding `stdin`, and return
    /// trimmed stdout. A non-zero exit becomes [`WgError::Tool`].
    fn run(
        &self,
        program: &'static str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Real runner: spawns the tool with a bounded timeout. The child is killed
/// on drop, so a hung tool cannot outlive the timed-out call and wedge a
/// group lock.
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl WgRunner for SystemRunner {
    async fn run(
        &self,
        program: &'static str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| WgError::Spawn { program, source })?;

        if let Some(input) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|source| WgError::Spawn { program, source })?;
                drop(handle);
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| WgError::Timeout {
                program,
                timeout: self.timeout,
            })?
            .map_err(|source| WgError::Spawn { program, source })?;

        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WgError::Tool { program, detail });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
