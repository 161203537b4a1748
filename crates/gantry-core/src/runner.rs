//! Seam between the develop workflow and the sandbox session layer.
//! `gantry-sandbox` provides the container-backed implementation; tests use
//! in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Weak reference to a sandbox session: consumers hold the id only.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory relative to the session root.
    pub cwd: Option<String>,
    pub timeout_s: Option<u64>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecSpec {
    pub fn new(cmd: impl Into<String>, args: &[&str]) -> Self {
        Self {
            cmd: cmd.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Acquire a fresh session. Surfaces `RateLimited` when the registry is
    /// at capacity; callers retry with backoff.
    async fn acquire(&self) -> Result<SessionHandle>;

    /// Run one command inside the session. Cancellation SIGTERMs the child
    /// process group, waits the grace period, then SIGKILLs.
    async fn exec(
        &self,
        session: &SessionHandle,
        spec: ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;

    async fn release(&self, session: SessionHandle) -> Result<()>;
}
