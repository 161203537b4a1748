//! `SandboxRunner` implementation over the session registry: the develop
//! workflow's commands run through the same framed transport external
//! clients use.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use gantry_core::error::GantryError;
use gantry_core::runner::{ExecOutput, ExecSpec, SandboxRunner, SessionHandle};

use crate::frame::{self, pack, SpawnRequest, STREAM_EOF, STREAM_SIGNAL, STREAM_STDIN};
use crate::session::{SessionOptions, SessionRegistry};

pub struct RegistrySandboxRunner {
    registry: Arc<SessionRegistry>,
    term_grace_ms: u64,
}

impl RegistrySandboxRunner {
    pub fn new(registry: Arc<SessionRegistry>, term_grace_ms: u64) -> Arc<Self> {
        Arc::new(Self { registry, term_grace_ms })
    }
}

#[async_trait]
impl SandboxRunner for RegistrySandboxRunner {
    async fn acquire(&self) -> Result<SessionHandle> {
        let created = self
            .registry
            .create(None, SessionOptions::default())
            .await?;
        Ok(SessionHandle { id: created.id })
    }

    async fn exec(
        &self,
        session: &SessionHandle,
        spec: ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let (mut mux, mut rx) = self.registry.connect(&session.id).await?;

        let request = SpawnRequest {
            cmd: spec.cmd.clone(),
            args: spec.args.clone(),
            env: spec.env.iter().cloned().collect(),
            cwd: spec.cwd.clone(),
            timeout_s: spec.timeout_s,
        };
        mux.handle_frame(&request.to_frame()).await?;
        if let Some(stdin) = &spec.stdin {
            mux.handle_frame(&pack(STREAM_STDIN, stdin)).await?;
        }
        mux.handle_frame(&pack(STREAM_EOF, b"")).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut term_sent = false;
        let mut kill_at: Option<Instant> = None;

        let exit_code = loop {
            let kill_deadline = kill_at.unwrap_or_else(|| {
                // Far future placeholder while no SIGTERM is pending.
                Instant::now() + Duration::from_secs(24 * 3600)
            });
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !term_sent => {
                    debug!(session_id = %session.id, "cancelling command: SIGTERM");
                    let _ = mux.handle_frame(&pack(STREAM_SIGNAL, b"SIGTERM")).await;
                    term_sent = true;
                    kill_at = Some(Instant::now() + Duration::from_millis(self.term_grace_ms));
                }
                _ = tokio::time::sleep_until(kill_deadline), if kill_at.is_some() => {
                    debug!(session_id = %session.id, "grace elapsed: SIGKILL");
                    let _ = mux.handle_frame(&pack(STREAM_SIGNAL, b"SIGKILL")).await;
                    kill_at = None;
                }
                raw = rx.recv() => {
                    let raw = raw.context("transport closed before exit")?;
                    let (stream_id, payload) = frame::unpack(&raw)?;
                    match stream_id {
                        frame::STREAM_STDOUT => stdout.extend_from_slice(payload),
                        frame::STREAM_STDERR => stderr.extend_from_slice(payload),
                        frame::STREAM_EXIT => break frame::unpack_exit(payload)?,
                        _ => {}
                    }
                }
            }
        };

        if cancel.is_cancelled() {
            return Err(GantryError::Cancelled.into());
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn release(&self, session: SessionHandle) -> Result<()> {
        match self.registry.delete(&session.id).await {
            Ok(()) => Ok(()),
            // Already expired or deleted: releasing a weak reference twice
            // is fine.
            Err(e)
                if e.downcast_ref::<GantryError>()
                    .map(|g| matches!(g, GantryError::NotFound(_)))
                    .unwrap_or(false) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxMode;

    fn runner(dir: &std::path::Path) -> Arc<RegistrySandboxRunner> {
        let registry = SessionRegistry::new(
            &dir.to_string_lossy(),
            900,
            4,
            SandboxMode::Direct,
            "",
            Vec::new(),
            0,
            200,
        );
        RegistrySandboxRunner::new(registry, 200)
    }

    #[tokio::test]
    async fn exec_captures_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let session = runner.acquire().await.unwrap();

        let out = runner
            .exec(
                &session,
                ExecSpec::new("sh", &["-c", "echo out; echo err >&2"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");

        runner.release(session).await.unwrap();
    }

    #[tokio::test]
    async fn exec_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let session = runner.acquire().await.unwrap();

        let mut spec = ExecSpec::new("cat", &[]);
        spec.stdin = Some(b"from stdin".to_vec());
        let out = runner
            .exec(&session, spec, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "from stdin");
        runner.release(session).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let session = runner.acquire().await.unwrap();

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel2.cancel();
        });

        let err = runner
            .exec(&session, ExecSpec::new("sleep", &["30"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::Cancelled)
        ));
        runner.release(session).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let session = runner.acquire().await.unwrap();
        let again = SessionHandle { id: session.id.clone() };
        runner.release(session).await.unwrap();
        runner.release(again).await.unwrap();
    }
}
