//! Per-connection process multiplexer.
//!
//! The frame format carries no process id, so one connection drives one
//! child at a time; concurrent commands on a session use multiple
//! connections (each connection gets its own multiplexer). The server
//! delivers exit exactly once per spawned process, after every pending
//! stdout/stderr frame has been flushed.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gantry_core::error::GantryError;

use crate::frame::{
    self, SpawnRequest, STREAM_EOF, STREAM_SIGNAL, STREAM_SPAWN, STREAM_STDERR, STREAM_STDIN,
    STREAM_STDOUT,
};
use crate::sandbox::{Sandbox, SandboxMode};

/// Everything a connection needs to spawn children inside its session.
#[derive(Debug, Clone)]
pub struct SpawnCtx {
    /// Session root; the only writable mount, with a private tmp inside.
    pub session_dir: String,
    /// Session env plus the registry's injected secret set.
    pub env: Vec<(String, String)>,
    pub mode: SandboxMode,
    pub image: String,
    /// Applied when a spawn request names no timeout. 0 disables.
    pub default_timeout_s: u64,
    /// SIGTERM → SIGKILL grace on timeout expiry.
    pub term_grace_ms: u64,
}

struct ChildHandle {
    pid: i32,
    /// Present until stdin EOF; dropping it closes the child's stdin.
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    exited: Arc<AtomicBool>,
}

pub struct Multiplexer {
    ctx: SpawnCtx,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    current: Option<ChildHandle>,
}

fn kill_group(pid: i32, signo: i32) {
    // With process_group(0) the child's pgid equals its pid.
    unsafe {
        libc::killpg(pid, signo);
    }
}

/// Resolve a requested cwd against the session root, rejecting traversal
/// and absolute paths.
fn resolve_cwd(session_dir: &str, requested: Option<&str>) -> Result<PathBuf, GantryError> {
    let base = PathBuf::from(session_dir);
    let Some(requested) = requested else {
        return Ok(base);
    };
    let rel = Path::new(requested);
    for comp in rel.components() {
        match comp {
            Component::ParentDir => {
                return Err(GantryError::MalformedPayload(format!(
                    "cwd escapes session: {requested}"
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(GantryError::MalformedPayload(format!(
                    "cwd must be session-relative: {requested}"
                )))
            }
            _ => {}
        }
    }
    Ok(base.join(rel))
}

impl Multiplexer {
    /// Returns the multiplexer and the receiver of outbound frames.
    pub fn new(ctx: SpawnCtx) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (Self { ctx, out_tx, current: None }, out_rx)
    }

    fn active(&self) -> bool {
        self.current
            .as_ref()
            .map(|c| !c.exited.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Dispatch one inbound frame.
    pub async fn handle_frame(&mut self, raw: &[u8]) -> Result<()> {
        let (stream_id, payload) = frame::unpack(raw)?;
        match stream_id {
            STREAM_SPAWN => {
                let request = SpawnRequest::parse(payload)?;
                self.spawn(request)
            }
            STREAM_STDIN => self.stdin(payload),
            STREAM_EOF => {
                if let Some(child) = self.current.as_mut() {
                    child.stdin_tx = None;
                }
                Ok(())
            }
            STREAM_SIGNAL => self.signal(payload),
            other => Err(GantryError::MalformedPayload(format!(
                "unexpected client stream id {other}"
            ))
            .into()),
        }
    }

    fn stdin(&mut self, payload: &[u8]) -> Result<()> {
        let child = self
            .current
            .as_ref()
            .ok_or_else(|| GantryError::NotFound("no spawned process".into()))?;
        match &child.stdin_tx {
            None => Err(GantryError::Conflict("stdin write after EOF".into()).into()),
            Some(tx) => {
                // A send failure means the child already exited and took
                // its stdin with it; that is not a protocol error.
                let _ = tx.send(payload.to_vec());
                Ok(())
            }
        }
    }

    fn signal(&mut self, payload: &[u8]) -> Result<()> {
        let name = std::str::from_utf8(payload)
            .map_err(|_| GantryError::MalformedPayload("signal name is not ASCII".into()))?;
        let signo = frame::signal_number(name).ok_or_else(|| {
            GantryError::MalformedPayload(format!("unsupported signal: {name}"))
        })?;
        let Some(child) = self.current.as_ref() else {
            // No process ever spawned: nothing to signal.
            return Ok(());
        };
        if child.exited.load(Ordering::SeqCst) {
            // Signal to an already-exited process is a successful no-op.
            return Ok(());
        }
        debug!(pid = child.pid, signal = name, "delivering signal to process group");
        kill_group(child.pid, signo);
        Ok(())
    }

    fn spawn(&mut self, request: SpawnRequest) -> Result<()> {
        if self.active() {
            return Err(GantryError::Conflict(
                "a process is already running on this connection".into(),
            )
            .into());
        }

        let cwd = resolve_cwd(&self.ctx.session_dir, request.cwd.as_deref())?;
        std::fs::create_dir_all(&cwd).context("create spawn cwd")?;
        let cwd_str = cwd.to_string_lossy().into_owned();

        let mut env: Vec<(String, String)> = request
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // Injected secrets win over request-supplied values.
        env.extend(self.ctx.env.iter().cloned());

        let mut full_cmd = vec![request.cmd.clone()];
        full_cmd.extend(request.args.iter().cloned());

        let mut cmd = match &self.ctx.mode {
            SandboxMode::Bwrap => {
                Sandbox::bwrap_command(&self.ctx.session_dir, &cwd_str, &full_cmd)
            }
            SandboxMode::Docker => Sandbox::docker_command(
                &self.ctx.image,
                &self.ctx.session_dir,
                &cwd_str,
                &env,
                &full_cmd,
            ),
            SandboxMode::Direct => {
                let mut cmd = Command::new(&request.cmd);
                cmd.args(&request.args);
                cmd.current_dir(&cwd_str);
                cmd
            }
        };
        for (key, value) in &env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| GantryError::SandboxFailure(format!("spawn {}: {e}", request.cmd)))?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);

        let mut stdout = child.stdout.take().context("child stdout missing")?;
        let mut stderr = child.stderr.take().context("child stderr missing")?;
        let mut stdin = child.stdin.take().context("child stdin missing")?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            // Dropping stdin closes the pipe: EOF for the child.
        });

        let exited = Arc::new(AtomicBool::new(false));
        let out_tx = self.out_tx.clone();

        let stdout_tx = out_tx.clone();
        let stdout_pump = tokio::spawn(async move {
            pump(&mut stdout, STREAM_STDOUT, stdout_tx).await;
        });
        let stderr_tx = out_tx.clone();
        let stderr_pump = tokio::spawn(async move {
            pump(&mut stderr, STREAM_STDERR, stderr_tx).await;
        });

        // Timeout watchdog: SIGTERM the group, wait the grace, SIGKILL.
        let timeout_s = request.timeout_s.unwrap_or(self.ctx.default_timeout_s);
        if timeout_s > 0 {
            let exited = Arc::clone(&exited);
            let grace_ms = self.ctx.term_grace_ms;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(timeout_s)).await;
                if exited.load(Ordering::SeqCst) {
                    return;
                }
                warn!(pid, timeout_s, "command timed out; terminating");
                kill_group(pid, libc::SIGTERM);
                tokio::time::sleep(std::time::Duration::from_millis(grace_ms)).await;
                if !exited.load(Ordering::SeqCst) {
                    kill_group(pid, libc::SIGKILL);
                }
            });
        }

        let exited_flag = Arc::clone(&exited);
        tokio::spawn(async move {
            // Output is flushed before exit is reported.
            let _ = stdout_pump.await;
            let _ = stderr_pump.await;
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(pid, "wait failed: {e}");
                    1
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = out_tx.send(frame::pack_exit(code));
        });

        self.current = Some(ChildHandle { pid, stdin_tx: Some(stdin_tx), exited });
        Ok(())
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return frame::signal_exit_code(signo);
        }
    }
    1
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    stream_id: u8,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(frame::pack(stream_id, &buf[..n])).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{pack, STREAM_EXIT};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ctx(dir: &Path) -> SpawnCtx {
        SpawnCtx {
            session_dir: dir.to_string_lossy().into_owned(),
            env: Vec::new(),
            mode: SandboxMode::Direct,
            image: String::new(),
            default_timeout_s: 0,
            term_grace_ms: 200,
        }
    }

    fn spawn_frame(cmd: &str, args: &[&str]) -> Vec<u8> {
        SpawnRequest {
            cmd: cmd.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
        .to_frame()
    }

    /// Drain frames until the exit frame arrives.
    async fn collect_until_exit(
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> (Vec<u8>, Vec<u8>, i32) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let raw = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for frames")
                .expect("frame channel closed before exit");
            let (id, payload) = frame::unpack(&raw).unwrap();
            match id {
                STREAM_STDOUT => stdout.extend_from_slice(payload),
                STREAM_STDERR => stderr.extend_from_slice(payload),
                STREAM_EXIT => return (stdout, stderr, frame::unpack_exit(payload).unwrap()),
                other => panic!("unexpected stream id {other}"),
            }
        }
    }

    #[tokio::test]
    async fn cat_round_trip_with_eof() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));

        mux.handle_frame(&spawn_frame("cat", &[])).await.unwrap();
        mux.handle_frame(&pack(STREAM_STDIN, b"line1\n")).await.unwrap();
        mux.handle_frame(&pack(STREAM_STDIN, b"line2\n")).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();

        let (stdout, stderr, code) = collect_until_exit(&mut rx).await;
        assert_eq!(stdout, b"line1\nline2\n");
        assert!(stderr.is_empty());
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn empty_stdin_then_eof_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("cat", &[])).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();

        let (stdout, _, code) = collect_until_exit(&mut rx).await;
        assert!(stdout.is_empty());
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_separate_streams() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("sh", &["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();

        let (stdout, stderr, code) = collect_until_exit(&mut rx).await;
        assert_eq!(stdout, b"out\n");
        assert_eq!(stderr, b"err\n");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn natural_exit_code_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("sh", &["-c", "exit 7"])).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();
        let (_, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn sigterm_maps_to_143() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("sleep", &["30"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        mux.handle_frame(&pack(STREAM_SIGNAL, b"SIGTERM")).await.unwrap();
        let (_, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, 143);
    }

    #[tokio::test]
    async fn sigkill_bypasses_term_trap() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("sh", &["-c", "trap '' TERM; echo ready; sleep 30"]))
            .await
            .unwrap();

        // Wait for the trap to be installed before signalling.
        let raw = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let (id, payload) = frame::unpack(&raw).unwrap();
        assert_eq!((id, payload), (STREAM_STDOUT, b"ready\n".as_slice()));

        mux.handle_frame(&pack(STREAM_SIGNAL, b"SIGKILL")).await.unwrap();
        let (_, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, 137);
    }

    #[tokio::test]
    async fn command_timeout_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        let req = SpawnRequest {
            cmd: "sleep".into(),
            args: vec!["30".into()],
            timeout_s: Some(1),
            ..Default::default()
        };
        mux.handle_frame(&req.to_frame()).await.unwrap();
        let (_, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, 143);
    }

    #[tokio::test]
    async fn unsupported_signal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, _rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("sleep", &["5"])).await.unwrap();
        let err = mux
            .handle_frame(&pack(STREAM_SIGNAL, b"SIGUSR1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::MalformedPayload(_))
        ));
        mux.handle_frame(&pack(STREAM_SIGNAL, b"SIGKILL")).await.unwrap();
    }

    #[tokio::test]
    async fn stdin_after_eof_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("cat", &[])).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();
        let err = mux
            .handle_frame(&pack(STREAM_STDIN, b"late"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::Conflict(_))
        ));
        let (stdout, _, code) = collect_until_exit(&mut rx).await;
        assert!(stdout.is_empty());
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn signal_after_exit_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("true", &[])).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();
        let (_, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, 0);

        mux.handle_frame(&pack(STREAM_SIGNAL, b"SIGTERM")).await.unwrap();
    }

    #[tokio::test]
    async fn one_process_per_connection_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));
        mux.handle_frame(&spawn_frame("sleep", &["30"])).await.unwrap();

        let err = mux.handle_frame(&spawn_frame("true", &[])).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::Conflict(_))
        ));

        mux.handle_frame(&pack(STREAM_SIGNAL, b"SIGKILL")).await.unwrap();
        let (_, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, 137);

        // After exit the connection accepts a fresh spawn.
        mux.handle_frame(&spawn_frame("sh", &["-c", "echo again"])).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();
        let (stdout, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(stdout, b"again\n");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn session_env_is_injected_into_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        c.env.push(("GANTRY_TEST_SECRET".into(), "hunter2-long".into()));
        let (mut mux, mut rx) = Multiplexer::new(c);
        mux.handle_frame(&spawn_frame("sh", &["-c", "printf %s \"$GANTRY_TEST_SECRET\""]))
            .await
            .unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();
        let (stdout, _, _) = collect_until_exit(&mut rx).await;
        assert_eq!(stdout, b"hunter2-long");
    }

    #[tokio::test]
    async fn cwd_resolves_inside_session_and_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mux, mut rx) = Multiplexer::new(ctx(dir.path()));

        let req = SpawnRequest {
            cmd: "pwd".into(),
            cwd: Some("work/sub".into()),
            ..Default::default()
        };
        mux.handle_frame(&req.to_frame()).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();
        let (stdout, _, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, 0);
        assert!(String::from_utf8_lossy(&stdout).trim().ends_with("work/sub"));

        let escape = SpawnRequest {
            cmd: "pwd".into(),
            cwd: Some("../outside".into()),
            ..Default::default()
        };
        assert!(mux.handle_frame(&escape.to_frame()).await.is_err());

        let absolute = SpawnRequest {
            cmd: "pwd".into(),
            cwd: Some("/etc".into()),
            env: BTreeMap::new(),
            ..Default::default()
        };
        assert!(mux.handle_frame(&absolute.to_frame()).await.is_err());
    }
}
