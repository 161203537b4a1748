//! Container isolation for sandbox sessions.
//!
//! Two backends (preferred order when `auto`):
//! 1. **bwrap** — bubblewrap namespace isolation (no daemon, no image).
//!    Mounts the host read-only with the session directory read-write and
//!    a session-private /tmp, so files, processes, and environment in one
//!    session are unobservable from another.
//! 2. **docker** — `docker run --rm` per spawn with only the session
//!    directory bind-mounted.
//!
//! Set `SANDBOX_BACKEND=auto|bwrap|docker|none` in the environment.
//! Default is `auto` (bwrap if available, else docker, else direct).

use std::{path::Path, process::Stdio};

use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    Bwrap,
    Docker,
    /// No isolation; only suitable for tests and trusted setups.
    Direct,
}

impl SandboxMode {
    /// Parse from env/config string. Unknown values fall back to auto
    /// detection.
    pub fn from_str_or_auto(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bwrap" => Some(Self::Bwrap),
            "docker" => Some(Self::Docker),
            "none" | "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

pub struct Sandbox;

impl Sandbox {
    /// Detect the best available sandbox mode given a preference string.
    pub async fn detect(preferred: &str) -> SandboxMode {
        if let Some(forced) = SandboxMode::from_str_or_auto(preferred) {
            return forced;
        }
        if Self::bwrap_available().await {
            info!("sandbox: bwrap detected, using namespace sandbox");
            SandboxMode::Bwrap
        } else if Self::docker_available().await {
            info!("sandbox: bwrap not found, falling back to docker");
            SandboxMode::Docker
        } else {
            warn!("sandbox: neither bwrap nor docker available, running sessions directly (no isolation)");
            SandboxMode::Direct
        }
    }

    pub async fn bwrap_available() -> bool {
        if cfg!(not(target_os = "linux")) {
            return false;
        }
        Command::new("bwrap")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub async fn docker_available() -> bool {
        Command::new("docker")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    // --- bwrap backend ---

    /// Build bwrap argument list for `command` confined to one session.
    ///
    /// Mount order:
    /// 1. `--ro-bind / /`          — read-only root filesystem
    /// 2. `--dev /dev`             — minimal device tree
    /// 3. `--bind <session> <session>` — the session dir, read-write
    /// 4. `--bind <session>/tmp /tmp`  — session-private /tmp
    /// 5. `--unshare-pid`          — isolated PID namespace
    /// 6. `--new-session`          — setsid
    /// 7. `--die-with-parent`      — auto-cleanup
    /// 8. `--proc /proc`           — fresh procfs for the PID namespace
    /// 9. `--chdir`                — working directory inside the sandbox
    pub fn bwrap_args(session_dir: &str, working_dir: &str, command: &[String]) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        args.extend(["--ro-bind", "/", "/", "--dev", "/dev"].map(str::to_string));

        if Path::new(session_dir).exists() {
            args.extend(["--bind", session_dir, session_dir].map(str::to_string));
        } else {
            warn!("sandbox: session dir does not exist: {session_dir}");
        }

        let private_tmp = format!("{session_dir}/tmp");
        args.extend(["--bind".to_string(), private_tmp, "/tmp".to_string()]);

        args.extend(
            ["--unshare-pid", "--new-session", "--die-with-parent", "--proc", "/proc"]
                .map(str::to_string),
        );

        args.extend(["--chdir", working_dir].map(str::to_string));

        args.push("--".into());
        args.extend_from_slice(command);

        args
    }

    pub fn bwrap_command(session_dir: &str, working_dir: &str, command: &[String]) -> Command {
        let args = Self::bwrap_args(session_dir, working_dir, command);
        let mut cmd = Command::new("bwrap");
        cmd.args(args);
        cmd
    }

    // --- docker backend ---

    /// `docker run --rm` confined to the session directory. Env pairs are
    /// forwarded with `-e` so they reach the container, not just the
    /// docker client.
    pub fn docker_command(
        image: &str,
        session_dir: &str,
        working_dir: &str,
        env: &[(String, String)],
        command: &[String],
    ) -> Command {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--pids-limit".to_string(),
            "256".to_string(),
        ];

        if cfg!(target_os = "linux") {
            args.extend(
                ["--security-opt", "no-new-privileges:true", "--cap-drop", "ALL"]
                    .map(str::to_string),
            );
        }

        args.push("-v".to_string());
        args.push(format!("{session_dir}:{session_dir}"));

        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push("-w".to_string());
        args.push(working_dir.to_string());
        args.push(image.to_string());

        args.extend_from_slice(command);

        let mut cmd = Command::new("docker");
        cmd.args(args);
        cmd
    }
}
