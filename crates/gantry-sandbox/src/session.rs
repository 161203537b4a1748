//! Session registry: addressable sandbox containers with stable ids for
//! the duration of their TTL.
//!
//! Consumers hold session ids only (a weak reference plus lookup). Every
//! spawn in every session gets the registry's secret-injection env set.
//! Isolation comes from the container backend plus per-session working
//! directories and env maps; creation and deletion serialize on the
//! registry lock.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gantry_core::error::GantryError;

use crate::proc::{Multiplexer, SpawnCtx};
use crate::sandbox::SandboxMode;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub ttl_s: Option<i64>,
    /// Session-scoped env exported into every spawn of this session.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_s: i64,
}

#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub id: String,
    pub expires_in_s: i64,
    /// False when an unexpired session with this id already existed.
    pub created: bool,
}

#[derive(Debug, Clone)]
struct SessionState {
    id: String,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    workdir: String,
    env: Vec<(String, String)>,
}

impl SessionState {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn info(&self, now: DateTime<Utc>) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            expires_at: self.expires_at,
            expires_in_s: (self.expires_at - now).num_seconds().max(0),
        }
    }
}

pub struct SessionRegistry {
    data_dir: String,
    default_ttl_s: i64,
    max_sessions: usize,
    mode: SandboxMode,
    image: String,
    /// Secret env injected into every spawn in every session.
    inject: Vec<(String, String)>,
    command_timeout_s: u64,
    term_grace_ms: u64,
    sessions: Mutex<HashMap<String, SessionState>>,
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 4];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    format!("sess-{}", hex::encode(bytes))
}

fn validate_session_id(id: &str) -> Result<(), GantryError> {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed.len() > 64 {
        return Err(GantryError::MalformedPayload("invalid session id".into()));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(GantryError::MalformedPayload(format!(
            "invalid session id: {trimmed}"
        )));
    }
    Ok(())
}

impl SessionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_dir: &str,
        default_ttl_s: i64,
        max_sessions: usize,
        mode: SandboxMode,
        image: &str,
        inject: Vec<(String, String)>,
        command_timeout_s: u64,
        term_grace_ms: u64,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            data_dir: data_dir.to_string(),
            default_ttl_s,
            max_sessions,
            mode,
            image: image.to_string(),
            inject,
            command_timeout_s,
            term_grace_ms,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn workdir_of(&self, id: &str) -> String {
        format!("{}/sessions/{id}", self.data_dir)
    }

    /// Create a session, or return the existing one when the id is already
    /// bound and unexpired (idempotent create).
    pub async fn create(
        &self,
        id: Option<String>,
        options: SessionOptions,
    ) -> Result<CreatedSession> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;

        if let Some(requested) = &id {
            validate_session_id(requested)?;
            if let Some(existing) = sessions.get(requested.trim()) {
                if !existing.expired(now) {
                    return Ok(CreatedSession {
                        id: existing.id.clone(),
                        expires_in_s: (existing.expires_at - now).num_seconds().max(0),
                        created: false,
                    });
                }
            }
        }

        let live = sessions.values().filter(|s| !s.expired(now)).count();
        if live >= self.max_sessions {
            return Err(GantryError::RateLimited(format!(
                "session limit reached ({live}/{})",
                self.max_sessions
            ))
            .into());
        }

        let id = id
            .map(|s| s.trim().to_string())
            .unwrap_or_else(new_session_id);
        let ttl = options.ttl_s.unwrap_or(self.default_ttl_s);
        let workdir = self.workdir_of(&id);
        std::fs::create_dir_all(format!("{workdir}/tmp"))?;

        let state = SessionState {
            id: id.clone(),
            created_at: now,
            last_active_at: now,
            expires_at: now + Duration::seconds(ttl),
            workdir,
            env: options.env,
        };
        sessions.insert(id.clone(), state);
        info!(session_id = %id, ttl_s = ttl, "session created");
        Ok(CreatedSession { id, expires_in_s: ttl, created: true })
    }

    /// Look a session up; expired sessions are torn down on the way out.
    pub async fn get(&self, id: &str) -> Result<SessionInfo> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let expired = match sessions.get(id) {
            None => return Err(GantryError::NotFound(format!("session {id}")).into()),
            Some(state) => state.expired(now),
        };
        if expired {
            let removed = sessions.remove(id);
            drop(sessions);
            if let Some(state) = removed {
                teardown(&state.workdir);
            }
            return Err(GantryError::NotFound(format!("session {id}")).into());
        }
        match sessions.get_mut(id) {
            Some(state) => {
                state.last_active_at = now;
                Ok(state.info(now))
            }
            None => Err(GantryError::NotFound(format!("session {id}")).into()),
        }
    }

    /// Tear the session down and invalidate the id.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            None => Err(GantryError::NotFound(format!("session {id}")).into()),
            Some(state) => {
                teardown(&state.workdir);
                info!(session_id = %id, "session deleted");
                Ok(())
            }
        }
    }

    /// Periodic TTL enforcement. Returns how many sessions were reaped.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.expired(now))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            if let Some(state) = sessions.remove(id) {
                teardown(&state.workdir);
                debug!(session_id = %id, "expired session reaped");
            }
        }
        expired.len()
    }

    /// Open a framed connection to the session. Multiple connections per
    /// session are permitted; each drives its own spawn requests.
    pub async fn connect(
        &self,
        id: &str,
    ) -> Result<(Multiplexer, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>)> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .get_mut(id)
            .filter(|s| !s.expired(now))
            .ok_or_else(|| GantryError::NotFound(format!("session {id}")))?;
        state.last_active_at = now;

        let mut env = state.env.clone();
        env.extend(self.inject.iter().cloned());
        let ctx = SpawnCtx {
            session_dir: state.workdir.clone(),
            env,
            mode: self.mode.clone(),
            image: self.image.clone(),
            default_timeout_s: self.command_timeout_s,
            term_grace_ms: self.term_grace_ms,
        };
        Ok(Multiplexer::new(ctx))
    }
}

fn teardown(workdir: &str) {
    if let Err(e) = std::fs::remove_dir_all(workdir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(workdir, "session teardown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, pack, SpawnRequest, STREAM_EOF, STREAM_EXIT};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn registry(dir: &std::path::Path, max: usize) -> Arc<SessionRegistry> {
        SessionRegistry::new(
            &dir.to_string_lossy(),
            900,
            max,
            SandboxMode::Direct,
            "",
            vec![("AGENT_TOKEN".into(), "tok_inject_9".into())],
            0,
            200,
        )
    }

    #[tokio::test]
    async fn create_is_idempotent_on_unexpired_id() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);

        let first = reg
            .create(Some("alpha".into()), SessionOptions::default())
            .await
            .unwrap();
        assert!(first.created);
        let second = reg
            .create(Some("alpha".into()), SessionOptions::default())
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.id, "alpha");
    }

    #[tokio::test]
    async fn get_delete_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);
        let created = reg.create(None, SessionOptions::default()).await.unwrap();

        let info = reg.get(&created.id).await.unwrap();
        assert!(info.expires_in_s > 0);

        reg.delete(&created.id).await.unwrap();
        assert!(reg.get(&created.id).await.is_err());
        assert!(reg.delete(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn expired_sessions_are_not_found_and_swept() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);
        let created = reg
            .create(
                Some("shortlived".into()),
                SessionOptions { ttl_s: Some(-1), env: Vec::new() },
            )
            .await
            .unwrap();
        assert!(created.created);

        let err = reg.get("shortlived").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::NotFound(_))
        ));

        // A fresh create under the same id succeeds after expiry.
        let again = reg
            .create(Some("shortlived".into()), SessionOptions::default())
            .await
            .unwrap();
        assert!(again.created);

        reg.create(
            Some("tick".into()),
            SessionOptions { ttl_s: Some(-1), env: Vec::new() },
        )
        .await
        .unwrap();
        assert_eq!(reg.sweep_expired().await, 1);
    }

    #[tokio::test]
    async fn creation_is_rate_limited_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 1);
        reg.create(None, SessionOptions::default()).await.unwrap();
        let err = reg
            .create(None, SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn bad_session_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);
        for bad in ["", "   ", "../escape", "a/b", "a b"] {
            assert!(
                reg.create(Some(bad.into()), SessionOptions::default())
                    .await
                    .is_err(),
                "expected rejection for {bad:?}"
            );
        }
    }

    async fn run(
        reg: &SessionRegistry,
        session: &str,
        cmd: &str,
        args: &[&str],
    ) -> (String, i32) {
        let (mut mux, mut rx) = reg.connect(session).await.unwrap();
        let req = SpawnRequest {
            cmd: cmd.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        mux.handle_frame(&req.to_frame()).await.unwrap();
        mux.handle_frame(&pack(STREAM_EOF, b"")).await.unwrap();
        let mut stdout = Vec::new();
        loop {
            let raw = tokio::time::timeout(StdDuration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let (id, payload) = frame::unpack(&raw).unwrap();
            match id {
                frame::STREAM_STDOUT => stdout.extend_from_slice(payload),
                STREAM_EXIT => {
                    return (
                        String::from_utf8_lossy(&stdout).into_owned(),
                        frame::unpack_exit(payload).unwrap(),
                    )
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn filesystem_isolation_between_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);
        let a = reg.create(Some("a".into()), SessionOptions::default()).await.unwrap();
        let b = reg.create(Some("b".into()), SessionOptions::default()).await.unwrap();

        let (_, code) = run(&reg, &a.id, "sh", &["-c", "echo hello > s.txt"]).await;
        assert_eq!(code, 0);

        let (out, code) = run(&reg, &a.id, "cat", &["s.txt"]).await;
        assert_eq!(code, 0);
        assert_eq!(out, "hello\n");

        // Session b cannot see session a's file.
        let (out, code) = run(&reg, &b.id, "cat", &["s.txt"]).await;
        assert_ne!(code, 0);
        assert!(!out.contains("hello"));
    }

    #[tokio::test]
    async fn environment_isolation_between_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);
        reg.create(
            Some("a".into()),
            SessionOptions {
                ttl_s: None,
                env: vec![("ONLY_IN_A".into(), "a-value".into())],
            },
        )
        .await
        .unwrap();
        reg.create(Some("b".into()), SessionOptions::default()).await.unwrap();

        let (out, _) = run(&reg, "a", "sh", &["-c", "printf %s \"$ONLY_IN_A\""]).await;
        assert_eq!(out, "a-value");
        let (out, _) = run(&reg, "b", "sh", &["-c", "printf %s \"$ONLY_IN_A\""]).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn secrets_are_injected_into_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);
        reg.create(Some("a".into()), SessionOptions::default()).await.unwrap();
        let (out, _) = run(&reg, "a", "sh", &["-c", "printf %s \"$AGENT_TOKEN\""]).await;
        assert_eq!(out, "tok_inject_9");
    }

    #[tokio::test]
    async fn connect_to_unknown_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 4);
        assert!(reg.connect("ghost").await.is_err());
    }
}
