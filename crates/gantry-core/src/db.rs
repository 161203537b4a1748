use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::forge::RepoBinding;
use crate::issue::Issue;

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Auxiliary types ───────────────────────────────────────────────────────

/// One workflow intent: an issue dispatched to an agent. At most one
/// non-terminal (`running`) row per issue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Intent {
    pub workflow_id: String,
    pub repo_id: i64,
    pub issue_id: String,
    pub agent: String,
    /// "running" | "done" | "failed" | "cancelled"
    pub state: String,
    pub session_id: String,
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Intent {
    pub fn is_terminal(&self) -> bool {
        self.state != "running"
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncSnapshot {
    pub state: String,
    pub error_count: i64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_commit_sha: String,
    pub issue_count: i64,
    pub milestone_count: i64,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            state: "idle".into(),
            error_count: 0,
            last_success: None,
            last_commit_sha: String::new(),
            issue_count: 0,
            milestone_count: 0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncLogEntry {
    pub source: String,
    pub action: String,
    pub created_at: DateTime<Utc>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoBinding> {
    Ok(RepoBinding {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        installation_id: row.get(3)?,
        webhook_secret: row.get(4)?,
        default_branch: row.get(5)?,
    })
}

fn row_to_intent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Intent> {
    let started: String = row.get(7)?;
    let finished: Option<String> = row.get(8)?;
    Ok(Intent {
        workflow_id: row.get(0)?,
        repo_id: row.get(1)?,
        issue_id: row.get(2)?,
        agent: row.get(3)?,
        state: row.get(4)?,
        session_id: row.get(5)?,
        error: row.get(6)?,
        started_at: parse_ts(&started),
        finished_at: finished.map(|s| parse_ts(&s)),
    })
}

const INTENT_COLS: &str =
    "workflow_id, repo_id, issue_id, agent, state, session_id, error, started_at, finished_at";

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open sqlite db {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Repos ────────────────────────────────────────────────────────────

    pub fn upsert_repo(
        &self,
        owner: &str,
        name: &str,
        installation_id: i64,
        webhook_secret: &str,
        default_branch: &str,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO repos (owner, name, installation_id, webhook_secret, default_branch)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(owner, name) DO UPDATE SET
               installation_id = excluded.installation_id,
               webhook_secret = excluded.webhook_secret,
               default_branch = excluded.default_branch",
            params![owner, name, installation_id, webhook_secret, default_branch],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM repos WHERE owner = ?1 AND name = ?2",
            params![owner, name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_repo(&self, owner: &str, name: &str) -> Result<Option<RepoBinding>> {
        let conn = self.lock();
        let repo = conn
            .query_row(
                "SELECT id, owner, name, installation_id, webhook_secret, default_branch
                 FROM repos WHERE owner = ?1 AND name = ?2",
                params![owner, name],
                row_to_repo,
            )
            .optional()?;
        Ok(repo)
    }

    pub fn get_repo_by_installation(&self, installation_id: i64) -> Result<Option<RepoBinding>> {
        let conn = self.lock();
        let repo = conn
            .query_row(
                "SELECT id, owner, name, installation_id, webhook_secret, default_branch
                 FROM repos WHERE installation_id = ?1",
                params![installation_id],
                row_to_repo,
            )
            .optional()?;
        Ok(repo)
    }

    pub fn list_repos(&self) -> Result<Vec<RepoBinding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner, name, installation_id, webhook_secret, default_branch
             FROM repos ORDER BY owner, name",
        )?;
        let rows = stmt.query_map([], row_to_repo)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Issue mirror ─────────────────────────────────────────────────────

    pub fn mirror_upsert(&self, repo_id: i64, issue: &Issue) -> Result<()> {
        let record = serde_json::to_string(issue)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO issue_mirror (repo_id, issue_id, record, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repo_id, issue_id) DO UPDATE SET
               record = excluded.record, updated_at = excluded.updated_at",
            params![repo_id, issue.id, record, now_str()],
        )?;
        Ok(())
    }

    pub fn mirror_get(&self, repo_id: i64, issue_id: &str) -> Result<Option<Issue>> {
        let conn = self.lock();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM issue_mirror WHERE repo_id = ?1 AND issue_id = ?2",
                params![repo_id, issue_id],
                |row| row.get(0),
            )
            .optional()?;
        match record {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    pub fn mirror_find_by_forge_number(
        &self,
        repo_id: i64,
        number: i64,
    ) -> Result<Option<Issue>> {
        Ok(self
            .mirror_all(repo_id)?
            .into_values()
            .find(|i| i.forge_number == Some(number)))
    }

    pub fn mirror_all(&self, repo_id: i64) -> Result<BTreeMap<String, Issue>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT record FROM issue_mirror WHERE repo_id = ?1")?;
        let rows = stmt.query_map(params![repo_id], |row| row.get::<_, String>(0))?;
        let mut map = BTreeMap::new();
        for json in rows {
            let issue: Issue = serde_json::from_str(&json?)?;
            map.insert(issue.id.clone(), issue);
        }
        Ok(map)
    }

    pub fn mirror_delete(&self, repo_id: i64, issue_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM issue_mirror WHERE repo_id = ?1 AND issue_id = ?2",
            params![repo_id, issue_id],
        )?;
        Ok(())
    }

    pub fn mirror_count(&self, repo_id: i64) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM issue_mirror WHERE repo_id = ?1",
            params![repo_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Intents ──────────────────────────────────────────────────────────

    pub fn insert_intent(&self, intent: &Intent) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!("INSERT INTO intents ({INTENT_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            params![
                intent.workflow_id,
                intent.repo_id,
                intent.issue_id,
                intent.agent,
                intent.state,
                intent.session_id,
                intent.error,
                fmt_ts(intent.started_at),
                intent.finished_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_intent(&self, workflow_id: &str) -> Result<Option<Intent>> {
        let conn = self.lock();
        let intent = conn
            .query_row(
                &format!("SELECT {INTENT_COLS} FROM intents WHERE workflow_id = ?1"),
                params![workflow_id],
                row_to_intent,
            )
            .optional()?;
        Ok(intent)
    }

    pub fn running_intent_for_issue(&self, repo_id: i64, issue_id: &str) -> Result<Option<Intent>> {
        let conn = self.lock();
        let intent = conn
            .query_row(
                &format!(
                    "SELECT {INTENT_COLS} FROM intents
                     WHERE repo_id = ?1 AND issue_id = ?2 AND state = 'running'
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![repo_id, issue_id],
                row_to_intent,
            )
            .optional()?;
        Ok(intent)
    }

    pub fn list_running_intents(&self) -> Result<Vec<Intent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INTENT_COLS} FROM intents WHERE state = 'running' ORDER BY started_at"
        ))?;
        let rows = stmt.query_map([], row_to_intent)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_intent_state(&self, workflow_id: &str, state: &str, error: &str) -> Result<()> {
        let finished = matches!(state, "done" | "failed" | "cancelled");
        let conn = self.lock();
        conn.execute(
            "UPDATE intents SET state = ?2, error = ?3,
               finished_at = CASE WHEN ?4 THEN ?5 ELSE finished_at END
             WHERE workflow_id = ?1",
            params![workflow_id, state, error, finished, now_str()],
        )?;
        Ok(())
    }

    pub fn set_intent_session(&self, workflow_id: &str, session_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE intents SET session_id = ?2 WHERE workflow_id = ?1",
            params![workflow_id, session_id],
        )?;
        Ok(())
    }

    /// Restart recovery: workflows die with the process, so any intent
    /// still marked running at boot is failed with an explanatory error.
    pub fn abandon_running_intents(&self) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE intents SET state = 'failed', error = 'orchestrator restarted',
               finished_at = ?1
             WHERE state = 'running'",
            params![now_str()],
        )?;
        Ok(n)
    }

    // ── Sync state ───────────────────────────────────────────────────────

    pub fn get_sync_state(&self, repo_id: i64) -> Result<SyncSnapshot> {
        let conn = self.lock();
        let snapshot = conn
            .query_row(
                "SELECT state, error_count, last_success, last_commit_sha, issue_count, milestone_count
                 FROM sync_state WHERE repo_id = ?1",
                params![repo_id],
                |row| {
                    let last: Option<String> = row.get(2)?;
                    Ok(SyncSnapshot {
                        state: row.get(0)?,
                        error_count: row.get(1)?,
                        last_success: last.map(|s| parse_ts(&s)),
                        last_commit_sha: row.get(3)?,
                        issue_count: row.get(4)?,
                        milestone_count: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot.unwrap_or_default())
    }

    pub fn put_sync_state(&self, repo_id: i64, snapshot: &SyncSnapshot) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_state
               (repo_id, state, error_count, last_success, last_commit_sha, issue_count, milestone_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(repo_id) DO UPDATE SET
               state = excluded.state,
               error_count = excluded.error_count,
               last_success = excluded.last_success,
               last_commit_sha = excluded.last_commit_sha,
               issue_count = excluded.issue_count,
               milestone_count = excluded.milestone_count",
            params![
                repo_id,
                snapshot.state,
                snapshot.error_count,
                snapshot.last_success.map(fmt_ts),
                snapshot.last_commit_sha,
                snapshot.issue_count,
                snapshot.milestone_count,
            ],
        )?;
        Ok(())
    }

    pub fn reset_sync(&self, repo_id: i64) -> Result<()> {
        self.put_sync_state(repo_id, &SyncSnapshot::default())
    }

    pub fn append_sync_log(&self, repo_id: i64, source: &str, action: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_log (repo_id, source, action, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![repo_id, source, action, now_str()],
        )?;
        Ok(())
    }

    pub fn recent_syncs(&self, repo_id: i64, limit: i64) -> Result<Vec<SyncLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT source, action, created_at FROM sync_log
             WHERE repo_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![repo_id, limit], |row| {
            let created: String = row.get(2)?;
            Ok(SyncLogEntry {
                source: row.get(0)?,
                action: row.get(1)?,
                created_at: parse_ts(&created),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Keep only the newest `keep` log rows per repo.
    pub fn prune_sync_log(&self, repo_id: i64, keep: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM sync_log WHERE repo_id = ?1 AND id NOT IN
               (SELECT id FROM sync_log WHERE repo_id = ?1 ORDER BY id DESC LIMIT ?2)",
            params![repo_id, keep],
        )?;
        Ok(())
    }

    // ── PR records ───────────────────────────────────────────────────────

    pub fn get_pr_json(&self, repo_id: i64, number: i64) -> Result<Option<String>> {
        let conn = self.lock();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM pr_records WHERE repo_id = ?1 AND number = ?2",
                params![repo_id, number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(record)
    }

    pub fn put_pr_json(&self, repo_id: i64, number: i64, record: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pr_records (repo_id, number, record, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repo_id, number) DO UPDATE SET
               record = excluded.record, updated_at = excluded.updated_at",
            params![repo_id, number, record, now_str()],
        )?;
        Ok(())
    }

    pub fn has_pr_delivery(&self, repo_id: i64, number: i64, delivery_id: &str) -> Result<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM pr_deliveries
                 WHERE repo_id = ?1 AND number = ?2 AND delivery_id = ?3",
                params![repo_id, number, delivery_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn record_pr_delivery(&self, repo_id: i64, number: i64, delivery_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO pr_deliveries (repo_id, number, delivery_id, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![repo_id, number, delivery_id, now_str()],
        )?;
        Ok(())
    }

    // ── Config KV ────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
