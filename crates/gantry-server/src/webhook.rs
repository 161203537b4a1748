//! Webhook gateway: the entry point for all forge-originated events.
//!
//! Signature verification runs over the exact raw body bytes with the
//! installation's secret, compared in constant time. The per-installation
//! secret means the body is parsed just far enough to find the
//! installation id before the MAC check; nothing else happens until the
//! signature holds.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use gantry_core::error::GantryError;
use gantry_core::forge::RepoBinding;
use gantry_core::pr::{PrEvent, ReviewState};
use gantry_core::sync::{SyncKind, SyncRequest};

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

// ── Signature verification ───────────────────────────────────────────────

/// Verify `X-Hub-Signature-256: sha256=<hex>` over the raw body.
///
/// Missing, malformed, or mismatching signatures are all the same stable
/// error kind; `Mac::verify_slice` compares in constant time.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), GantryError> {
    let header = header.ok_or(GantryError::SignatureInvalid)?;
    let hex_mac = header
        .strip_prefix("sha256=")
        .ok_or(GantryError::SignatureInvalid)?;
    let expected = hex::decode(hex_mac).map_err(|_| GantryError::SignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GantryError::SignatureInvalid)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| GantryError::SignatureInvalid)
}

/// Compute the header value for a body (test and client helper).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"-").expect("hmac accepts any key size"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ── Idempotency cache ────────────────────────────────────────────────────

/// Bounded delivery-id cache: a set for membership plus a ring for
/// eviction order.
pub struct IdempotencyCache {
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
    cap: usize,
}

impl IdempotencyCache {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
            cap: cap.max(1),
        }
    }

    /// True when the key is new; false for a repeat delivery.
    pub fn insert(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (set, ring) = &mut *guard;
        if !set.insert(key.to_string()) {
            return false;
        }
        ring.push_back(key.to_string());
        while ring.len() > self.cap {
            if let Some(evicted) = ring.pop_front() {
                set.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.0.contains(key)
    }
}

// ── Push categorization ──────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PushCounts {
    pub issues: usize,
    pub files: usize,
    pub milestones: usize,
}

/// Walk `commits[].added/modified/removed` and count paths per category.
pub fn categorize_push(
    payload: &Value,
    beads_dir: &str,
    backlog_file: &str,
    roadmap_file: &str,
) -> PushCounts {
    let mut counts = PushCounts::default();
    let beads_prefix = format!("{}/", beads_dir.trim_end_matches('/'));
    let commits = payload["commits"].as_array().cloned().unwrap_or_default();
    for commit in &commits {
        for list in ["added", "modified", "removed"] {
            for path in commit[list].as_array().into_iter().flatten() {
                let Some(path) = path.as_str() else { continue };
                if path.starts_with(&beads_prefix) {
                    counts.issues += 1;
                } else if path == backlog_file {
                    counts.files += 1;
                } else if path == roadmap_file {
                    counts.milestones += 1;
                }
            }
        }
    }
    counts
}

// ── Event mapping ────────────────────────────────────────────────────────

fn ts_or_now(v: &Value) -> DateTime<Utc> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn str_of<'a>(v: &'a Value, fallback: &'a str) -> &'a str {
    v.as_str().unwrap_or(fallback)
}

// ── Handler ──────────────────────────────────────────────────────────────

fn failure(err: &GantryError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    (
        status,
        Json(json!({ "ok": false, "error": err.kind(), "message": err.to_string() })),
    )
}

pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let delivery = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());

    // A missing or malformed signature header never reaches the parser.
    let Some(signature) = signature else {
        return failure(&GantryError::SignatureInvalid);
    };
    if !signature.starts_with("sha256=") {
        return failure(&GantryError::SignatureInvalid);
    }

    // Parse just far enough to resolve the installation's secret.
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return failure(&GantryError::MalformedPayload(e.to_string())),
    };
    let installation_id = payload["installation"]["id"].as_i64().unwrap_or(0);
    let repo = match state.db.get_repo_by_installation(installation_id) {
        Ok(Some(repo)) => repo,
        Ok(None) => {
            return failure(&GantryError::UnknownInstallation(installation_id.to_string()))
        }
        Err(e) => {
            warn!("installation lookup failed: {e}");
            return failure(&GantryError::Transient("installation lookup".into()));
        }
    };

    if let Err(e) = verify_signature(&repo.webhook_secret, &body, Some(signature)) {
        return failure(&e);
    }

    // Duplicate deliveries produce no further side effects.
    if !delivery.is_empty() && state.idempotency.contains(&delivery) {
        return (StatusCode::OK, Json(json!({ "ok": true, "duplicate": true })));
    }

    let result = dispatch_event(&state, &repo, &event, &delivery, &payload).await;
    match result {
        Ok(response) => {
            if !delivery.is_empty() {
                state.idempotency.insert(&delivery);
            }
            (StatusCode::OK, Json(response))
        }
        Err(e) => match e.downcast_ref::<GantryError>() {
            Some(kind) => failure(&kind.clone()),
            None => {
                warn!(event, "webhook dispatch failed: {e:#}");
                failure(&GantryError::Transient("dispatch failed".into()))
            }
        },
    }
}

async fn dispatch_event(
    state: &Arc<AppState>,
    repo: &RepoBinding,
    event: &str,
    delivery: &str,
    payload: &Value,
) -> anyhow::Result<Value> {
    match event {
        "push" => {
            let counts = categorize_push(
                payload,
                &state.config.beads_dir,
                &state.config.backlog_file,
                &state.config.roadmap_file,
            );
            if counts.issues > 0 {
                state
                    .sync
                    .enqueue(repo, SyncRequest::new(SyncKind::Issues, "webhook"))
                    .await;
            }
            if counts.files > 0 {
                state
                    .sync
                    .enqueue(repo, SyncRequest::new(SyncKind::Backlog, "webhook"))
                    .await;
            }
            if counts.milestones > 0 {
                state
                    .sync
                    .enqueue(repo, SyncRequest::new(SyncKind::Milestones, "webhook"))
                    .await;
            }
            Ok(json!({ "ok": true, "enqueued": counts }))
        }
        "issues" => {
            let action = str_of(&payload["action"], "");
            state
                .sync
                .enqueue(repo, SyncRequest::new(SyncKind::Issues, "webhook"))
                .await;
            if action == "assigned" {
                let number = payload["issue"]["number"].as_i64().unwrap_or(0);
                let assignee = str_of(&payload["assignee"]["login"], "");
                if let Some(local) = state.db.mirror_find_by_forge_number(repo.id, number)? {
                    let outcome = state.dispatcher.assign(repo, &local.id, assignee).await?;
                    return Ok(json!({ "ok": true, "dispatch": outcome }));
                }
            }
            Ok(json!({ "ok": true }))
        }
        "pull_request" => {
            let action = str_of(&payload["action"], "");
            let number = payload["pull_request"]["number"]
                .as_i64()
                .or_else(|| payload["number"].as_i64())
                .unwrap_or(0);
            let pr = &payload["pull_request"];
            let at = ts_or_now(&pr["updated_at"]);
            let event = match action {
                "opened" => Some(PrEvent::Opened {
                    head_ref: str_of(&pr["head"]["ref"], "").to_string(),
                    base_ref: str_of(&pr["base"]["ref"], "").to_string(),
                    author: str_of(&pr["user"]["login"], "").to_string(),
                    body: str_of(&pr["body"], "").to_string(),
                    reviewers: state.config.registry.reviewers_for("pull_request.opened"),
                    at,
                }),
                "reopened" => Some(PrEvent::Reopened { at }),
                "synchronize" => Some(PrEvent::Synchronize { at }),
                "closed" => Some(PrEvent::Closed {
                    merged: pr["merged"].as_bool().unwrap_or(false),
                    at,
                }),
                _ => None,
            };
            let Some(event) = event else {
                return Ok(json!({ "ok": true, "ignored": action }));
            };
            let merged = matches!(&event, PrEvent::Closed { merged: true, .. });
            let (record, effects) = state.prs.handle(repo.id, number, delivery, event).await?;
            for reviewer in &effects.dispatch_reviewers {
                info!(pr = number, %reviewer, "reviewer session dispatch requested");
            }
            if merged && !effects.close_issue_keys.is_empty() {
                state.router.on_pr_merged(repo, &record.body).await?;
                state
                    .sync
                    .enqueue(repo, SyncRequest::new(SyncKind::Issues, "webhook"))
                    .await;
            }
            Ok(json!({ "ok": true, "state": record.state }))
        }
        "pull_request_review" => {
            let action = str_of(&payload["action"], "");
            if action != "submitted" {
                return Ok(json!({ "ok": true, "ignored": action }));
            }
            let number = payload["pull_request"]["number"].as_i64().unwrap_or(0);
            let review = &payload["review"];
            let review_state = match str_of(&review["state"], "").to_ascii_lowercase().as_str() {
                "approved" => ReviewState::Approved,
                "changes_requested" => ReviewState::ChangesRequested,
                _ => ReviewState::Commented,
            };
            let event = PrEvent::Review {
                reviewer: str_of(&review["user"]["login"], "").to_string(),
                state: review_state,
                body: str_of(&review["body"], "").to_string(),
                at: ts_or_now(&review["submitted_at"]),
            };
            let (record, effects) = state.prs.handle(repo.id, number, delivery, event).await?;
            for reviewer in &effects.dispatch_reviewers {
                info!(pr = number, %reviewer, "escalated reviewer dispatch requested");
            }
            Ok(json!({ "ok": true, "state": record.state }))
        }
        "issue_comment" | "installation" | "milestone" => {
            info!(event, "acknowledged");
            Ok(json!({ "ok": true }))
        }
        other => {
            info!(event = other, "unhandled event type");
            Ok(json!({ "ok": true, "ignored": other }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"zen":"ok"}"#;
        let header = sign("hush", body);
        assert!(verify_signature("hush", body, Some(&header)).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let body = br#"{"zen":"ok"}"#;
        let header = sign("hush", body);
        let mut tampered = body.to_vec();
        tampered[2] ^= 1;
        assert_eq!(
            verify_signature("hush", &tampered, Some(&header)),
            Err(GantryError::SignatureInvalid)
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let header = sign("right", body);
        assert!(verify_signature("wrong", body, Some(&header)).is_err());
    }

    #[test]
    fn missing_or_malformed_header_fails() {
        assert!(verify_signature("s", b"x", None).is_err());
        assert!(verify_signature("s", b"x", Some("sha1=abcd")).is_err());
        assert!(verify_signature("s", b"x", Some("sha256=nothex")).is_err());
        assert!(verify_signature("s", b"x", Some("")).is_err());
    }

    #[test]
    fn idempotency_cache_dedupes_and_evicts() {
        let cache = IdempotencyCache::new(2);
        assert!(cache.insert("a"));
        assert!(!cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(cache.insert("c"));
        // "a" evicted by the bound.
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn push_categorization_counts_independently() {
        let payload = json!({
            "commits": [
                {
                    "added": [".beads/issues.jsonl", "src/lib.rs"],
                    "modified": ["TODO.md"],
                    "removed": []
                },
                {
                    "added": [],
                    "modified": [".beads/issues.jsonl", "ROADMAP.md"],
                    "removed": ["TODO.md"]
                }
            ]
        });
        let counts = categorize_push(&payload, ".beads", "TODO.md", "ROADMAP.md");
        assert_eq!(counts.issues, 2);
        assert_eq!(counts.files, 2);
        assert_eq!(counts.milestones, 1);
    }

    #[test]
    fn push_categorization_handles_missing_commits() {
        let counts = categorize_push(&json!({}), ".beads", "TODO.md", "ROADMAP.md");
        assert_eq!(counts, PushCounts::default());
    }
}
