use std::collections::HashMap;

use anyhow::Result;

use crate::reconcile::Policy;
use crate::registry::AgentRegistry;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Web server
    pub web_bind: String,
    pub web_port: u16,

    // Forge
    pub github_api_base: String,
    /// Static token fallback when no app JWT is configured.
    pub github_token: String,
    /// Pre-signed GitHub App JWT used to mint installation tokens.
    pub github_app_jwt: String,

    // Repository seeds: "owner/name:installation_id:webhook_secret[:default_branch]|..."
    pub repo_seeds: Vec<RepoSeed>,

    // Issue store
    pub beads_dir: String,
    pub backlog_file: String,
    pub roadmap_file: String,
    pub sync_policy: Policy,
    pub push_retries: u32,
    pub sync_backoff_base_ms: u64,
    pub sync_backoff_max_attempts: u32,
    pub sync_log_keep: i64,
    /// Auto-add `#key` body references as dependencies (default: suggest only).
    pub auto_add_deps: bool,

    // Agents
    pub registry: AgentRegistry,
    /// Coding-agent binary spawned inside the sandbox.
    pub agent_cmd: String,
    /// Credential for the code-writing LLM, injected into every spawn.
    pub agent_credential: String,

    // Sandbox sessions
    pub session_ttl_s: i64,
    pub max_sessions: usize,
    pub sandbox_backend: String,
    pub container_image: String,
    pub command_timeout_s: u64,
    pub term_grace_ms: u64,

    // Workflow
    pub workflow_timeout_s: u64,

    // Webhook gateway
    pub idempotency_cache_size: usize,

    // Event router
    pub daily_tick_s: u64,
    pub weekly_tick_s: u64,
    /// Blocking an issue cancels its in-flight workflow (not just future
    /// assignments).
    pub cancel_in_flight: bool,

    // Git attribution
    pub git_author_name: String,
    pub git_author_email: String,
}

#[derive(Debug, Clone)]
pub struct RepoSeed {
    pub owner: String,
    pub name: String,
    pub installation_id: i64,
    pub webhook_secret: String,
    pub default_branch: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_repo_seeds(raw: &str) -> Vec<RepoSeed> {
    let mut seeds = Vec::new();
    for entry in raw.split('|') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.splitn(4, ':').collect();
        let Some((owner, name)) = parts.first().and_then(|p| p.split_once('/')) else {
            continue;
        };
        let installation_id = parts
            .get(1)
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        let webhook_secret = parts.get(2).copied().unwrap_or("").to_string();
        let default_branch = parts
            .get(3)
            .filter(|p| !p.is_empty())
            .copied()
            .unwrap_or("main")
            .to_string();
        seeds.push(RepoSeed {
            owner: owner.to_string(),
            name: name.to_string(),
            installation_id,
            webhook_secret,
            default_branch,
        });
    }
    seeds
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let registry = AgentRegistry::parse(
            &get_str("AGENTS", &dotenv, ""),
            &get_str("HUMANS", &dotenv, ""),
            &get_str("REVIEWER_TRIGGERS", &dotenv, ""),
        );

        Ok(Config {
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3141),
            github_api_base: get_str("GITHUB_API_BASE", &dotenv, "https://api.github.com"),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            github_app_jwt: get_str("GITHUB_APP_JWT", &dotenv, ""),
            repo_seeds: parse_repo_seeds(&get_str("REPOS", &dotenv, "")),
            beads_dir: get_str("BEADS_DIR", &dotenv, ".beads"),
            backlog_file: get_str("BACKLOG_FILE", &dotenv, "TODO.md"),
            roadmap_file: get_str("ROADMAP_FILE", &dotenv, "ROADMAP.md"),
            sync_policy: Policy::parse(&get_str("SYNC_POLICY", &dotenv, "newest-wins")),
            push_retries: get_u32("PUSH_RETRIES", &dotenv, 3),
            sync_backoff_base_ms: get_u64("SYNC_BACKOFF_BASE_MS", &dotenv, 500),
            sync_backoff_max_attempts: get_u32("SYNC_BACKOFF_MAX_ATTEMPTS", &dotenv, 5),
            sync_log_keep: get_i64("SYNC_LOG_KEEP", &dotenv, 200),
            auto_add_deps: get_bool("AUTO_ADD_DEPS", &dotenv, false),
            registry,
            agent_cmd: get_str("AGENT_CMD", &dotenv, "claude"),
            agent_credential: get_str("AGENT_CREDENTIAL", &dotenv, ""),
            session_ttl_s: get_i64("SESSION_TTL_S", &dotenv, 900),
            max_sessions: get_usize("MAX_SESSIONS", &dotenv, 8),
            sandbox_backend: get_str("SANDBOX_BACKEND", &dotenv, "auto"),
            container_image: get_str("CONTAINER_IMAGE", &dotenv, "gantry-agent"),
            command_timeout_s: get_u64("COMMAND_TIMEOUT_S", &dotenv, 600),
            term_grace_ms: get_u64("TERM_GRACE_MS", &dotenv, 3000),
            workflow_timeout_s: get_u64("WORKFLOW_TIMEOUT_S", &dotenv, 3600),
            idempotency_cache_size: get_usize("IDEMPOTENCY_CACHE_SIZE", &dotenv, 1024),
            daily_tick_s: get_u64("DAILY_TICK_S", &dotenv, 86_400),
            weekly_tick_s: get_u64("WEEKLY_TICK_S", &dotenv, 604_800),
            cancel_in_flight: get_bool("ROUTER_CANCEL_IN_FLIGHT", &dotenv, true),
            git_author_name: get_str("GIT_AUTHOR_NAME", &dotenv, "gantry"),
            git_author_email: get_str("GIT_AUTHOR_EMAIL", &dotenv, "gantry@localhost"),
        })
    }

    /// Secret values that must never appear in logs or captured output.
    pub fn secret_values(&self) -> Vec<String> {
        let mut secrets = vec![self.github_token.clone(), self.agent_credential.clone()];
        secrets.extend(self.repo_seeds.iter().map(|s| s.webhook_secret.clone()));
        secrets.retain(|s| !s.is_empty());
        secrets
    }
}
