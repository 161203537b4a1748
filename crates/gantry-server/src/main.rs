mod routes;
mod webhook;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use gantry_core::config::Config;
use gantry_core::db::Db;
use gantry_core::dispatch::Dispatcher;
use gantry_core::forge::Forge;
use gantry_core::pr::PrMachine;
use gantry_core::router::Router as EventRouter;
use gantry_core::sync::SyncManager;
use gantry_forge::GithubClient;
use gantry_sandbox::{RegistrySandboxRunner, Sandbox, SessionRegistry};

use webhook::IdempotencyCache;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub sync: Arc<SyncManager>,
    pub prs: Arc<PrMachine>,
    pub forge: Arc<dyn Forge>,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Arc<EventRouter>,
    pub idempotency: IdempotencyCache,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "gantry_server=info,gantry_core=info,gantry_sandbox=info,gantry_forge=info,tower_http=warn"
            .into()
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(&config.data_dir)?;

    let db_path = format!("{}/gantry.db", config.data_dir);
    let db = Arc::new(Db::open(&db_path)?);
    db.migrate()?;

    // Workflows die with the process; fail over any intents left running.
    match db.abandon_running_intents() {
        Ok(0) => {}
        Ok(n) => info!("restart recovery: {n} running intents marked failed"),
        Err(e) => error!("abandon_running_intents failed: {e}"),
    }

    // Seed repository bindings from config.
    for seed in &config.repo_seeds {
        if let Err(e) = db.upsert_repo(
            &seed.owner,
            &seed.name,
            seed.installation_id,
            &seed.webhook_secret,
            &seed.default_branch,
        ) {
            error!("upsert_repo {}/{}: {e}", seed.owner, seed.name);
        }
    }

    // Sandbox backend and session registry. The injected env set reaches
    // every spawn in every session; values never hit logs.
    let sandbox_mode = Sandbox::detect(&config.sandbox_backend).await;
    let mut inject = Vec::new();
    if !config.agent_credential.is_empty() {
        inject.push(("AGENT_CREDENTIAL".to_string(), config.agent_credential.clone()));
    }
    if !config.github_token.is_empty() {
        inject.push(("GITHUB_TOKEN".to_string(), config.github_token.clone()));
    }
    let sessions = SessionRegistry::new(
        &config.data_dir,
        config.session_ttl_s,
        config.max_sessions,
        sandbox_mode,
        &config.container_image,
        inject,
        config.command_timeout_s,
        config.term_grace_ms,
    );

    let forge: Arc<dyn Forge> = Arc::new(GithubClient::new(
        &config.github_api_base,
        &config.github_token,
        &config.github_app_jwt,
    ));
    let runner = RegistrySandboxRunner::new(Arc::clone(&sessions), config.term_grace_ms);

    let sync = SyncManager::new(Arc::clone(&db), Arc::clone(&config), Arc::clone(&forge));
    let dispatcher = Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&config),
        Arc::clone(&forge),
        runner,
    );
    sync.set_dispatcher(Arc::clone(&dispatcher));

    let prs = PrMachine::new(Arc::clone(&db));
    let router = EventRouter::new(
        Arc::clone(&db),
        Arc::clone(&config),
        Some(Arc::clone(&dispatcher)),
        Some(Arc::clone(&sync)),
    );

    // Session TTL sweeper.
    {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                let reaped = sessions.sweep_expired().await;
                if reaped > 0 {
                    info!(reaped, "expired sandbox sessions reaped");
                }
            }
        });
    }

    // Scheduled router ticks — inner spawn catches panics so the loop
    // never dies.
    spawn_tick_loop(
        "daily summary",
        config.daily_tick_s,
        Arc::clone(&db),
        Arc::clone(&router),
        |router, repo| router.run_daily(&repo).map(|_| ()),
    );
    spawn_tick_loop(
        "weekly planning",
        config.weekly_tick_s,
        Arc::clone(&db),
        Arc::clone(&router),
        |router, repo| router.run_weekly(&repo).map(|_| ()),
    );

    let state = Arc::new(AppState {
        db,
        config: Arc::clone(&config),
        sessions,
        sync,
        prs,
        forge,
        dispatcher,
        router,
        idempotency: IdempotencyCache::new(config.idempotency_cache_size),
        start_time: Instant::now(),
    });

    let app = Router::new()
        // Webhook gateway
        .route("/webhook/github", post(webhook::github_webhook))
        // Health
        .route("/api/health", get(routes::health))
        // Repos
        .route("/api/repos", get(routes::list_repos))
        .route("/api/repos/:owner/:name/status", get(routes::repo_status))
        .route("/api/repos/:owner/:name/sync/issues", post(routes::sync_issues))
        .route("/api/repos/:owner/:name/sync/reset", post(routes::sync_reset))
        // Sandbox sessions
        .route("/api/sandbox/sessions", post(routes::create_session))
        .route("/api/sandbox/sessions/:id", get(routes::get_session))
        .route("/api/sandbox/sessions/:id", delete(routes::delete_session))
        .route("/api/sandbox/sessions/:id/ws", get(routes::ws_session))
        // Workflow dispatch
        .route("/api/workflows/assign", post(routes::assign_workflow))
        // PR wrappers
        .route("/api/pr/create", post(routes::pr_create))
        .route("/api/pr/review", post(routes::pr_review))
        .route("/api/pr/merge", post(routes::pr_merge))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_tick_loop<F>(
    what: &'static str,
    interval_s: u64,
    db: Arc<Db>,
    router: Arc<EventRouter>,
    tick: F,
) where
    F: Fn(&EventRouter, gantry_core::forge::RepoBinding) -> anyhow::Result<()>
        + Send
        + Sync
        + Copy
        + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(interval_s.max(60))).await;
            let repos = match db.list_repos() {
                Ok(repos) => repos,
                Err(e) => {
                    error!("{what}: repo listing failed: {e}");
                    continue;
                }
            };
            for repo in repos {
                let router = Arc::clone(&router);
                let handle = tokio::spawn(async move { tick(&router, repo) });
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("{what} tick error: {e}"),
                    Err(join_err) => error!("{what} tick panicked: {join_err}"),
                }
            }
        }
    });
}
