// Vigil Guard — hashrate deviation tracking and blacklist enforcement
//
// Core: DeviationTracker pass loop, classifier thresholds, blacklist enforcement
// Edges: Redis state store, market JSON-RPC client, pool stats watcher, admin API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use vigil_guard::config::Config;
use vigil_guard::enforcer::BlacklistEnforcer;
use vigil_guard::market::MarketRpcClient;
use vigil_guard::metrics::prometheus as metrics;
use vigil_guard::sampling::PoolStatsWatcher;
use vigil_guard::store::{BlacklistStore, RedisGuardStore, WorkerStore};
use vigil_guard::tracker::DeviationTracker;

#[derive(Clone)]
struct ApiState {
    store: Arc<RedisGuardStore>,
    cfg: Config,
    start_time: i64,
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let redis_ok = state.store.ping().await.is_ok();
    Json(json!({"status": "ok", "redis": redis_ok}))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn api_guard_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let tracked = state.store.list_tracked().await.map(|w| w.len()).unwrap_or(0);
    Json(json!({
        "name": "Vigil Guard",
        "uptime_secs": Utc::now().timestamp() - state.start_time,
        "tracked_workers": tracked,
        "sensitivity": {
            "worker_limit_change_percent": state.cfg.sensitivity.worker_limit_change_percent,
            "bad_workers_percent": state.cfg.sensitivity.bad_workers_percent,
            "steady_phase_iterations": state.cfg.sensitivity.steady_phase_iterations,
        },
        "track_interval_secs": state.cfg.track_interval_secs,
    }))
}

async fn api_workers(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match state.store.list_tracked().await {
        Ok(workers) => Json(json!({"ok": true, "workers": workers})),
        Err(e) => Json(json!({"ok": false, "error": e.to_string()})),
    }
}

async fn api_worker(
    Path(deal_id): Path<i64>,
    State(state): State<ApiState>,
) -> Json<serde_json::Value> {
    match state.store.get_worker(deal_id).await {
        Ok(Some(worker)) => Json(json!({"ok": true, "worker": worker})),
        Ok(None) => Json(json!({"ok": false, "error": "not tracked"})),
        Err(e) => Json(json!({"ok": false, "error": e.to_string()})),
    }
}

async fn api_register_worker(
    Path(deal_id): Path<i64>,
    State(state): State<ApiState>,
) -> Json<serde_json::Value> {
    match state.store.register_worker(deal_id).await {
        Ok(()) => {
            tracing::info!("deal {} entered under monitoring", deal_id);
            Json(json!({"ok": true, "deal_id": deal_id}))
        }
        Err(e) => Json(json!({"ok": false, "error": e.to_string()})),
    }
}

async fn api_operator_blacklist(
    Path(operator_id): Path<String>,
    State(state): State<ApiState>,
) -> Json<serde_json::Value> {
    match state.store.records_by_operator(&operator_id).await {
        Ok(records) => Json(json!({"ok": true, "records": records})),
        Err(e) => Json(json!({"ok": false, "error": e.to_string()})),
    }
}

// ─── Main ───

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    println!("🛡️ Vigil Guard v0.6.2 — hashrate deviation tracking");
    let cfg = Config::load();

    let store = Arc::new(
        RedisGuardStore::new(&cfg.redis_url).expect("Failed to create Redis store"),
    );
    let market = Arc::new(MarketRpcClient::new(cfg.market_rpc_url.clone(), None));
    let watcher = Arc::new(
        PoolStatsWatcher::new(cfg.pool_stats_url.clone())
            .expect("Failed to create pool stats watcher"),
    );

    let enforcer = BlacklistEnforcer::new(
        market.clone(),
        market.clone(),
        store.clone(),
        store.clone(),
        cfg.sensitivity,
    );
    let tracker = Arc::new(DeviationTracker::new(
        store.clone(),
        market.clone(),
        watcher.clone(),
        enforcer,
        cfg.sensitivity,
        cfg.pool_address.clone(),
    ));

    // Tracking pass loop
    {
        let tracker = tracker.clone();
        let interval_secs = cfg.track_interval_secs;
        let deadline = Duration::from_secs(cfg.pass_deadline_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                metrics::inc_passes();
                tracing::info!("starting hashrate tracking pass");
                // Iteration counters are persisted before each evaluation,
                // so cutting a pass off at the deadline leaves no partial state.
                match tokio::time::timeout(deadline, tracker.run()).await {
                    Ok(Ok(())) => tracing::info!("tracking pass finished"),
                    Ok(Err(e)) => {
                        metrics::inc_pass_errors();
                        tracing::error!("tracking pass failed: {:#}", e);
                    }
                    Err(_) => {
                        metrics::inc_pass_errors();
                        tracing::error!(
                            "tracking pass deadline exceeded after {}s, remaining workers deferred",
                            deadline.as_secs()
                        );
                    }
                }
            }
        });
    }

    // Background redis health sampler
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let redis_ok = store.ping().await.is_ok();
                metrics::set_redis_up(redis_ok);
            }
        });
    }

    let api_state = ApiState {
        store: store.clone(),
        cfg: cfg.clone(),
        start_time: Utc::now().timestamp(),
    };

    let api = axum::Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .route("/api/v1/guard/status", get(api_guard_status))
        .route("/api/v1/workers", get(api_workers))
        .route("/api/v1/worker/:deal_id", get(api_worker))
        .route("/api/v1/worker/:deal_id/register", post(api_register_worker))
        .route("/api/v1/blacklist/:operator_id", get(api_operator_blacklist))
        .with_state(api_state);

    let listener = tokio::net::TcpListener::bind(&cfg.api_listen).await.unwrap();

    // Graceful shutdown (cross-platform: ctrl_c + SIGTERM on Unix)
    let shutdown_signal = async {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM handler");
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM — shutting down"),
                _ = ctrl_c => tracing::info!("SIGINT — shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            // Windows: only ctrl_c is supported
            tokio::signal::ctrl_c().await.expect("Failed to register Ctrl+C handler");
            tracing::info!("Ctrl+C — shutting down");
        }
    };

    tracing::info!("📡 Vigil Guard API listening on {}", cfg.api_listen);
    tracing::info!(
        "👁️ Tracking every {}s: soft limit {}%, operator ratio {}%, steady phase after {} passes",
        cfg.track_interval_secs,
        cfg.sensitivity.worker_limit_change_percent,
        cfg.sensitivity.bad_workers_percent,
        cfg.sensitivity.steady_phase_iterations,
    );
    axum::serve(listener, api)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .unwrap();

    tracing::info!("🏁 Vigil Guard shut down cleanly");
}
