//! Command-line interface and server bootstrap.
//!
//! Parses CLI flags, loads configuration, builds the shared [`AppState`],
//! schedules one cache-refresh job per declared cache (generalizing the
//! teacher's per-module scheduling to per-cache), and serves the combined
//! REST + MCP + management router until `Ctrl+C`.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, instrument, warn};

use crate::auth::JwksCache;
use crate::cache::{parse_duration_string, CacheEngine};
use crate::config::load_config_from_path;
use crate::errors::{ApitapError, Result};
use crate::log::{init_tracing_with, LogHandle};
use crate::mcp::McpSessionLayer;
use crate::server::{build_router, AppState};
use crate::sqlengine::SqlEngine;

/// Command-line interface for the flapi server.
#[derive(Parser, Debug)]
#[command(
    name = "flapi",
    version,
    about = "Turns YAML-declared SQL templates into live REST + MCP APIs.",
    long_about = "Turns YAML-declared SQL templates into live REST + MCP APIs over an embedded DataFusion engine.\n\n\
Resources:\n  • flapi.yaml: project-wide connections, auth, and response-format config\n  • endpoints/*.yaml: one file per REST or MCP endpoint, each pointing at a SQL template"
)]
pub struct Cli {
    /// Path to the root project configuration file.
    #[arg(long = "config", short = 'c', value_name = "FILE", default_value = "flapi.yaml")]
    pub config: String,

    /// Set log level (overrides env vars like RUST_LOG / FLAPI_LOG_LEVEL).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Emit logs in JSON format.
    #[arg(long = "log-json")]
    pub log_json: bool,

    /// Port the REST + management API is served on.
    #[arg(long = "port", default_value_t = 8080)]
    pub port: u16,

    /// Port the MCP JSON-RPC transport is served on, if different from `--port`.
    #[arg(long = "mcp-port")]
    pub mcp_port: Option<u16>,

    /// TLS certificate (PEM). Requires `--key`. Accepted for forward
    /// compatibility; see DESIGN.md for the current scope of TLS support.
    #[arg(long = "cert", requires = "key")]
    pub cert: Option<String>,

    /// TLS private key (PEM). Requires `--cert`.
    #[arg(long = "key", requires = "cert")]
    pub key: Option<String>,

    /// URL of a remote config service to poll for `flapi.yaml` updates.
    #[arg(long = "config-service")]
    pub config_service: Option<String>,

    /// Bearer token used when polling `--config-service`.
    #[arg(long = "config-service-token", env = "FLAPI_CONFIG_SERVICE_TOKEN", hide_env_values = true)]
    pub config_service_token: Option<String>,
}

/// Builds the shared process state: loads `Config`, attaches the cache
/// catalog, and prepares per-OIDC-provider JWKS caches.
async fn build_state(cli: &Cli, log_handle: LogHandle) -> Result<Arc<AppState>> {
    let config = load_config_from_path(&cli.config)?;
    info!(project = %config.project_name, endpoints = config.endpoints.len(), "configuration loaded");

    let engine = SqlEngine::new();
    let cache_engine = Arc::new(CacheEngine::new(engine.clone(), crate::sqlengine::CACHE_CATALOG));
    cache_engine.ensure_catalog().await?;

    let mut jwks = HashMap::new();
    for provider in &config.auth.oidc {
        jwks.insert(
            provider.issuer.clone(),
            Arc::new(JwksCache::new(reqwest::Client::new())),
        );
    }

    Ok(Arc::new(AppState {
        config: tokio::sync::RwLock::new(Arc::new(config)),
        engine,
        cache_engine,
        mcp: Arc::new(McpSessionLayer::new()),
        log_handle,
        jwks,
        config_path: std::path::PathBuf::from(&cli.config),
    }))
}

/// Schedules one async job per declared cache, generalizing the teacher's
/// `process_template`/per-module scheduling to per-cache triggers.
async fn schedule_cache_refreshes(state: &Arc<AppState>, scheduler: &mut JobScheduler) -> Result<()> {
    let config = state.current_config().await;
    for endpoint in &config.endpoints {
        let Some(cache) = endpoint.raw.cache.clone() else {
            continue;
        };
        let cache_id = format!("{}.{}", cache.catalog, cache.table);
        let Some(conn_name) = endpoint.raw.connection_names.first().cloned() else {
            warn!(cache_id, "cache declared without a connection, skipping schedule");
            continue;
        };
        let template_path = endpoint.source_template_dir.join(&cache.template_file);
        let cron_expr = to_cron_expression(&cache.schedule);

        let state = state.clone();
        let cache_id_for_job = cache_id.clone();
        scheduler
            .add(Job::new_async(cron_expr.as_str(), move |_uuid, _l| {
                let state = state.clone();
                let cache = cache.clone();
                let cache_id = cache_id_for_job.clone();
                let conn_name = conn_name.clone();
                let template_path = template_path.clone();
                Box::pin(async move {
                    let config = state.current_config().await;
                    let Some(conn) = config.connection(&conn_name) else {
                        warn!(cache_id, conn_name, "connection vanished since schedule, skipping run");
                        return;
                    };
                    let template_text = match std::fs::read_to_string(&template_path) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(cache_id, error = %e, "failed to read cache template");
                            return;
                        }
                    };
                    match state.cache_engine.refresh(&cache_id, &cache, &template_text, conn).await {
                        Ok(Some(snap)) => info!(cache_id, version = snap.version, "scheduled cache refresh completed"),
                        Ok(None) => {}
                        Err(e) => warn!(cache_id, error = %e, "scheduled cache refresh failed"),
                    }
                })
            })?)
            .await?;

        info!(cache_id, schedule = %cache.schedule, "scheduled cache refresh job");
    }
    Ok(())
}

/// Converts a `schedule` value into a cron expression. Accepts either a
/// literal 5/6-field cron string or one of the duration suffixes
/// (`"6h"`, `"15m"`, `"1d"`) used elsewhere in cache config.
fn to_cron_expression(schedule: &str) -> String {
    if schedule.split_whitespace().count() >= 5 {
        return schedule.to_string();
    }
    match parse_duration_string(schedule) {
        Some(d) if d.num_seconds() > 0 && d.num_seconds() < 60 => {
            format!("1/{} * * * * *", d.num_seconds())
        }
        Some(d) if d.num_minutes() > 0 && d.num_minutes() < 60 => {
            format!("0 1/{} * * * *", d.num_minutes())
        }
        Some(d) if d.num_hours() > 0 => format!("0 0 1/{} * * *", d.num_hours()),
        _ => "0 0 * * * *".to_string(),
    }
}

/// Runs the flapi server until `Ctrl+C`: loads config, schedules cache
/// refreshes, and serves the combined router on `--port` (and `--mcp-port`
/// if distinct).
#[instrument(name = "run_server", skip_all)]
pub async fn run_server(cli: &Cli) -> Result<()> {
    let log_handle = init_tracing_with(cli.log_level.as_deref(), cli.log_json);

    if cli.cert.is_some() {
        warn!("--cert/--key were provided; this build serves plain HTTP only, terminate TLS at a reverse proxy");
    }

    let state = build_state(cli, log_handle).await?;
    let mut scheduler = JobScheduler::new().await?;
    schedule_cache_refreshes(&state, &mut scheduler).await?;
    scheduler.start().await?;

    let config = state.current_config().await;
    let router = build_router(state.clone(), &config);

    let addr = format!("0.0.0.0:{}", cli.port);
    info!(%addr, "flapi listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let server = axum::serve(listener, router.clone());

    if let Some(mcp_port) = cli.mcp_port {
        let mcp_addr = format!("0.0.0.0:{mcp_port}");
        info!(%mcp_addr, "mcp transport listening separately");
        let mcp_listener = tokio::net::TcpListener::bind(&mcp_addr).await?;
        let mcp_server = axum::serve(mcp_listener, router);

        tokio::select! {
            res = server => { res.map_err(ApitapError::Io)?; }
            res = mcp_server => { res.map_err(ApitapError::Io)?; }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                scheduler.shutdown().await?;
            }
        }
    } else {
        tokio::select! {
            res = server => { res.map_err(ApitapError::Io)?; }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                scheduler.shutdown().await?;
            }
        }
    }

    Ok(())
}
