//! HTTP server assembly: builds the dynamic per-endpoint REST router, the
//! MCP JSON-RPC route, and the management API, wiring them to one shared
//! [`AppState`] (spec §6.2–6.4).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{AuthContext, JwksCache};
use crate::cache::CacheEngine;
use crate::config::{Config, HttpMethod};
use crate::endpoint::{handle_request, RawRequest};
use crate::errors::{ApitapError, Result};
use crate::log::LogHandle;
use crate::management;
use crate::mcp::{dispatch, JsonRpcRequest, McpSessionLayer};
use crate::sqlengine::SqlEngine;

/// State shared by every handler in the process (spec §5's single
/// process-wide `Config` reference, swapped atomically on reload).
pub struct AppState {
    pub config: RwLock<Arc<Config>>,
    pub engine: SqlEngine,
    pub cache_engine: Arc<CacheEngine>,
    pub mcp: Arc<McpSessionLayer>,
    pub log_handle: LogHandle,
    pub jwks: HashMap<String, Arc<JwksCache>>,
    pub config_path: std::path::PathBuf,
}

impl AppState {
    pub async fn current_config(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }
}

/// Resolves the `Authorization` header against global auth config, or
/// returns an unauthenticated context if no scheme is configured
/// (spec §4.9: auth is opt-in per endpoint/global).
async fn authenticate(state: &AppState, headers: &HeaderMap, config: &Config) -> Result<AuthContext> {
    let Some(header_value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        if config.auth.basic.is_some() || config.auth.jwt.is_some() || !config.auth.oidc.is_empty() {
            return Err(ApitapError::Authentication("missing Authorization header".to_string()));
        }
        return Ok(AuthContext::default());
    };

    if header_value.starts_with("Basic ") {
        let basic = config
            .auth
            .basic
            .as_ref()
            .ok_or_else(|| ApitapError::Authentication("basic auth not configured".to_string()))?;
        return crate::auth::verify_basic(header_value, basic);
    }

    if let Some(token) = header_value.strip_prefix("Bearer ") {
        if let Some(jwt) = &config.auth.jwt {
            if let Ok(ctx) = crate::auth::verify_jwt_hmac(token, jwt) {
                return Ok(ctx);
            }
        }
        for provider in &config.auth.oidc {
            let jwks = state
                .jwks
                .get(&provider.issuer)
                .cloned()
                .unwrap_or_else(|| Arc::new(JwksCache::new(reqwest::Client::new())));
            if let Ok(ctx) = crate::auth::verify_oidc(token, provider, &jwks).await {
                return Ok(ctx);
            }
        }
        return Err(ApitapError::Authentication("token rejected by all configured providers".to_string()));
    }

    Err(ApitapError::Authentication("unsupported authorization scheme".to_string()))
}

/// Builds the top-level router: dynamic REST endpoints, MCP transport,
/// management API, and CORS/trace middleware (spec §6.2–6.4).
pub fn build_router(state: Arc<AppState>, config: &Config) -> Router {
    let mut router = Router::new();

    for endpoint in &config.endpoints {
        let Some(path) = &endpoint.raw.path else {
            continue;
        };
        let slug = endpoint.slug.clone();
        let method_router = rest_handler(slug);
        let with_method = match endpoint.raw.method {
            HttpMethod::Get => get(method_router),
            HttpMethod::Post => post(method_router),
            HttpMethod::Put => put(method_router),
            HttpMethod::Delete => delete(method_router),
            HttpMethod::Patch => patch(method_router),
        };
        router = router.route(path, with_method);
    }

    router
        .route("/mcp", post(mcp_handler))
        .nest("/api/v1/_config", management::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn rest_handler(
    slug: String,
) -> impl Fn(
    State<Arc<AppState>>,
    Query<HashMap<String, String>>,
    AxumPath<HashMap<String, String>>,
    HeaderMap,
    Option<Json<Value>>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone {
    move |State(state): State<Arc<AppState>>,
          Query(query): Query<HashMap<String, String>>,
          AxumPath(path_params): AxumPath<HashMap<String, String>>,
          headers: HeaderMap,
          body: Option<Json<Value>>| {
        let slug = slug.clone();
        let fut = async move {
            match dispatch_rest(state, slug, query, path_params, headers, body).await {
                Ok(resp) => resp,
                Err(e) => e.into_response(),
            }
        };
        Box::pin(fut)
    }
}

async fn dispatch_rest(
    state: Arc<AppState>,
    slug: String,
    query: HashMap<String, String>,
    path_params: HashMap<String, String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response> {
    let config = state.current_config().await;
    let endpoint = config
        .endpoint_by_slug(&slug)
        .ok_or_else(|| ApitapError::NotFound(format!("no endpoint for slug '{slug}'")))?;

    let auth = authenticate(&state, &headers, &config).await?;

    if let Some(required) = endpoint.raw.auth.as_ref().map(|a| &a.required_roles) {
        if !required.is_empty() && !required.iter().any(|r| auth.roles.contains(r)) {
            return Err(ApitapError::Authorization(
                "missing required role for this endpoint".to_string(),
            ));
        }
    }

    let raw_request = RawRequest {
        query,
        path_params,
        headers,
        body: body.map(|Json(v)| v).unwrap_or(Value::Null),
        auth,
    };

    handle_request(&config, endpoint, &state.engine, Some(state.cache_engine.as_ref()), raw_request).await
}

async fn mcp_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let config = state.current_config().await;
    let engine = state.engine.clone();
    let config_for_call = config.clone();

    let auth = authenticate(&state, &headers, &config)
        .await
        .unwrap_or_default();

    let response = dispatch(&state.mcp, &config, req, &auth, move |slug, params| {
        let config = config_for_call.clone();
        let engine = engine.clone();
        let slug = slug.to_string();
        async move {
            let endpoint = config
                .endpoint_by_slug(&slug)
                .ok_or_else(|| ApitapError::NotFound(format!("no endpoint for slug '{slug}'")))?;
            let raw_request = RawRequest {
                query: HashMap::new(),
                path_params: HashMap::new(),
                headers: HeaderMap::new(),
                body: params,
                auth: AuthContext::default(),
            };
            let resp = handle_request(&config, endpoint, &engine, None, raw_request).await?;
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .map_err(|e| ApitapError::Internal(e.to_string()))?;
            serde_json::from_slice(&bytes).map_err(ApitapError::SerdeJson)
        }
    })
    .await;

    if let Some(e) = &response.error {
        warn!(code = e.code, message = %e.message, "mcp request failed");
    }

    Json(response)
}
