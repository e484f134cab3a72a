//! Management API (spec §6.2): introspection and admin operations under
//! `/api/v1/_config`, bearer-auth-gated except `GET /doc.yaml`.
//!
//! Mutating operations rewrite the owning endpoint YAML file on disk and
//! then reload the whole [`Config`] graph from `flapi.yaml`, swapping it
//! into shared state atomically — the same "swap on reload" idiom spec §5
//! already requires for the background config-service poller.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::config::load_config_from_path;
use crate::errors::{ApitapError, Result};
use crate::server::AppState;
use crate::template::{render, TemplateContext};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/endpoints", get(list_endpoints).post(create_endpoint))
        .route(
            "/endpoints/{slug}",
            get(get_endpoint).put(update_endpoint).delete(delete_endpoint),
        )
        .route("/endpoints/{slug}/template", get(get_template).put(put_template))
        .route("/endpoints/{slug}/template/expand", post(expand_template))
        .route("/endpoints/{slug}/parameters", get(get_parameters))
        .route("/endpoints/{slug}/test", post(test_endpoint))
        .route("/endpoints/{slug}/cache", get(get_cache).put(put_cache))
        .route("/endpoints/{slug}/cache/refresh", post(refresh_cache))
        .route("/endpoints/{slug}/cache/gc", post(gc_cache))
        .route("/endpoints/by-template", post(endpoints_by_template))
        .route("/schema", get(get_schema))
        .route("/schema/connections", get(get_schema_connections))
        .route("/schema/refresh", post(refresh_schema))
        .route("/filesystem", get(get_filesystem))
        .route("/log-level", get(get_log_level).put(put_log_level))
        .route("/environment-variables", get(get_environment_variables))
        .route("/doc.yaml", get(get_doc_yaml))
        .layer(axum::middleware::from_fn(require_management_auth))
}

/// Every route here requires `Authorization: Bearer <FLAPI_CONFIG_SERVICE_TOKEN>`
/// except `GET /doc.yaml`, per spec §6.2.
async fn require_management_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path().ends_with("/doc.yaml") {
        return next.run(req).await;
    }

    let expected = std::env::var("FLAPI_CONFIG_SERVICE_TOKEN").ok();
    let _ = &state;
    match expected {
        None => next.run(req).await,
        Some(token) => {
            let presented = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented == Some(token.as_str()) {
                next.run(req).await
            } else {
                ApitapError::Authentication("invalid management API token".to_string()).into_response()
            }
        }
    }
}

fn endpoint_or_404<'a>(config: &'a crate::config::Config, slug: &str) -> Result<&'a crate::config::EndpointConfig> {
    config
        .endpoint_by_slug(slug)
        .ok_or_else(|| ApitapError::NotFound(format!("no endpoint '{slug}'")))
}

async fn list_endpoints(State(state): State<Arc<AppState>>) -> Response {
    let config = state.current_config().await;
    let summary: Vec<Value> = config
        .endpoints
        .iter()
        .map(|e| {
            json!({
                "slug": e.slug,
                "identity": e.identity(),
                "method": format!("{:?}", e.raw.method),
                "connections": e.raw.connection_names,
            })
        })
        .collect();
    Json(json!({ "endpoints": summary })).into_response()
}

async fn get_endpoint(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    let config = state.current_config().await;
    match endpoint_or_404(&config, &slug) {
        Ok(e) => Json(json!({
            "slug": e.slug,
            "identity": e.identity(),
            "source_file": e.source_file.to_string_lossy(),
            "template_source": e.raw.template_source.to_string_lossy(),
            "connection_names": e.raw.connection_names,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Reloads `flapi.yaml` from disk and swaps it into shared state.
async fn reload_config(state: &AppState) -> Result<()> {
    let fresh = load_config_from_path(&state.config_path)?;
    *state.config.write().await = Arc::new(fresh);
    Ok(())
}

async fn create_endpoint(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match create_endpoint_inner(&state, body).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn create_endpoint_inner(state: &AppState, body: Value) -> Result<Response> {
    let slug = body
        .get("slug")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApitapError::Validation("slug - required field is missing".to_string()))?;
    let yaml_body = body
        .get("definition")
        .ok_or_else(|| ApitapError::Validation("definition - required field is missing".to_string()))?;
    let yaml_text = serde_yaml::to_string(yaml_body)?;

    let base_dir = state.config_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let dest = base_dir.join("endpoints").join(format!("{slug}.yaml"));
    if dest.exists() {
        return Err(ApitapError::Conflict(format!("endpoint file '{}' already exists", dest.display())));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&dest, yaml_text)?;

    reload_config(state).await?;
    Ok((StatusCode::CREATED, Json(json!({ "created": dest.to_string_lossy() }))).into_response())
}

async fn update_endpoint(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match update_endpoint_inner(&state, &slug, body).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn update_endpoint_inner(state: &AppState, slug: &str, body: Value) -> Result<Response> {
    let config = state.current_config().await;
    let existing = endpoint_or_404(&config, slug)?;
    let yaml_text = serde_yaml::to_string(&body)?;
    std::fs::write(&existing.source_file, yaml_text)?;
    reload_config(state).await?;
    Ok(Json(json!({ "updated": slug })).into_response())
}

async fn delete_endpoint(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    match delete_endpoint_inner(&state, &slug).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn delete_endpoint_inner(state: &AppState, slug: &str) -> Result<Response> {
    let config = state.current_config().await;
    let existing = endpoint_or_404(&config, slug)?;
    std::fs::remove_file(&existing.source_file)?;
    reload_config(state).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn get_template(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    let config = state.current_config().await;
    match endpoint_or_404(&config, &slug).and_then(|e| {
        std::fs::read_to_string(&e.resolved_template_path).map_err(ApitapError::Io)
    }) {
        Ok(text) => Json(json!({ "template": text })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn put_template(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let config = state.current_config().await;
    let result = (|| -> Result<()> {
        let endpoint = endpoint_or_404(&config, &slug)?;
        let text = body
            .get("template")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApitapError::Validation("template - required field is missing".to_string()))?;
        std::fs::write(&endpoint.resolved_template_path, text)?;
        Ok(())
    })();
    match result {
        Ok(()) => Json(json!({ "updated": slug })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn expand_template(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let config = state.current_config().await;
    let result = (|| -> Result<String> {
        let endpoint = endpoint_or_404(&config, &slug)?;
        let text = std::fs::read_to_string(&endpoint.resolved_template_path)?;
        let mut ctx = TemplateContext::new();
        ctx.set_namespace("params", body.get("params").cloned().unwrap_or(json!({})));
        ctx.set_namespace("auth", json!({}));
        ctx.set_namespace("env", json!({}));
        render(&text, &ctx)
    })();
    match result {
        Ok(sql) => Json(json!({ "sql": sql })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_parameters(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    let config = state.current_config().await;
    match endpoint_or_404(&config, &slug) {
        Ok(e) => {
            let fields: Vec<Value> = e
                .raw
                .request_fields
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "location": format!("{:?}", f.location),
                        "required": f.required,
                        "description": f.description,
                        "rules": f.validators.iter().map(|v| v.describe()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            Json(json!({ "parameters": fields })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn test_endpoint(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let config = state.current_config().await;
    let Ok(endpoint) = endpoint_or_404(&config, &slug) else {
        return ApitapError::NotFound(format!("no endpoint '{slug}'")).into_response();
    };

    let query = body
        .get("query")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let raw_request = crate::endpoint::RawRequest {
        query,
        path_params: Default::default(),
        headers: HeaderMap::new(),
        body: body.get("body").cloned().unwrap_or(Value::Null),
        auth: crate::auth::AuthContext::default(),
    };

    match crate::endpoint::handle_request(&config, endpoint, &state.engine, Some(state.cache_engine.as_ref()), raw_request).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn get_cache(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    let config = state.current_config().await;
    let Ok(endpoint) = endpoint_or_404(&config, &slug) else {
        return ApitapError::NotFound(format!("no endpoint '{slug}'")).into_response();
    };
    let Some(cache) = &endpoint.raw.cache else {
        return ApitapError::NotFound(format!("endpoint '{slug}' has no cache configured")).into_response();
    };
    let cache_id = format!("{}.{}", cache.catalog, cache.table);
    let latest = state.cache_engine.latest_snapshot(&cache_id).await;
    let state_label = state.cache_engine.state(&cache_id).await;
    Json(json!({
        "cache_id": cache_id,
        "strategy": format!("{:?}", cache.strategy()),
        "schedule": cache.schedule,
        "state": format!("{:?}", state_label),
        "latest_snapshot": latest.map(|s| json!({
            "version": s.version,
            "row_count": s.row_count,
            "finished_at": s.finished_at.to_rfc3339(),
        })),
    }))
    .into_response()
}

async fn put_cache(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match update_endpoint_inner(&state, &slug, body).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn refresh_cache(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    let config = state.current_config().await;
    let Ok(endpoint) = endpoint_or_404(&config, &slug) else {
        return ApitapError::NotFound(format!("no endpoint '{slug}'")).into_response();
    };
    let Some(cache) = &endpoint.raw.cache else {
        return ApitapError::NotFound(format!("endpoint '{slug}' has no cache configured")).into_response();
    };
    let Some(conn_name) = endpoint.raw.connection_names.first() else {
        return ApitapError::ConfigError("endpoint has no connection to refresh against".to_string()).into_response();
    };
    let Some(conn) = config.connection(conn_name) else {
        return ApitapError::ConfigError(format!("unknown connection '{conn_name}'")).into_response();
    };

    let cache_id = format!("{}.{}", cache.catalog, cache.table);
    let template_path = endpoint.source_template_dir.join(&cache.template_file);
    let template_text = match std::fs::read_to_string(&template_path) {
        Ok(t) => t,
        Err(e) => return ApitapError::Io(e).into_response(),
    };

    match state.cache_engine.refresh(&cache_id, cache, &template_text, conn).await {
        Ok(Some(snapshot)) => Json(json!({
            "refreshed": true,
            "version": snapshot.version,
            "row_count": snapshot.row_count,
        }))
        .into_response(),
        Ok(None) => (StatusCode::CONFLICT, Json(json!({ "refreshed": false, "reason": "already in progress" }))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn gc_cache(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    let config = state.current_config().await;
    let Ok(endpoint) = endpoint_or_404(&config, &slug) else {
        return ApitapError::NotFound(format!("no endpoint '{slug}'")).into_response();
    };
    let Some(cache) = &endpoint.raw.cache else {
        return ApitapError::NotFound(format!("endpoint '{slug}' has no cache configured")).into_response();
    };
    let cache_id = format!("{}.{}", cache.catalog, cache.table);
    state.cache_engine.gc(&cache_id, cache).await;
    Json(json!({ "gc_ran": true })).into_response()
}

async fn endpoints_by_template(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let config = state.current_config().await;
    let Some(template_path) = body.get("template_path").and_then(|v| v.as_str()) else {
        return ApitapError::Validation("template_path - required field is missing".to_string()).into_response();
    };
    let matches: Vec<Value> = config
        .endpoints
        .iter()
        .filter(|e| e.raw.template_source.to_string_lossy() == template_path)
        .map(|e| {
            json!({
                "type": if e.raw.path.is_some() { "rest" } else { "mcp" },
                "url_path": e.raw.path,
                "mcp_name": e.raw.mcp_name,
                "config_file_path": e.source_file.to_string_lossy(),
                "template_source": e.raw.template_source.to_string_lossy(),
            })
        })
        .collect();
    Json(json!({ "endpoints": matches })).into_response()
}

async fn get_schema(State(state): State<Arc<AppState>>) -> Response {
    let config = state.current_config().await;
    Json(json!({ "connections": config.connections.keys().collect::<Vec<_>>() })).into_response()
}

async fn get_schema_connections(State(state): State<Arc<AppState>>) -> Response {
    let config = state.current_config().await;
    let conns: Vec<Value> = config
        .connections
        .values()
        .map(|c| json!({ "name": c.name }))
        .collect();
    Json(json!({ "connections": conns })).into_response()
}

async fn refresh_schema(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.execute("SELECT table_name FROM information_schema.tables").await {
        Ok(rows) => Json(json!({ "tables": rows })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_filesystem(State(state): State<Arc<AppState>>) -> Response {
    let config = state.current_config().await;
    let root = state
        .config_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join(&config.template_source);
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            files.push(entry.path().to_string_lossy().to_string());
        }
    }
    Json(json!({ "files": files })).into_response()
}

async fn get_log_level(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "level": state.log_handle.current_level() })).into_response()
}

async fn put_log_level(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let Some(level) = body.get("level").and_then(|v| v.as_str()) else {
        return ApitapError::Validation("level - required field is missing".to_string()).into_response();
    };
    match state.log_handle.set_level(level) {
        Ok(()) => Json(json!({ "level": level })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_environment_variables(State(state): State<Arc<AppState>>) -> Response {
    let config = state.current_config().await;
    let vars: Vec<Value> = config
        .environment_whitelist
        .iter()
        .map(|name| json!({ "name": name, "set": std::env::var(name).is_ok() }))
        .collect();
    Json(json!({ "environment_variables": vars })).into_response()
}

async fn get_doc_yaml(State(state): State<Arc<AppState>>) -> Response {
    let config = state.current_config().await;
    let doc = json!({
        "project": config.project_name,
        "endpoints": config.endpoints.iter().map(|e| json!({
            "slug": e.slug,
            "identity": e.identity(),
            "method": format!("{:?}", e.raw.method),
        })).collect::<Vec<_>>(),
    });
    match serde_yaml::to_string(&doc) {
        Ok(text) => (
            [(axum::http::header::CONTENT_TYPE, "application/yaml")],
            text,
        )
            .into_response(),
        Err(e) => ApitapError::SerdeYaml(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_builds_without_panicking() {
        let _ = router();
    }
}
