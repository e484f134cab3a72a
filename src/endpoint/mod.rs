//! Request Pipeline (C6): parameter binding, validation, template expansion,
//! execution, pagination, and response shaping for a single endpoint
//! request (spec §4.6).

use std::collections::HashMap;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::instrument;

use crate::auth::AuthContext;
use crate::cache::CacheEngine;
use crate::config::{Config, EndpointConfig, FieldLocation, RequestField};
use crate::errors::{ApitapError, Result};
use crate::sqlengine::SqlEngine;
use crate::template::{render, TemplateContext};

/// Everything a single request needs that the router/handler layer extracts
/// generically (query string, path params, headers, raw body).
pub struct RawRequest {
    pub query: HashMap<String, String>,
    pub path_params: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Value,
    pub auth: AuthContext,
}

/// Extracts a single field's raw string form from the request, honoring
/// its declared `location` (spec §4.6 step 3).
fn extract_raw_field(field: &RequestField, req: &RawRequest) -> Option<String> {
    match field.location {
        FieldLocation::Query => req.query.get(&field.name).cloned(),
        FieldLocation::Path => req.path_params.get(&field.name).cloned(),
        FieldLocation::Header => req
            .headers
            .get(&field.name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        FieldLocation::Body => req
            .body
            .get(&field.name)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
    }
}

/// Runs parameter extraction + validation (spec §4.6 steps 3-4), producing
/// the `params.*` map for the template engine.
fn bind_and_validate(endpoint: &EndpointConfig, req: &RawRequest) -> Result<Map<String, Value>> {
    let mut params = Map::new();

    for field in &endpoint.raw.request_fields {
        let raw = extract_raw_field(field, req);

        let raw = match raw {
            Some(r) => Some(r),
            None if field.required && field.default.is_none() => {
                return Err(ApitapError::Validation(format!(
                    "{} - required field is missing",
                    field.name
                )));
            }
            None => field.default.clone(),
        };

        let Some(raw) = raw else {
            continue;
        };

        let mut parsed = Value::String(raw.clone());
        for validator in &field.validators {
            parsed = validator.validate(&field.name, &raw)?;
        }
        params.insert(field.name.clone(), parsed);
    }

    if endpoint.raw.operation.validate_before_write {
        if let Value::Object(body_map) = &req.body {
            let known: std::collections::HashSet<&str> = endpoint
                .raw
                .request_fields
                .iter()
                .filter(|f| f.location == FieldLocation::Body)
                .map(|f| f.name.as_str())
                .collect();
            for key in body_map.keys() {
                if !known.contains(key.as_str()) {
                    return Err(ApitapError::Validation(format!(
                        "{key} - unknown field in strict mode"
                    )));
                }
            }
        }
    }

    Ok(params)
}

/// Offset-based pagination parameters (spec §4.6 step 7).
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: u64,
    pub offset: u64,
}

/// True when the rendered SQL already ends in its own `LIMIT`/`OFFSET`
/// clause, in which case the pipeline honors the template-provided values
/// instead of appending a second one (spec §4.6 step 7).
fn has_trailing_limit_clause(sql: &str) -> bool {
    let re = Regex::new(r"(?is)\blimit\s+\d+\s*(,\s*\d+\s*)?(offset\s+\d+\s*)?;?\s*$").unwrap();
    re.is_match(sql.trim())
}

fn extract_pagination(params: &Map<String, Value>, default_page_size: u32) -> Pagination {
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(default_page_size as u64);
    let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0);
    Pagination { limit, offset }
}

/// Shapes the result rows into the envelope of spec §6.2/§4.6 step 8.
fn shape_read_response(rows: Vec<Map<String, Value>>, pagination: Option<Pagination>, total_count: Option<u64>) -> Value {
    let mut body = json!({ "data": rows });
    if let Some(total_count) = total_count {
        body["total_count"] = json!(total_count);
    }
    if let Some(p) = pagination {
        let next_offset = p.offset + p.limit;
        body["next"] = json!(format!("?limit={}&offset={}", p.limit, next_offset));
    }
    body
}

/// Executes the full 9-step pipeline for one matched endpoint and produces
/// the final JSON (or CSV, negotiated via `Accept`) response.
#[instrument(skip_all, fields(slug = %endpoint.slug))]
pub async fn handle_request(
    config: &Config,
    endpoint: &EndpointConfig,
    engine: &SqlEngine,
    cache_engine: Option<&CacheEngine>,
    req: RawRequest,
) -> Result<Response> {
    let params = bind_and_validate(endpoint, &req)?;

    let mut ctx = TemplateContext::new();
    ctx.set_namespace("params", Value::Object(params.clone()));
    ctx.set_namespace("auth", req.auth.as_template_value());
    ctx.set_namespace("env", json!({}));

    if let Some(conn_name) = endpoint.raw.connection_names.first() {
        if let Some(conn) = config.connection(conn_name) {
            ctx.set_namespace("conn", json!(conn.properties.clone()));
        }
    }

    if let Some(cache) = &endpoint.raw.cache {
        let mut cache_ns = json!({
            "catalog": cache.catalog,
            "schema": cache.schema,
            "table": cache.table,
        });
        if let Some(cache_engine) = cache_engine {
            let cache_id = format!("{}.{}", cache.catalog, cache.table);
            if let Some(snapshot) = cache_engine.latest_snapshot(&cache_id).await {
                cache_ns["version"] = json!(snapshot.version);
                cache_ns["lastRefreshedAt"] = json!(snapshot.finished_at.to_rfc3339());
            }
        }
        ctx.set_namespace("cache", cache_ns);
    }

    let mut sql = render(
        &std::fs::read_to_string(&endpoint.resolved_template_path)?,
        &ctx,
    )?;

    let pagination = if config.response_format.enable_pagination && !has_trailing_limit_clause(&sql) {
        let p = extract_pagination(&params, config.response_format.default_page_size);
        sql = format!("{sql} LIMIT {} OFFSET {}", p.limit, p.offset);
        Some(p)
    } else {
        None
    };

    let timeout = std::time::Duration::from_secs(30);
    let rows = tokio::time::timeout(timeout, engine.execute(&sql))
        .await
        .map_err(|_| ApitapError::Timeout("query exceeded the request deadline".to_string()))??;

    let wants_csv = req
        .headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/csv"))
        .unwrap_or(false);

    if endpoint.raw.operation.kind == crate::config::OperationKind::Write {
        let body = json!({
            "rows_affected": rows.len(),
            "returned_data": if endpoint.raw.operation.returns_data { Some(rows) } else { None },
        });
        return Ok((StatusCode::OK, Json(body)).into_response());
    }

    if wants_csv && config.response_format.enable_csv {
        return Ok((StatusCode::OK, rows_to_csv(&rows)).into_response());
    }

    let body = shape_read_response(rows, pagination, None);
    Ok((StatusCode::OK, Json(body)).into_response())
}

fn rows_to_csv(rows: &[Map<String, Value>]) -> String {
    let mut out = String::new();
    if let Some(first) = rows.first() {
        let headers: Vec<&String> = first.keys().collect();
        out.push_str(&headers.iter().map(|h| h.as_str()).collect::<Vec<_>>().join(","));
        out.push('\n');
        for row in rows {
            let line: Vec<String> = headers
                .iter()
                .map(|h| row.get(*h).map(value_to_csv_cell).unwrap_or_default())
                .collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
    }
    out
}

fn value_to_csv_cell(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldLocation, Operation, OperationKind, RequestField};
    use crate::validators::Validator;
    use axum::http::HeaderMap;

    fn raw_request(query: &[(&str, &str)]) -> RawRequest {
        RawRequest {
            query: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            path_params: HashMap::new(),
            headers: HeaderMap::new(),
            body: Value::Null,
            auth: AuthContext::default(),
        }
    }

    fn endpoint_with_fields(fields: Vec<RequestField>) -> EndpointConfig {
        EndpointConfig {
            raw: crate::config::RawEndpoint {
                path: Some("/customers/".to_string()),
                mcp_name: None,
                method: crate::config::HttpMethod::Get,
                request_fields: fields,
                template_source: "customers.sql".into(),
                connection_names: vec!["db".to_string()],
                operation: Operation {
                    kind: OperationKind::Read,
                    returns_data: false,
                    transaction: false,
                    validate_before_write: false,
                },
                auth: None,
                rate_limit: None,
                cache: None,
                mcp_tool: None,
                mcp_resource: None,
                mcp_prompt: None,
            },
            slug: "customers-slash".to_string(),
            source_file: "endpoints/customers.yaml".into(),
            source_template_dir: "endpoints".into(),
            resolved_template_path: "endpoints/customers.sql".into(),
        }
    }

    #[test]
    fn binds_and_validates_required_int_field() {
        let endpoint = endpoint_with_fields(vec![RequestField {
            name: "id".to_string(),
            location: FieldLocation::Query,
            description: None,
            required: true,
            default: None,
            validators: vec![Validator::Int { min: Some(1), max: None }],
        }]);
        let req = raw_request(&[("id", "42")]);
        let params = bind_and_validate(&endpoint, &req).unwrap();
        assert_eq!(params["id"], Value::from(42));
    }

    #[test]
    fn missing_required_field_fails_before_validators_run() {
        let endpoint = endpoint_with_fields(vec![RequestField {
            name: "id".to_string(),
            location: FieldLocation::Query,
            description: None,
            required: true,
            default: None,
            validators: vec![Validator::Int { min: Some(1), max: None }],
        }]);
        let req = raw_request(&[]);
        let err = bind_and_validate(&endpoint, &req).unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn missing_optional_field_falls_back_to_default() {
        let endpoint = endpoint_with_fields(vec![RequestField {
            name: "limit".to_string(),
            location: FieldLocation::Query,
            description: None,
            required: false,
            default: Some("10".to_string()),
            validators: vec![Validator::Int { min: Some(1), max: None }],
        }]);
        let req = raw_request(&[]);
        let params = bind_and_validate(&endpoint, &req).unwrap();
        assert_eq!(params["limit"], Value::from(10));
    }

    #[test]
    fn invalid_field_value_surfaces_validation_error() {
        let endpoint = endpoint_with_fields(vec![RequestField {
            name: "id".to_string(),
            location: FieldLocation::Query,
            description: None,
            required: true,
            default: None,
            validators: vec![Validator::Int { min: Some(1), max: None }],
        }]);
        let req = raw_request(&[("id", "-1")]);
        let err = bind_and_validate(&endpoint, &req).unwrap_err();
        assert!(matches!(err, ApitapError::Validation(_)));
    }

    #[test]
    fn trailing_limit_clause_is_detected_case_insensitively() {
        assert!(has_trailing_limit_clause("SELECT * FROM t LIMIT 10"));
        assert!(has_trailing_limit_clause("select * from t limit 10 offset 5"));
        assert!(has_trailing_limit_clause("SELECT * FROM t LIMIT 10;"));
        assert!(!has_trailing_limit_clause("SELECT * FROM t WHERE id = 1"));
    }

    #[test]
    fn csv_rendering_produces_header_and_rows() {
        let mut row = Map::new();
        row.insert("id".to_string(), Value::from(1));
        row.insert("name".to_string(), Value::String("Ada".to_string()));
        let csv = rows_to_csv(&[row]);
        assert!(csv.starts_with("id,name\n") || csv.starts_with("name,id\n"));
    }
}
