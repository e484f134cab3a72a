//! MCP Session Layer (C8): JSON-RPC 2.0 dispatch, session table, and
//! token-to-session binding (spec §4.8).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::auth::AuthContext;
use crate::config::{Config, McpPromptConfig, McpResourceConfig, McpToolConfig};
use crate::errors::{ApitapError, Result};

/// spec §3 MCPSession.
#[derive(Debug, Clone)]
pub struct McpSession {
    pub session_id: String,
    pub protocol_version: String,
    pub client_info: Value,
    pub bound_token_jti: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

const TOKEN_REFRESH_WINDOW_SECS: i64 = 5 * 60;

impl McpSession {
    /// True when the bound token expires within the next 5 minutes, per
    /// spec §4.8's `needsTokenRefresh()`.
    pub fn needs_token_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.token_expires_at {
            Some(expires_at) => now > expires_at - chrono::Duration::seconds(TOKEN_REFRESH_WINDOW_SECS),
            None => false,
        }
    }

    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.token_expires_at, Some(expires_at) if now > expires_at)
    }
}

/// JSON-RPC 2.0 envelope (request side).
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Process-wide session table, guarded by a standard reader/writer lock
/// (spec §5).
pub struct McpSessionLayer {
    sessions: RwLock<HashMap<String, McpSession>>,
}

impl McpSessionLayer {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_session(
        &self,
        protocol_version: String,
        client_info: Value,
        bound_token_jti: Option<String>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> String {
        let session_id = nanoid!(21);
        let now = Utc::now();
        let session = McpSession {
            session_id: session_id.clone(),
            protocol_version,
            client_info,
            bound_token_jti,
            token_expires_at,
            created_at: now,
            last_activity_at: now,
        };
        self.sessions.write().await.insert(session_id.clone(), session);
        session_id
    }

    /// Validates that `session_id` exists and its bound token (if any) has
    /// not expired, bumping `last_activity_at` on success and evicting the
    /// session on expiry.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Err(ApitapError::NotFound(format!("unknown MCP session '{session_id}'")));
        };

        if session.is_token_expired(now) {
            sessions.remove(session_id);
            return Err(ApitapError::Authentication(
                "MCP session's bound token has expired".to_string(),
            ));
        }

        session.last_activity_at = now;
        Ok(())
    }

    pub async fn close(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn get(&self, session_id: &str) -> Option<McpSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Evicts sessions idle longer than `idle_timeout` or with an expired
    /// bound token.
    pub async fn evict_stale(&self, idle_timeout: chrono::Duration) {
        let now = Utc::now();
        self.sessions.write().await.retain(|_, session| {
            !session.is_token_expired(now) && now - session.last_activity_at < idle_timeout
        });
    }
}

impl Default for McpSessionLayer {
    fn default() -> Self {
        Self::new()
    }
}

struct McpTool<'a> {
    slug: &'a str,
    tool: &'a McpToolConfig,
}

struct McpResource<'a> {
    slug: &'a str,
    resource: &'a McpResourceConfig,
}

struct McpPrompt<'a> {
    slug: &'a str,
    prompt: &'a McpPromptConfig,
}

fn tools_of(config: &Config) -> Vec<McpTool<'_>> {
    config
        .endpoints
        .iter()
        .filter_map(|e| e.raw.mcp_tool.as_ref().map(|t| McpTool { slug: &e.slug, tool: t }))
        .collect()
}

fn resources_of(config: &Config) -> Vec<McpResource<'_>> {
    config
        .endpoints
        .iter()
        .filter_map(|e| e.raw.mcp_resource.as_ref().map(|r| McpResource { slug: &e.slug, resource: r }))
        .collect()
}

fn prompts_of(config: &Config) -> Vec<McpPrompt<'_>> {
    config
        .endpoints
        .iter()
        .filter_map(|e| e.raw.mcp_prompt.as_ref().map(|p| McpPrompt { slug: &e.slug, prompt: p }))
        .collect()
}

/// Dispatches one JSON-RPC request. `tool_call` is the caller-supplied hook
/// that routes a `tools/call` invocation through the request pipeline (C6);
/// keeping it as a callback avoids a dependency cycle between `mcp` and
/// `endpoint`. `auth` is the caller's already-verified identity, if any; when
/// `initialize` is called over an authenticated bearer token the session
/// binds to that token's `jti`/expiry (spec §4.8).
pub async fn dispatch<F, Fut>(
    sessions: &McpSessionLayer,
    config: &Config,
    req: JsonRpcRequest,
    auth: &AuthContext,
    tool_call: F,
) -> JsonRpcResponse
where
    F: FnOnce(&str, Value) -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    let id = req.id.clone();
    match req.method.as_str() {
        "initialize" => {
            let protocol_version = req
                .params
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("2024-11-05")
                .to_string();
            let client_info = req.params.get("clientInfo").cloned().unwrap_or(Value::Null);
            let token_expires_at = auth
                .token_expires_at
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));
            let session_id = sessions
                .create_session(protocol_version.clone(), client_info, auth.token_jti.clone(), token_expires_at)
                .await;
            JsonRpcResponse::ok(
                id,
                serde_json::json!({
                    "protocolVersion": protocol_version,
                    "sessionId": session_id,
                    "serverInfo": {"name": "flapi", "version": env!("CARGO_PKG_VERSION")},
                }),
            )
        }
        "tools/list" => {
            let tools: Vec<Value> = tools_of(config)
                .into_iter()
                .map(|t| serde_json::json!({"name": t.tool.name, "description": t.tool.description, "slug": t.slug}))
                .collect();
            JsonRpcResponse::ok(id, serde_json::json!({"tools": tools}))
        }
        "tools/call" => {
            let name = req.params.get("name").and_then(|v| v.as_str());
            let Some(name) = name else {
                return JsonRpcResponse::err(id, -32602, "missing tool name");
            };
            let Some(slug) = tools_of(config)
                .into_iter()
                .find(|t| t.tool.name == name)
                .map(|t| t.slug.to_string())
            else {
                return JsonRpcResponse::err(id, -32602, format!("unknown tool '{name}'"));
            };
            let arguments = req.params.get("arguments").cloned().unwrap_or(Value::Null);
            match tool_call(&slug, arguments).await {
                Ok(result) => JsonRpcResponse::ok(
                    id,
                    serde_json::json!({"content": [{"type": "text", "text": result.to_string()}]}),
                ),
                Err(e) => JsonRpcResponse::err(id, -32000, e.to_string()),
            }
        }
        "resources/list" => {
            let resources: Vec<Value> = resources_of(config)
                .into_iter()
                .map(|r| serde_json::json!({"uri": r.resource.uri, "description": r.resource.description, "slug": r.slug}))
                .collect();
            JsonRpcResponse::ok(id, serde_json::json!({"resources": resources}))
        }
        "resources/read" => {
            let uri = req.params.get("uri").and_then(|v| v.as_str());
            let Some(uri) = uri else {
                return JsonRpcResponse::err(id, -32602, "missing uri");
            };
            let Some(slug) = resources_of(config)
                .into_iter()
                .find(|r| r.resource.uri == uri)
                .map(|r| r.slug.to_string())
            else {
                return JsonRpcResponse::err(id, -32602, format!("unknown resource '{uri}'"));
            };
            match tool_call(&slug, Value::Null).await {
                Ok(result) => JsonRpcResponse::ok(
                    id,
                    serde_json::json!({"contents": [{"uri": uri, "text": result.to_string()}]}),
                ),
                Err(e) => JsonRpcResponse::err(id, -32000, e.to_string()),
            }
        }
        "prompts/list" => {
            let prompts: Vec<Value> = prompts_of(config)
                .into_iter()
                .map(|p| serde_json::json!({"name": p.prompt.name, "description": p.prompt.description, "slug": p.slug}))
                .collect();
            JsonRpcResponse::ok(id, serde_json::json!({"prompts": prompts}))
        }
        "prompts/get" => {
            let name = req.params.get("name").and_then(|v| v.as_str());
            let Some(name) = name else {
                return JsonRpcResponse::err(id, -32602, "missing prompt name");
            };
            if prompts_of(config).into_iter().any(|p| p.prompt.name == name) {
                JsonRpcResponse::ok(id, serde_json::json!({"messages": []}))
            } else {
                JsonRpcResponse::err(id, -32602, format!("unknown prompt '{name}'"))
            }
        }
        "logging/setLevel" => JsonRpcResponse::ok(id, serde_json::json!({"ok": true})),
        "completion/complete" => JsonRpcResponse::ok(id, serde_json::json!({"completion": {"values": []}})),
        other => JsonRpcResponse::err(id, -32601, format!("method not found: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_touch_session() {
        let sessions = McpSessionLayer::new();
        let id = sessions
            .create_session("2024-11-05".to_string(), Value::Null, None, None)
            .await;
        assert!(sessions.touch(&id).await.is_ok());
    }

    #[tokio::test]
    async fn touch_unknown_session_is_not_found() {
        let sessions = McpSessionLayer::new();
        let err = sessions.touch("nope").await.unwrap_err();
        assert!(matches!(err, ApitapError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_bound_token_invalidates_session() {
        let sessions = McpSessionLayer::new();
        let past = Utc::now() - chrono::Duration::hours(1);
        let id = sessions
            .create_session("2024-11-05".to_string(), Value::Null, Some("jti-1".to_string()), Some(past))
            .await;

        let err = sessions.touch(&id).await.unwrap_err();
        assert!(matches!(err, ApitapError::Authentication(_)));
        assert!(sessions.get(&id).await.is_none());
    }

    #[test]
    fn needs_token_refresh_within_five_minutes_of_expiry() {
        let now = Utc::now();
        let session = McpSession {
            session_id: "s".into(),
            protocol_version: "2024-11-05".into(),
            client_info: Value::Null,
            bound_token_jti: Some("jti".into()),
            token_expires_at: Some(now + chrono::Duration::minutes(2)),
            created_at: now,
            last_activity_at: now,
        };
        assert!(session.needs_token_refresh(now));
    }

    #[test]
    fn does_not_need_refresh_when_far_from_expiry() {
        let now = Utc::now();
        let session = McpSession {
            session_id: "s".into(),
            protocol_version: "2024-11-05".into(),
            client_info: Value::Null,
            bound_token_jti: Some("jti".into()),
            token_expires_at: Some(now + chrono::Duration::hours(1)),
            created_at: now,
            last_activity_at: now,
        };
        assert!(!session.needs_token_refresh(now));
    }

    #[tokio::test]
    async fn dispatch_unknown_method_is_method_not_found() {
        let sessions = McpSessionLayer::new();
        let config = empty_config();
        let req = JsonRpcRequest {
            id: Some(Value::from(1)),
            method: "bogus/method".to_string(),
            params: Value::Null,
        };
        let resp = dispatch(&sessions, &config, req, &AuthContext::default(), |_, _| async {
            Ok(Value::Null)
        })
        .await;
        assert!(resp.error.is_some());
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn initialize_binds_session_to_authenticated_tokens_jti() {
        let sessions = McpSessionLayer::new();
        let config = empty_config();
        let auth = AuthContext {
            authenticated: true,
            token_jti: Some("jti-abc".to_string()),
            token_expires_at: Some((Utc::now() + chrono::Duration::hours(1)).timestamp() as u64),
            ..Default::default()
        };
        let req = JsonRpcRequest {
            id: Some(Value::from(1)),
            method: "initialize".to_string(),
            params: Value::Null,
        };

        dispatch(&sessions, &config, req, &auth, |_, _| async { Ok(Value::Null) }).await;

        let sessions_guard = sessions.sessions.read().await;
        let session = sessions_guard.values().next().expect("session created");
        assert_eq!(session.bound_token_jti.as_deref(), Some("jti-abc"));
        assert!(session.token_expires_at.is_some());
    }

    fn empty_config() -> Config {
        Config {
            project_name: "test".into(),
            description: None,
            connections: Default::default(),
            template_source: "templates".into(),
            environment_whitelist: vec![],
            duckdb: Default::default(),
            ducklake: Default::default(),
            auth: Default::default(),
            rate_limit: Default::default(),
            response_format: Default::default(),
            endpoints: vec![],
        }
    }
}
