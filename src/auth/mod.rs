//! Auth Verifier (C9): Basic, bearer-JWT(HMAC), and OIDC(RS256-512+JWKS)
//! token validation, producing an `AuthContext` for the template engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::{ApitapError, Result};

/// Per-request derived identity (spec §3 AuthContext). Not persisted;
/// flows into the template engine as the `auth.*` namespace.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub authenticated: bool,
    pub username: Option<String>,
    pub email: Option<String>,
    pub roles: HashSet<String>,
    pub groups: HashSet<String>,
    pub auth_type: AuthType,
    /// JWT `jti` claim, when the scheme was OIDC and the claim was present —
    /// used by the MCP session layer's token-binding (spec §4.8).
    pub token_jti: Option<String>,
    pub token_expires_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Jwt,
    Oidc,
}

impl AuthContext {
    pub fn as_template_value(&self) -> Value {
        serde_json::json!({
            "authenticated": self.authenticated,
            "username": self.username,
            "email": self.email,
            "roles": self.roles.iter().cloned().collect::<Vec<_>>(),
            "groups": self.groups.iter().cloned().collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BasicAuthConfig {
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtAuthConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// One OIDC identity provider, either hand-configured or expanded from a
/// preset (spec §4.9's Google/Azure/Keycloak/Auth0/Okta/GitHub/generic list).
#[derive(Debug, Clone, Deserialize)]
pub struct OidcProviderConfig {
    pub issuer: String,
    #[serde(default)]
    pub allowed_audiences: Vec<String>,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_seconds: u64,
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
    #[serde(default)]
    pub email_claim: Option<String>,
    #[serde(default)]
    pub roles_claim: Option<String>,
    #[serde(default)]
    pub groups_claim: Option<String>,
    #[serde(default = "default_jwks_ttl")]
    pub jwks_cache_seconds: u64,
}

fn default_clock_skew() -> u64 {
    300
}

fn default_username_claim() -> String {
    "sub".to_string()
}

fn default_jwks_ttl() -> u64 {
    24 * 3600
}

/// Preset-derived OIDC provider shapes (spec §4.9). Each preset fixes the
/// issuer and claim-path conventions of a common identity platform.
pub enum OidcPreset {
    Google,
    AzureAd { tenant: String },
    Keycloak { base_url: String, realm: String },
    Auth0 { domain: String },
    Okta { domain: String },
    GitHub,
    Generic,
}

impl OidcPreset {
    pub fn into_config(self, allowed_audiences: Vec<String>) -> OidcProviderConfig {
        let (issuer, username_claim, roles_claim) = match self {
            OidcPreset::Google => (
                "https://accounts.google.com".to_string(),
                "email".to_string(),
                None,
            ),
            OidcPreset::AzureAd { tenant } => (
                format!("https://login.microsoftonline.com/{tenant}/v2.0"),
                "preferred_username".to_string(),
                Some("roles".to_string()),
            ),
            OidcPreset::Keycloak { base_url, realm } => (
                format!("{base_url}/realms/{realm}"),
                "preferred_username".to_string(),
                Some("realm_access.roles".to_string()),
            ),
            OidcPreset::Auth0 { domain } => (
                format!("https://{domain}/"),
                "nickname".to_string(),
                Some("https://schemas.flapi.dev/roles".to_string()),
            ),
            OidcPreset::Okta { domain } => (
                format!("https://{domain}"),
                "preferred_username".to_string(),
                Some("groups".to_string()),
            ),
            OidcPreset::GitHub => (
                "https://github.com".to_string(),
                "login".to_string(),
                None,
            ),
            OidcPreset::Generic => (String::new(), "sub".to_string(), None),
        };

        OidcProviderConfig {
            issuer,
            allowed_audiences,
            clock_skew_seconds: default_clock_skew(),
            username_claim,
            email_claim: Some("email".to_string()),
            roles_claim,
            groups_claim: Some("groups".to_string()),
            jwks_cache_seconds: default_jwks_ttl(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

struct JwksEntry {
    jwks: Arc<JwkSet>,
    fetched_at: SystemTime,
    ttl: Duration,
}

impl JwksEntry {
    fn is_expired(&self) -> bool {
        SystemTime::now()
            .duration_since(self.fetched_at)
            .map(|elapsed| elapsed > self.ttl)
            .unwrap_or(true)
    }
}

/// Caches the discovery document and JWKS for one OIDC issuer, refreshing
/// the JWKS only on an unknown `kid` (spec §4.9, scoped down from the
/// pack's richer ETag/stale-serving JWKS cache to this spec's simpler
/// whole-document TTL caching).
pub struct JwksCache {
    client: reqwest::Client,
    entry: RwLock<Option<JwksEntry>>,
    refresh_guard: Mutex<()>,
}

impl JwksCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            entry: RwLock::new(None),
            refresh_guard: Mutex::new(()),
        }
    }

    async fn fetch(&self, issuer: &str, ttl: Duration) -> Result<Arc<JwkSet>> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let discovery: DiscoveryDocument = self
            .client
            .get(&discovery_url)
            .send()
            .await?
            .json()
            .await?;

        let jwks: JwkSet = self
            .client
            .get(&discovery.jwks_uri)
            .send()
            .await?
            .json()
            .await?;

        let jwks = Arc::new(jwks);
        *self.entry.write().await = Some(JwksEntry {
            jwks: jwks.clone(),
            fetched_at: SystemTime::now(),
            ttl,
        });
        Ok(jwks)
    }

    /// Resolves the key for `kid`, fetching (or refreshing once on a miss).
    pub async fn resolve(&self, issuer: &str, kid: Option<&str>, ttl: Duration) -> Result<Arc<JwkSet>> {
        {
            let guard = self.entry.read().await;
            if let Some(entry) = guard.as_ref() {
                if !entry.is_expired() && key_present(&entry.jwks, kid) {
                    return Ok(entry.jwks.clone());
                }
            }
        }

        let _flight = self.refresh_guard.lock().await;
        // Re-check after acquiring the single-flight guard; another task may
        // have already refreshed while we were waiting.
        {
            let guard = self.entry.read().await;
            if let Some(entry) = guard.as_ref() {
                if !entry.is_expired() && key_present(&entry.jwks, kid) {
                    return Ok(entry.jwks.clone());
                }
            }
        }

        debug!(issuer, kid, "refreshing JWKS");
        self.fetch(issuer, ttl).await
    }
}

fn key_present(jwks: &JwkSet, kid: Option<&str>) -> bool {
    match kid {
        None => true,
        Some(kid) => jwks.keys.iter().any(|k| k.common.key_id.as_deref() == Some(kid)),
    }
}

/// Verifies `Authorization: Basic base64(user:pass)` against a configured
/// user map.
pub fn verify_basic(header_value: &str, config: &BasicAuthConfig) -> Result<AuthContext> {
    let encoded = header_value
        .strip_prefix("Basic ")
        .ok_or_else(|| ApitapError::Authentication("expected Basic scheme".to_string()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ApitapError::Authentication("invalid base64 credentials".to_string()))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| ApitapError::Authentication("credentials are not valid UTF-8".to_string()))?;
    let (user, pass) = text
        .split_once(':')
        .ok_or_else(|| ApitapError::Authentication("malformed basic credentials".to_string()))?;

    match config.users.get(user) {
        Some(expected) if expected == pass => Ok(AuthContext {
            authenticated: true,
            username: Some(user.to_string()),
            auth_type: AuthType::Basic,
            ..Default::default()
        }),
        _ => Err(ApitapError::Authentication("invalid username or password".to_string())),
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct HmacClaims {
    iss: Option<String>,
    aud: Option<Value>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Verifies a symmetric (HMAC) bearer JWT against a configured secret.
pub fn verify_jwt_hmac(token: &str, config: &JwtAuthConfig) -> Result<AuthContext> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    if let Some(iss) = &config.issuer {
        validation.set_issuer(&[iss]);
    }
    if let Some(aud) = &config.audience {
        validation.set_audience(&[aud]);
    }

    let key = DecodingKey::from_secret(config.secret.as_bytes());
    let data = decode::<HmacClaims>(token, &key, &validation)?;

    Ok(AuthContext {
        authenticated: true,
        username: data.claims.iss.clone(),
        auth_type: AuthType::Jwt,
        token_expires_at: data.claims.exp,
        ..Default::default()
    })
}

/// Verifies an asymmetric OIDC bearer token: resolves the signing key by
/// `kid` (refreshing JWKS once on a miss), verifies RS256/384/512 signature
/// plus `iss`/`aud`/`exp`/`nbf`, and extracts claims per `provider`.
pub async fn verify_oidc(
    token: &str,
    provider: &OidcProviderConfig,
    jwks_cache: &JwksCache,
) -> Result<AuthContext> {
    let header = decode_header(token)?;
    let kid = header.kid.as_deref();

    let ttl = Duration::from_secs(provider.jwks_cache_seconds);
    let jwks = jwks_cache.resolve(&provider.issuer, kid, ttl).await?;

    let jwk = kid
        .and_then(|k| jwks.keys.iter().find(|key| key.common.key_id.as_deref() == Some(k)))
        .or_else(|| jwks.keys.first())
        .ok_or_else(|| ApitapError::Authentication("no matching JWKS key".to_string()))?;

    let decoding_key = DecodingKey::from_jwk(jwk)
        .map_err(|_| ApitapError::Authentication("unusable JWKS key".to_string()))?;

    let algorithm = match header.alg {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => header.alg,
        _ => {
            return Err(ApitapError::Authentication(
                "unsupported signing algorithm".to_string(),
            ))
        }
    };

    let mut validation = Validation::new(algorithm);
    validation.set_issuer(&[&provider.issuer]);
    if !provider.allowed_audiences.is_empty() {
        validation.set_audience(&provider.allowed_audiences);
    }
    validation.leeway = provider.clock_skew_seconds;
    validation.validate_nbf = true;

    let data = decode::<Value>(token, &decoding_key, &validation).map_err(|e| {
        if e.to_string().to_lowercase().contains("audience") {
            ApitapError::Authentication("Invalid audience in token".to_string())
        } else {
            ApitapError::Authentication(format!("token verification failed: {e}"))
        }
    })?;

    let claims = &data.claims;
    let username = claims
        .get(&provider.username_claim)
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let email = provider
        .email_claim
        .as_ref()
        .and_then(|c| claims.get(c))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let roles = provider
        .roles_claim
        .as_ref()
        .and_then(|path| claim_at_path(claims, path))
        .map(values_to_string_set)
        .unwrap_or_default();
    let groups = provider
        .groups_claim
        .as_ref()
        .and_then(|c| claims.get(c))
        .map(values_to_string_set)
        .unwrap_or_default();
    let jti = claims.get("jti").and_then(|v| v.as_str()).map(str::to_string);
    let exp = claims.get("exp").and_then(|v| v.as_u64());

    Ok(AuthContext {
        authenticated: true,
        username,
        email,
        roles,
        groups,
        auth_type: AuthType::Oidc,
        token_jti: jti,
        token_expires_at: exp,
    })
}

/// Walks a dotted claim path like `realm_access.roles` through a JSON value.
fn claim_at_path<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = claims;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn values_to_string_set(value: &Value) -> HashSet<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => std::iter::once(s.clone()).collect(),
        _ => HashSet::new(),
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
