//! Config Loader (C1): YAML parsing, include expansion, env interpolation,
//! and the immutable `Config` graph the rest of the process reads from.

pub mod templating;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::errors::{ApitapError, Result};
use crate::slug::{slug_for_mcp_name, slug_for_path};
use crate::validators::Validator;

/// Named handle to an external data source (spec §3 Connection).
#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub init: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Get
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldLocation {
    Query,
    Path,
    Body,
    Header,
}

/// One request parameter declaration (spec §3 RequestField).
#[derive(Debug, Clone, Deserialize)]
pub struct RequestField {
    pub name: String,
    pub location: FieldLocation,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub validators: Vec<Validator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Read,
    Write,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Operation {
    #[serde(default)]
    pub kind: OperationKind,
    #[serde(default)]
    pub returns_data: bool,
    #[serde(default)]
    pub transaction: bool,
    #[serde(default)]
    pub validate_before_write: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CursorConfig {
    pub column: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetentionConfig {
    pub keep_last_snapshots: Option<u32>,
    /// Duration string like "7d", "6h" — parsed the same way `schedule` is.
    pub max_snapshot_age: Option<String>,
}

/// spec §3 CacheConfig. `strategy` is derived, not declared, per invariant 2.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub table: String,
    #[serde(default = "default_cache_schema")]
    pub schema: String,
    #[serde(default = "default_cache_catalog")]
    pub catalog: String,
    pub schedule: String,
    #[serde(default)]
    pub primary_key: Option<Vec<String>>,
    #[serde(default)]
    pub cursor: Option<CursorConfig>,
    pub template_file: PathBuf,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_cache_schema() -> String {
    "public".to_string()
}

fn default_cache_catalog() -> String {
    "cache".to_string()
}

/// The cache-strategy decision, fixed once at config-load time (invariant 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    Full,
    Append,
    Merge,
}

impl CacheConfig {
    pub fn strategy(&self) -> CacheStrategy {
        match (&self.cursor, &self.primary_key) {
            (Some(_), Some(_)) => CacheStrategy::Merge,
            (Some(_), None) => CacheStrategy::Append,
            (None, _) => CacheStrategy::Full,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct McpToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct McpResourceConfig {
    pub uri: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct McpPromptConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthOverride {
    #[serde(default)]
    pub required_roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<u32>,
}

/// spec §3 EndpointConfig, as deserialized from a single endpoint YAML file
/// before the identity/reference checks of §4.1 run.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEndpoint {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub mcp_name: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub request_fields: Vec<RequestField>,
    pub template_source: PathBuf,
    pub connection_names: Vec<String>,
    #[serde(default)]
    pub operation: Operation,
    #[serde(default)]
    pub auth: Option<AuthOverride>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub mcp_tool: Option<McpToolConfig>,
    #[serde(default)]
    pub mcp_resource: Option<McpResourceConfig>,
    #[serde(default)]
    pub mcp_prompt: Option<McpPromptConfig>,
}

/// The validated, immutable endpoint, enriched with the load-site bookkeeping
/// the management API needs to locate and rewrite the declaring files.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub raw: RawEndpoint,
    pub slug: String,
    /// YAML file this endpoint was parsed from.
    pub source_file: PathBuf,
    /// Directory `template_source`/`cache.template_file` resolve against.
    pub source_template_dir: PathBuf,
    /// `template_source` resolved to an absolute path.
    pub resolved_template_path: PathBuf,
}

impl EndpointConfig {
    pub fn identity(&self) -> &str {
        self.raw
            .path
            .as_deref()
            .or(self.raw.mcp_name.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "scan-interval", default)]
    pub scan_interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DuckLakeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub metadata_path: Option<String>,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DuckdbConfig {
    pub threads: Option<u32>,
    pub memory_limit: Option<String>,
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalAuthConfig {
    #[serde(default)]
    pub basic: Option<crate::auth::BasicAuthConfig>,
    #[serde(default)]
    pub jwt: Option<crate::auth::JwtAuthConfig>,
    #[serde(default)]
    pub oidc: Vec<crate::auth::OidcProviderConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseFormatConfig {
    #[serde(default)]
    pub enable_csv: bool,
    #[serde(default = "default_true")]
    pub enable_pagination: bool,
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    50
}

/// Pre-validation view of the root YAML (spec §6.1).
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(rename = "project-name")]
    project_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    connections: IndexMap<String, Connection>,
    #[serde(rename = "template-source")]
    template_source: PathBuf,
    #[serde(rename = "environment-whitelist", default)]
    environment_whitelist: Vec<String>,
    #[serde(default)]
    duckdb: DuckdbConfig,
    #[serde(default)]
    ducklake: DuckLakeConfig,
    #[serde(default)]
    auth: GlobalAuthConfig,
    #[serde(rename = "rate-limit", default)]
    rate_limit: RateLimitConfig,
    #[serde(rename = "response-format", default)]
    response_format: ResponseFormatConfig,
}

/// The immutable, process-wide configuration graph. Swapped atomically on
/// reload (behind a `tokio::sync::RwLock` at the call site), never mutated
/// in place.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_name: String,
    pub description: Option<String>,
    pub connections: IndexMap<String, Connection>,
    pub template_source: PathBuf,
    pub environment_whitelist: Vec<String>,
    pub duckdb: DuckdbConfig,
    pub ducklake: DuckLakeConfig,
    pub auth: GlobalAuthConfig,
    pub rate_limit: RateLimitConfig,
    pub response_format: ResponseFormatConfig,
    pub endpoints: Vec<EndpointConfig>,
}

impl Config {
    /// Linear scan, as spec §4.2 explicitly allows for <10^3 endpoints.
    pub fn endpoint_by_slug(&self, slug: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.slug == slug)
    }

    /// Legacy path-based lookup, kept alongside slug lookup per spec §4.2.
    pub fn endpoint_by_path(&self, path: &str) -> Option<&EndpointConfig> {
        self.endpoints
            .iter()
            .find(|e| e.raw.path.as_deref() == Some(path))
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }
}

/// Matches `{{include from <path>}}` and `{{include:<key> from <path>}}`.
fn include_regex() -> Regex {
    Regex::new(r"\{\{\s*include(?::([A-Za-z0-9_.-]+))?\s+from\s+([^}]+?)\s*\}\}").unwrap()
}

/// Recursively expands include directives in `text`, which lives at `base_dir`.
/// `in_progress` guards against include cycles (canonicalized paths).
fn expand_includes(
    text: &str,
    base_dir: &Path,
    in_progress: &mut HashSet<PathBuf>,
) -> Result<String> {
    let re = include_regex();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for cap in re.captures_iter(text) {
        let whole = cap.get(0).unwrap();
        let section_key = cap.get(1).map(|m| m.as_str());
        let rel_path = cap.get(2).unwrap().as_str().trim();

        let include_path = base_dir.join(rel_path);
        let canonical = include_path.canonicalize().map_err(|e| {
            ApitapError::ConfigError(format!(
                "include target '{}' not found: {e}",
                include_path.display()
            ))
        })?;

        if !in_progress.insert(canonical.clone()) {
            return Err(ApitapError::ConfigError(format!(
                "include cycle detected at '{}'",
                include_path.display()
            )));
        }

        let raw = std::fs::read_to_string(&canonical)?;
        let included_dir = canonical.parent().unwrap_or(base_dir).to_path_buf();
        let expanded = expand_includes(&raw, &included_dir, in_progress)?;

        let fragment = match section_key {
            None => expanded,
            Some(key) => {
                let value: serde_yaml::Value = serde_yaml::from_str(&expanded)?;
                let section = value.get(key).ok_or_else(|| {
                    ApitapError::ConfigError(format!(
                        "include key '{key}' not found in '{}'",
                        include_path.display()
                    ))
                })?;
                serde_yaml::to_string(section)?
            }
        };

        in_progress.remove(&canonical);

        out.push_str(&text[last..whole.start()]);
        out.push_str(&fragment);
        last = whole.end();
    }

    out.push_str(&text[last..]);
    Ok(out)
}

/// Replaces `${VAR}` tokens, failing if `VAR` is not in `whitelist`.
fn interpolate_env(text: &str, whitelist: &[String]) -> Result<String> {
    crate::utils::template::substitute_env_vars(text, whitelist)
}

fn preprocess(raw: &str, base_dir: &Path, whitelist: &[String]) -> Result<String> {
    let mut in_progress = HashSet::new();
    let included = expand_includes(raw, base_dir, &mut in_progress)?;
    interpolate_env(&included, whitelist)
}

/// Loads the root YAML at `path` plus every endpoint YAML file discovered
/// under the project's endpoint directory (conventionally `endpoints/`,
/// alongside the root file), returning the fully validated `Config`.
///
/// A malformed root file is fatal. Per-endpoint failures are collected and
/// reported together without preventing sibling endpoints from loading.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let root_raw = std::fs::read_to_string(path)?;
    // First pass without env whitelist enforcement, purely to read the
    // whitelist declaration itself out of the document.
    let mut in_progress = HashSet::new();
    let included = expand_includes(&root_raw, base_dir, &mut in_progress)?;
    let probe: serde_yaml::Value = serde_yaml::from_str(&included)?;
    let whitelist: Vec<String> = probe
        .get("environment-whitelist")
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let final_text = interpolate_env(&included, &whitelist)?;
    let raw_config: RawConfig = serde_yaml::from_str(&final_text)?;

    let mut connections = raw_config.connections.clone();
    for (name, conn) in connections.iter_mut() {
        conn.name = name.clone();
    }

    let endpoints_dir = base_dir.join("endpoints");
    let mut endpoints = Vec::new();
    let mut failures: Vec<(PathBuf, ApitapError)> = Vec::new();

    if endpoints_dir.is_dir() {
        for entry in walkdir::WalkDir::new(&endpoints_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_yaml = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            match load_one_endpoint(entry.path(), &raw_config.template_source, &whitelist) {
                Ok(ep) => endpoints.push(ep),
                Err(e) => failures.push((entry.path().to_path_buf(), e)),
            }
        }
    }

    let endpoints = drop_endpoints_with_unknown_connections(endpoints, &connections, &mut failures);

    if !failures.is_empty() {
        for (path, err) in &failures {
            warn!(path = %path.display(), error = %err, "endpoint failed to load, skipping");
        }
    }

    Ok(Config {
        project_name: raw_config.project_name,
        description: raw_config.description,
        connections,
        template_source: raw_config.template_source,
        environment_whitelist: whitelist,
        duckdb: raw_config.duckdb,
        ducklake: raw_config.ducklake,
        auth: raw_config.auth,
        rate_limit: raw_config.rate_limit,
        response_format: raw_config.response_format,
        endpoints,
    })
}

fn load_one_endpoint(
    path: &Path,
    project_template_root: &Path,
    whitelist: &[String],
) -> Result<EndpointConfig> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let raw_text = std::fs::read_to_string(path)?;
    let expanded = preprocess(&raw_text, &base_dir, whitelist)?;
    let raw: RawEndpoint = serde_yaml::from_str(&expanded)?;

    let has_path = raw.path.is_some();
    let has_mcp_name = raw.mcp_name.is_some();
    if has_path == has_mcp_name {
        return Err(ApitapError::ConfigError(
            "endpoint must declare exactly one of `path` or `mcp_name`".to_string(),
        ));
    }

    if raw.connection_names.is_empty() {
        return Err(ApitapError::ConfigError(
            "endpoint must reference at least one connection".to_string(),
        ));
    }

    let resolved_template_path = base_dir.join(&raw.template_source);
    if !resolved_template_path.is_file() {
        return Err(ApitapError::ConfigError(format!(
            "template_source '{}' does not exist",
            resolved_template_path.display()
        )));
    }

    if let Some(cache) = &raw.cache {
        let cache_template = base_dir.join(&cache.template_file);
        if !cache_template.is_file() {
            return Err(ApitapError::ConfigError(format!(
                "cache.template_file '{}' does not exist",
                cache_template.display()
            )));
        }
    }

    let _ = project_template_root;

    let slug = match (&raw.path, &raw.mcp_name) {
        (Some(p), _) => slug_for_path(p),
        (_, Some(name)) => slug_for_mcp_name(name),
        _ => unreachable!("identity xor-check above"),
    };

    Ok(EndpointConfig {
        raw,
        slug,
        source_file: path.to_path_buf(),
        source_template_dir: base_dir,
        resolved_template_path,
    })
}

/// Drops any endpoint referencing an unknown connection, recording each as a
/// per-endpoint failure rather than aborting the whole load (spec §4.1:
/// "Failures in loading one endpoint must not prevent loading others").
fn drop_endpoints_with_unknown_connections(
    endpoints: Vec<EndpointConfig>,
    connections: &IndexMap<String, Connection>,
    failures: &mut Vec<(PathBuf, ApitapError)>,
) -> Vec<EndpointConfig> {
    endpoints
        .into_iter()
        .filter(|ep| {
            for name in &ep.raw.connection_names {
                if !connections.contains_key(name) {
                    failures.push((
                        ep.source_file.clone(),
                        ApitapError::ConfigError(format!(
                            "endpoint '{}' references unknown connection '{name}'",
                            ep.identity()
                        )),
                    ));
                    return false;
                }
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn loads_root_config_with_no_endpoints() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "flapi.yaml",
            "project-name: demo\ntemplate-source: templates\nconnections:\n  db:\n    properties: {}\n",
        );

        let cfg = load_config_from_path(dir.path().join("flapi.yaml")).unwrap();
        assert_eq!(cfg.project_name, "demo");
        assert!(cfg.endpoints.is_empty());
        assert!(cfg.connections.contains_key("db"));
    }

    #[test]
    fn loads_a_valid_endpoint() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "flapi.yaml",
            "project-name: demo\ntemplate-source: templates\nconnections:\n  db:\n    properties: {}\n",
        );
        write(dir.path(), "endpoints/customers.sql", "SELECT 1");
        write(
            dir.path(),
            "endpoints/customers.yaml",
            "path: /customers/\nconnection_names: [db]\ntemplate_source: customers.sql\n",
        );

        let cfg = load_config_from_path(dir.path().join("flapi.yaml")).unwrap();
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.endpoints[0].slug, "customers-slash");
    }

    #[test]
    fn missing_connection_reference_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "flapi.yaml",
            "project-name: demo\ntemplate-source: templates\nconnections:\n  db:\n    properties: {}\n",
        );
        write(dir.path(), "endpoints/customers.sql", "SELECT 1");
        write(
            dir.path(),
            "endpoints/customers.yaml",
            "path: /customers/\nconnection_names: [missing]\ntemplate_source: customers.sql\n",
        );
        write(dir.path(), "endpoints/orders.sql", "SELECT 1");
        write(
            dir.path(),
            "endpoints/orders.yaml",
            "path: /orders/\nconnection_names: [db]\ntemplate_source: orders.sql\n",
        );

        let cfg = load_config_from_path(dir.path().join("flapi.yaml")).unwrap();
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.endpoints[0].slug, "orders-slash");
    }

    #[test]
    fn endpoint_missing_identity_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "flapi.yaml",
            "project-name: demo\ntemplate-source: templates\nconnections:\n  db:\n    properties: {}\n",
        );
        write(dir.path(), "endpoints/bad.sql", "SELECT 1");
        write(
            dir.path(),
            "endpoints/bad.yaml",
            "connection_names: [db]\ntemplate_source: bad.sql\n",
        );

        let cfg = load_config_from_path(dir.path().join("flapi.yaml")).unwrap();
        assert!(cfg.endpoints.is_empty());
    }

    #[test]
    fn env_var_not_whitelisted_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "flapi.yaml",
            "project-name: ${SECRET}\ntemplate-source: templates\nconnections: {}\n",
        );
        let err = load_config_from_path(dir.path().join("flapi.yaml")).unwrap_err();
        assert!(err.to_string().contains("SECRET"));
    }

    #[test]
    fn include_cycle_is_detected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", "{{include from b.yaml}}");
        write(dir.path(), "b.yaml", "{{include from a.yaml}}");
        write(
            dir.path(),
            "flapi.yaml",
            "project-name: demo\ntemplate-source: templates\nconnections: {}\n{{include from a.yaml}}",
        );

        let err = load_config_from_path(dir.path().join("flapi.yaml")).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn cache_strategy_is_derived_from_cursor_and_primary_key() {
        let full = CacheConfig {
            table: "t".into(),
            schema: "public".into(),
            catalog: "cache".into(),
            schedule: "1h".into(),
            primary_key: None,
            cursor: None,
            template_file: PathBuf::from("t.sql"),
            retention: RetentionConfig::default(),
        };
        assert_eq!(full.strategy(), CacheStrategy::Full);

        let append = CacheConfig {
            cursor: Some(CursorConfig {
                column: "updated_at".into(),
                column_type: "timestamp".into(),
            }),
            ..full.clone()
        };
        assert_eq!(append.strategy(), CacheStrategy::Append);

        let merge = CacheConfig {
            primary_key: Some(vec!["id".into()]),
            ..append
        };
        assert_eq!(merge.strategy(), CacheStrategy::Merge);
    }
}
