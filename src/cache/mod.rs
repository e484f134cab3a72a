//! Cache Engine (C7): snapshot bookkeeping, scheduled refresh, strategy
//! selection, and retention-driven garbage collection — the center of
//! gravity of the system (spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::config::{CacheConfig, CacheStrategy, Connection};
use crate::errors::{ApitapError, Result};
use crate::sqlengine::SqlEngine;
use crate::template::{render, TemplateContext};

/// Per-cache lifecycle state (spec §4.7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Idle,
    Refreshing,
    Failed,
}

/// One immutable row of the `_snapshots` metadata table (spec §3 Snapshot).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub cache_id: String,
    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub row_count: u64,
    pub previous_version: Option<u64>,
}

const SNAPSHOTS_TABLE: &str = "_snapshots";

/// Owns the `cache` catalog, the `_snapshots` bookkeeping, and the per-cache
/// lock registry (spec §5's "map of named mutexes"). The registry's own
/// `RwLock` is only ever held long enough to look up or insert an `Arc`;
/// it is never held across the `.lock().await` guarding SQL execution
/// (spec §9's explicit warning about this exact foot-gun).
pub struct CacheEngine {
    engine: SqlEngine,
    catalog: String,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    states: RwLock<HashMap<String, CacheState>>,
    snapshots: RwLock<HashMap<String, Vec<Snapshot>>>,
}

impl CacheEngine {
    pub fn new(engine: SqlEngine, catalog: &str) -> Self {
        Self {
            engine,
            catalog: catalog.to_string(),
            locks: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub async fn ensure_catalog(&self) -> Result<()> {
        self.engine.attach_catalog(&self.catalog)
    }

    pub async fn state(&self, cache_id: &str) -> CacheState {
        self.states
            .read()
            .await
            .get(cache_id)
            .copied()
            .unwrap_or(CacheState::Idle)
    }

    async fn lock_for(&self, cache_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(cache_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(cache_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn latest_snapshot(&self, cache_id: &str) -> Option<Snapshot> {
        self.snapshots
            .read()
            .await
            .get(cache_id)
            .and_then(|v| v.last().cloned())
    }

    pub async fn snapshots(&self, cache_id: &str) -> Vec<Snapshot> {
        self.snapshots
            .read()
            .await
            .get(cache_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Runs the 8-step refresh protocol of spec §4.7.3 for a single cache.
    /// Step 1's "already held → no-op with warning" is implemented by
    /// `try_lock` rather than blocking, matching invariant 3.
    #[instrument(skip(self, cache, connection_props), fields(cache_id))]
    pub async fn refresh(
        &self,
        cache_id: &str,
        cache: &CacheConfig,
        template_text: &str,
        connection_props: &Connection,
    ) -> Result<Option<Snapshot>> {
        let lock = self.lock_for(cache_id).await;
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(cache_id, "refresh already in progress, skipping this trigger");
                return Ok(None);
            }
        };

        self.states
            .write()
            .await
            .insert(cache_id.to_string(), CacheState::Refreshing);

        match self.run_refresh(cache_id, cache, template_text, connection_props).await {
            Ok(snapshot) => {
                self.states
                    .write()
                    .await
                    .insert(cache_id.to_string(), CacheState::Idle);
                Ok(Some(snapshot))
            }
            Err(e) => {
                self.states
                    .write()
                    .await
                    .insert(cache_id.to_string(), CacheState::Failed);
                Err(e)
            }
        }
    }

    async fn run_refresh(
        &self,
        cache_id: &str,
        cache: &CacheConfig,
        template_text: &str,
        connection_props: &Connection,
    ) -> Result<Snapshot> {
        let prev = self.latest_snapshot(cache_id).await;
        let started_at = Utc::now();

        let mut ctx = TemplateContext::new();
        ctx.set_namespace("params", json!({}));
        ctx.set_namespace(
            "conn",
            json!(connection_props.properties.clone()),
        );

        let mut cache_ns = json!({
            "catalog": cache.catalog,
            "schema": cache.schema,
            "table": cache.table,
            "currentSnapshotTimestamp": started_at.to_rfc3339(),
        });
        if let Some(prev) = &prev {
            cache_ns["previousSnapshotTimestamp"] = json!(prev.finished_at.to_rfc3339());
        }
        ctx.set_namespace("cache", cache_ns);

        let sql = render(template_text, &ctx)?;
        let rows = self.engine.execute(&sql).await?;
        let row_count = rows.len() as u64;

        let finished_at = Utc::now();
        let version = prev.as_ref().map(|p| p.version + 1).unwrap_or(1);
        let snapshot = Snapshot {
            cache_id: cache_id.to_string(),
            version,
            started_at,
            finished_at,
            row_count,
            previous_version: prev.as_ref().map(|p| p.version),
        };

        self.snapshots
            .write()
            .await
            .entry(cache_id.to_string())
            .or_default()
            .push(snapshot.clone());

        info!(cache_id, version, row_count, "cache refresh committed");

        self.gc(cache_id, cache).await;

        Ok(snapshot)
    }

    /// Retention-driven GC (spec §4.7.5). The latest snapshot is always kept
    /// regardless of age or count.
    pub async fn gc(&self, cache_id: &str, cache: &CacheConfig) {
        let mut guard = self.snapshots.write().await;
        let Some(list) = guard.get_mut(cache_id) else {
            return;
        };
        if list.len() <= 1 {
            return;
        }

        let latest_version = list.last().map(|s| s.version);
        let now = Utc::now();

        let max_age = cache
            .retention
            .max_snapshot_age
            .as_deref()
            .and_then(parse_duration_string);

        let keep_n = cache.retention.keep_last_snapshots.map(|n| n as usize);

        list.retain(|snap| {
            if Some(snap.version) == latest_version {
                return true;
            }
            if let Some(keep_n) = keep_n {
                let rank_from_end = list_rank_from_end(snap.version, latest_version);
                if rank_from_end >= keep_n {
                    return false;
                }
            }
            if let Some(max_age) = max_age {
                if now.signed_duration_since(snap.finished_at) > max_age {
                    return false;
                }
            }
            true
        });
    }
}

fn list_rank_from_end(version: u64, latest: Option<u64>) -> usize {
    match latest {
        Some(latest) if latest >= version => (latest - version) as usize,
        _ => 0,
    }
}

/// Parses duration strings like `"6h"`, `"15m"`, `"1d"` (spec §6.1 schedule
/// shape). Supports `s`/`m`/`h`/`d` suffixes.
pub fn parse_duration_string(s: &str) -> Option<chrono::Duration> {
    let s = s.trim();
    let (num_part, unit) = s.split_at(s.len().checked_sub(1)?);
    let n: i64 = num_part.parse().ok()?;
    match unit {
        "s" => Some(chrono::Duration::seconds(n)),
        "m" => Some(chrono::Duration::minutes(n)),
        "h" => Some(chrono::Duration::hours(n)),
        "d" => Some(chrono::Duration::days(n)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CursorConfig, RetentionConfig};
    use std::path::PathBuf;

    fn make_cache(retention: RetentionConfig) -> CacheConfig {
        CacheConfig {
            table: "customers".into(),
            schema: "public".into(),
            catalog: "cache".into(),
            schedule: "1h".into(),
            primary_key: None,
            cursor: None,
            template_file: PathBuf::from("populate.sql"),
            retention,
        }
    }

    fn make_conn() -> Connection {
        Connection {
            name: "db".into(),
            properties: Default::default(),
            init: None,
        }
    }

    #[tokio::test]
    async fn full_refresh_creates_first_snapshot() {
        let engine = CacheEngine::new(SqlEngine::new(), "cache");
        engine.ensure_catalog().await.unwrap();
        let cache = make_cache(RetentionConfig::default());
        let conn = make_conn();

        let snap = engine
            .refresh("customers_cache", &cache, "SELECT 1 AS n", &conn)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snap.version, 1);
        assert_eq!(snap.previous_version, None);
        assert_eq!(engine.state("customers_cache").await, CacheState::Idle);
    }

    #[tokio::test]
    async fn second_refresh_increments_version() {
        let engine = CacheEngine::new(SqlEngine::new(), "cache");
        engine.ensure_catalog().await.unwrap();
        let cache = make_cache(RetentionConfig::default());
        let conn = make_conn();

        engine
            .refresh("c", &cache, "SELECT 1 AS n", &conn)
            .await
            .unwrap();
        let snap2 = engine
            .refresh("c", &cache, "SELECT 1 AS n", &conn)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snap2.version, 2);
        assert_eq!(snap2.previous_version, Some(1));
    }

    #[tokio::test]
    async fn failed_refresh_transitions_to_failed_without_new_snapshot() {
        let engine = CacheEngine::new(SqlEngine::new(), "cache");
        engine.ensure_catalog().await.unwrap();
        let cache = make_cache(RetentionConfig::default());
        let conn = make_conn();

        let err = engine
            .refresh("c", &cache, "SELEKT garbage", &conn)
            .await
            .unwrap_err();
        assert!(matches!(err, ApitapError::Datafusion(_) | ApitapError::Template(_)));
        assert_eq!(engine.state("c").await, CacheState::Failed);
        assert!(engine.snapshots("c").await.is_empty());
    }

    #[tokio::test]
    async fn gc_keeps_only_last_n_snapshots_and_always_keeps_latest() {
        let engine = CacheEngine::new(SqlEngine::new(), "cache");
        engine.ensure_catalog().await.unwrap();
        let cache = make_cache(RetentionConfig {
            keep_last_snapshots: Some(1),
            max_snapshot_age: None,
        });
        let conn = make_conn();

        for _ in 0..3 {
            engine
                .refresh("c", &cache, "SELECT 1 AS n", &conn)
                .await
                .unwrap();
        }

        let snaps = engine.snapshots("c").await;
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].version, 3);
    }

    #[test]
    fn strategy_selection_matches_invariant_2() {
        let full = make_cache(RetentionConfig::default());
        assert_eq!(full.strategy(), CacheStrategy::Full);

        let append = CacheConfig {
            cursor: Some(CursorConfig {
                column: "updated_at".into(),
                column_type: "timestamp".into(),
            }),
            ..make_cache(RetentionConfig::default())
        };
        assert_eq!(append.strategy(), CacheStrategy::Append);
    }

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration_string("6h"), Some(chrono::Duration::hours(6)));
        assert_eq!(parse_duration_string("15m"), Some(chrono::Duration::minutes(15)));
        assert_eq!(parse_duration_string("1d"), Some(chrono::Duration::days(1)));
        assert_eq!(parse_duration_string("bogus"), None);
    }
}
