//! Embedded SQL execution surface (spec §4.5).
//!
//! Wraps a single process-wide [`datafusion::execution::context::SessionContext`],
//! mirroring the teacher's one-context-per-run idiom from `cmd::run_pipeline`
//! (there a context-shaped object is threaded through the whole pipeline run;
//! here it is long-lived and shared across requests behind an `Arc`).

use std::sync::Arc;

use datafusion::arrow::array::{Array, BooleanArray, Float64Array, Int64Array, RecordBatch};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::util::display::{ArrayFormatter, FormatOptions};
use datafusion::catalog::{CatalogProvider, MemoryCatalogProvider, MemorySchemaProvider};
use datafusion::execution::context::SessionContext;
use datafusion::prelude::{ParquetReadOptions, SessionConfig};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::errors::{ApitapError, Result};

/// Name under which the cache engine's on-disk tables are attached (spec §6.1's
/// `ducklake{...}` config block resolves to this catalog).
pub const CACHE_CATALOG: &str = "cache";

/// A single row of query output, keyed by output column name.
pub type Row = Map<String, Value>;

/// Thin, cloneable handle onto the shared DataFusion engine.
#[derive(Clone)]
pub struct SqlEngine {
    ctx: Arc<SessionContext>,
}

impl SqlEngine {
    /// Builds a fresh engine with default session configuration.
    pub fn new() -> Self {
        let config = SessionConfig::new().with_information_schema(true);
        Self {
            ctx: Arc::new(SessionContext::new_with_config(config)),
        }
    }

    /// Registers the cache engine's on-disk catalog, creating it if absent.
    pub fn attach_catalog(&self, name: &str) -> Result<()> {
        if self.ctx.catalog(name).is_none() {
            let catalog = Arc::new(MemoryCatalogProvider::new());
            catalog
                .register_schema("public", Arc::new(MemorySchemaProvider::new()))
                .map_err(ApitapError::Datafusion)?;
            self.ctx.register_catalog(name, catalog);
        }
        Ok(())
    }

    /// Registers a Parquet file as a queryable table under `table_name`.
    #[instrument(skip(self))]
    pub async fn register_parquet_table(&self, table_name: &str, path: &str) -> Result<()> {
        self.ctx
            .register_parquet(table_name, path, ParquetReadOptions::default())
            .await?;
        debug!(table = table_name, path, "registered parquet table");
        Ok(())
    }

    /// Registers a CSV file as a queryable table under `table_name`.
    pub async fn register_csv_table(&self, table_name: &str, path: &str) -> Result<()> {
        self.ctx
            .register_csv(table_name, path, Default::default())
            .await?;
        Ok(())
    }

    /// Runs `sql` and returns every row as a JSON object, column name to value.
    #[instrument(skip(self, sql), fields(sql_len = sql.len()))]
    pub async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        let df = self.ctx.sql(sql).await.map_err(ApitapError::Datafusion)?;
        let batches = df.collect().await.map_err(ApitapError::Datafusion)?;
        batches_to_rows(&batches)
    }

    /// Runs `sql` and returns exactly one scalar value from row 0, column 0.
    /// Used for management/introspection queries (e.g. row counts).
    pub async fn execute_scalar(&self, sql: &str) -> Result<Value> {
        let rows = self.execute(sql).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| ApitapError::Database("query returned no rows".to_string()))?;
        row.into_values()
            .next()
            .ok_or_else(|| ApitapError::Database("query returned no columns".to_string()))
    }
}

impl Default for SqlEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// How a column's cells are converted to JSON. Integer/float/boolean columns
/// keep their native JSON type; everything else falls back to the same
/// textual rendering DataFusion's CLI uses.
enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
}

fn classify(data_type: &DataType) -> ColumnKind {
    use DataType::*;
    match data_type {
        Boolean => ColumnKind::Bool,
        Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64 => ColumnKind::Int,
        Float16 | Float32 | Float64 => ColumnKind::Float,
        _ => ColumnKind::Text,
    }
}

/// Converts Arrow `RecordBatch`es into row-major JSON objects, mapping
/// integer/float/boolean columns onto the matching `serde_json::Value`
/// variant rather than stringifying every cell.
fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for batch in batches {
        let schema = batch.schema();
        let kinds: Vec<ColumnKind> = schema.fields().iter().map(|f| classify(f.data_type())).collect();

        let formatters: Vec<_> = batch
            .columns()
            .iter()
            .map(|col| {
                ArrayFormatter::try_new(col.as_ref(), &FormatOptions::default())
                    .map_err(ApitapError::Arrow)
            })
            .collect::<Result<_>>()?;

        let casted: Vec<Option<datafusion::arrow::array::ArrayRef>> = batch
            .columns()
            .iter()
            .zip(&kinds)
            .map(|(col, kind)| match kind {
                ColumnKind::Int => cast(col, &DataType::Int64).map(Some).map_err(ApitapError::Arrow),
                ColumnKind::Float => cast(col, &DataType::Float64).map(Some).map_err(ApitapError::Arrow),
                ColumnKind::Bool | ColumnKind::Text => Ok(None),
            })
            .collect::<Result<_>>()?;

        for row_idx in 0..batch.num_rows() {
            let mut row = Map::new();
            for (col_idx, field) in schema.fields().iter().enumerate() {
                let value = if batch.column(col_idx).is_null(row_idx) {
                    Value::Null
                } else {
                    match kinds[col_idx] {
                        ColumnKind::Bool => {
                            let arr = batch.column(col_idx).as_any().downcast_ref::<BooleanArray>().unwrap();
                            Value::Bool(arr.value(row_idx))
                        }
                        ColumnKind::Int => {
                            let arr = casted[col_idx]
                                .as_ref()
                                .unwrap()
                                .as_any()
                                .downcast_ref::<Int64Array>()
                                .unwrap();
                            Value::from(arr.value(row_idx))
                        }
                        ColumnKind::Float => {
                            let arr = casted[col_idx]
                                .as_ref()
                                .unwrap()
                                .as_any()
                                .downcast_ref::<Float64Array>()
                                .unwrap();
                            serde_json::Number::from_f64(arr.value(row_idx))
                                .map(Value::Number)
                                .unwrap_or(Value::Null)
                        }
                        ColumnKind::Text => {
                            let rendered = formatters[col_idx]
                                .value(row_idx)
                                .try_to_string()
                                .map_err(ApitapError::Arrow)?;
                            Value::String(rendered)
                        }
                    }
                };
                row.insert(field.name().clone(), value);
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_select_returns_one_row() {
        let engine = SqlEngine::new();
        let rows = engine.execute("SELECT 1 AS n, 'a' AS s").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], Value::from(1));
        assert_eq!(rows[0]["s"], Value::String("a".to_string()));
    }

    #[tokio::test]
    async fn execute_scalar_extracts_first_cell() {
        let engine = SqlEngine::new();
        let v = engine.execute_scalar("SELECT 42 AS only_col").await.unwrap();
        assert_eq!(v, Value::from(42));
    }

    #[tokio::test]
    async fn boolean_and_float_columns_keep_their_native_json_type() {
        let engine = SqlEngine::new();
        let rows = engine
            .execute("SELECT true AS flag, 1.5 AS ratio")
            .await
            .unwrap();
        assert_eq!(rows[0]["flag"], Value::Bool(true));
        assert_eq!(rows[0]["ratio"], serde_json::json!(1.5));
    }

    #[tokio::test]
    async fn execute_scalar_errors_on_empty_result() {
        let engine = SqlEngine::new();
        let rows = engine
            .execute("SELECT 1 AS n WHERE 1=0")
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn attach_catalog_is_idempotent() {
        let engine = SqlEngine::new();
        engine.attach_catalog(CACHE_CATALOG).unwrap();
        engine.attach_catalog(CACHE_CATALOG).unwrap();
        assert!(engine.ctx.catalog(CACHE_CATALOG).is_some());
    }

    #[tokio::test]
    async fn invalid_sql_maps_to_database_error() {
        let engine = SqlEngine::new();
        let err = engine.execute("SELEKT 1").await.unwrap_err();
        assert!(matches!(err, ApitapError::Datafusion(_)));
    }
}
