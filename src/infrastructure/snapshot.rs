//! Bulk snapshot file format used by the initial-load recovery protocol
//! (§4.6 step 2-4). Grounded on this codebase's WAL storage: a self-describing
//! file under a local directory, written with `bincode` and read back whole.
//! Business-table schemas are owned by the layer this crate sits beside, so
//! segments carry rows as generic JSON objects and are applied with
//! dynamically-built upsert SQL rather than typed structs — see DESIGN.md.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePool;
use sqlx::{Column, Row};
use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::infrastructure::model::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub donor_node_id: NodeId,
    pub created_at: DateTime<Utc>,
    /// Per-node vector-clock entries at the moment the snapshot was taken;
    /// the joiner fast-forwards its own clock to this (§4.6 step 5).
    pub clock_manifest: HashMap<NodeId, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSegment {
    pub table_name: String,
    pub primary_key_column: String,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub header: SnapshotHeader,
    pub segments: Vec<TableSegment>,
}

impl SnapshotFile {
    pub fn total_rows(&self) -> usize {
        self.segments.iter().map(|s| s.rows.len()).sum()
    }
}

/// Dumps `segments` to `dir/<filename>`, creating the directory if needed.
/// Returns the full path and byte size, matching the `{filename, bytes}`
/// donor advertisement (§4.6 step 2).
#[instrument(skip(dir, header, segments))]
pub fn write_snapshot_file(
    dir: &str,
    filename: &str,
    header: SnapshotHeader,
    segments: Vec<TableSegment>,
) -> AppResult<(PathBuf, u64)> {
    std::fs::create_dir_all(dir)
        .map_err(|e| AppError::Recovery(format!("failed to create snapshot directory: {}", e)))?;

    let file = SnapshotFile { header, segments };
    let bytes = bincode::serialize(&file)
        .map_err(|e| AppError::SerializationError(format!("failed to encode snapshot: {}", e)))?;

    let path = Path::new(dir).join(filename);
    std::fs::write(&path, &bytes)
        .map_err(|e| AppError::Recovery(format!("failed to write snapshot file: {}", e)))?;

    Ok((path, bytes.len() as u64))
}

pub fn read_snapshot_file(path: &Path) -> AppResult<SnapshotFile> {
    let bytes = std::fs::read(path)
        .map_err(|e| AppError::Recovery(format!("failed to read snapshot file: {}", e)))?;
    bincode::deserialize(&bytes)
        .map_err(|e| AppError::DeserializationError(format!("corrupt snapshot file: {}", e)))
}

/// Applies one segment with upsert-by-primary-key semantics: insert, or on
/// primary-key conflict overwrite every non-key column with the snapshot's
/// values. Idempotent and safe to retry (§4.6 step 4).
#[instrument(skip(pool, segment))]
pub async fn apply_segment(pool: &SqlitePool, segment: &TableSegment) -> AppResult<u64> {
    let mut applied = 0u64;
    for row in &segment.rows {
        let pk_value = row.get(&segment.primary_key_column).ok_or_else(|| {
            AppError::Recovery(format!(
                "snapshot row for {} missing primary key column {}",
                segment.table_name, segment.primary_key_column
            ))
        })?;

        let mut columns: Vec<&String> = row.keys().collect();
        columns.sort();

        let column_list = columns
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let update_clause = columns
            .iter()
            .filter(|c| **c != &segment.primary_key_column)
            .map(|c| format!("{} = excluded.{}", c, c))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = if update_clause.is_empty() {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO NOTHING",
                segment.table_name, column_list, placeholders, segment.primary_key_column
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
                segment.table_name,
                column_list,
                placeholders,
                segment.primary_key_column,
                update_clause
            )
        };

        let mut query = sqlx::query(&sql);
        for column in &columns {
            let value = &row[*column];
            query = bind_json_value(query, value);
        }

        query
            .execute(pool)
            .await
            .map_err(|e| AppError::Recovery(format!("snapshot upsert failed: {}", e)))?;
        applied += 1;
        let _ = pk_value;
    }
    Ok(applied)
}

fn bind_json_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Exports every row of `table_names` into segments, for the donor side of
/// the protocol. Generic over arbitrary business schemas: every column comes
/// back as JSON via sqlx's dynamic row access.
#[instrument(skip(pool))]
pub async fn export_segments(
    pool: &SqlitePool,
    tables: &[(&str, &str)], // (table_name, primary_key_column)
) -> AppResult<Vec<TableSegment>> {
    let mut segments = Vec::new();
    for (table_name, pk_column) in tables {
        let sql = format!("SELECT * FROM {}", table_name);
        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .map_err(|e| AppError::Recovery(format!("failed to export table {}: {}", table_name, e)))?;

        let mut out_rows = Vec::with_capacity(rows.len());
        for row in rows {
            let mut map = Map::new();
            for column in row.columns() {
                let name = column.name();
                let value: Value = row
                    .try_get::<Option<String>, _>(name)
                    .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                    .or_else(|_| row.try_get::<Option<i64>, _>(name).map(|v| v.map(Value::from).unwrap_or(Value::Null)))
                    .unwrap_or(Value::Null);
                map.insert(name.to_string(), value);
            }
            out_rows.push(map);
        }

        segments.push(TableSegment {
            table_name: table_name.to_string(),
            primary_key_column: pk_column.to_string(),
            rows: out_rows,
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Executor;

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = HashMap::new();
        manifest.insert("node-a".to_string(), 5u64);

        let mut row = Map::new();
        row.insert("id".into(), Value::String("r1".into()));
        row.insert("name".into(), Value::String("alpha".into()));

        let (path, bytes) = write_snapshot_file(
            dir.path().to_str().unwrap(),
            "snap-1.bin",
            SnapshotHeader {
                donor_node_id: "node-a".into(),
                created_at: Utc::now(),
                clock_manifest: manifest,
            },
            vec![TableSegment {
                table_name: "widgets".into(),
                primary_key_column: "id".into(),
                rows: vec![row],
            }],
        )
        .unwrap();

        assert!(bytes > 0);
        let loaded = read_snapshot_file(&path).unwrap();
        assert_eq!(loaded.total_rows(), 1);
        assert_eq!(loaded.header.donor_node_id, "node-a");
    }

    #[tokio::test]
    async fn apply_segment_upserts_idempotently() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        pool.execute("CREATE TABLE widgets (id TEXT PRIMARY KEY, name TEXT)")
            .await
            .unwrap();

        let mut row = Map::new();
        row.insert("id".into(), Value::String("r1".into()));
        row.insert("name".into(), Value::String("alpha".into()));
        let segment = TableSegment {
            table_name: "widgets".into(),
            primary_key_column: "id".into(),
            rows: vec![row.clone()],
        };

        apply_segment(&pool, &segment).await.unwrap();
        apply_segment(&pool, &segment).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM widgets")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
