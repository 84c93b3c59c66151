use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};

use super::Partition;

/// Key-path entry database operations
pub struct KvRepo;

impl KvRepo {
    pub async fn get(pool: &Pool<Sqlite>, partition: Partition, path: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM kv_entries WHERE partition = ? AND path = ?")
                .bind(partition.as_str())
                .bind(path)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn upsert(pool: &Pool<Sqlite>, partition: Partition, path: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (partition, path, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(partition, path) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(partition.as_str())
        .bind(path)
        .bind(value)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete(pool: &Pool<Sqlite>, partition: Partition, path: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE partition = ? AND path = ?")
            .bind(partition.as_str())
            .bind(path)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// List entries whose path starts with `prefix`, ordered by path
    pub async fn list_prefix(pool: &Pool<Sqlite>, partition: Partition, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT path, value FROM kv_entries WHERE partition = ? AND instr(path, ?) = 1 ORDER BY path",
        )
        .bind(partition.as_str())
        .bind(prefix)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("path"), row.get("value")))
            .collect())
    }
}
