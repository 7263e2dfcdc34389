//! SQLite database layer

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::{Error, Result};

/// Initialize the database connection pool
pub async fn init(database_url: &str) -> anyhow::Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        if let Some(path) = path.split('?').next() {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Enable WAL mode for better concurrent performance
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Encode a timestamp for storage.
///
/// Fixed precision keeps the text lexicographically ordered, which the
/// reconciliation queries rely on when comparing timestamps in SQL.
pub fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp
pub fn parse_ts(value: &str, field: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))?
        .with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}
