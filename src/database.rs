use std::fmt;
use std::path::Path;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::chrono::{DateTime, FixedOffset};
use sqlx::{FromRow, SqlitePool};
use crate::error::Result;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    cadence TEXT NOT NULL,
    folder_name TEXT NOT NULL,
    database_name TEXT NOT NULL,
    status TEXT NOT NULL,
    duration_seconds INTEGER NOT NULL DEFAULT 0,
    collections_count INTEGER NOT NULL DEFAULT 0,
    documents_count INTEGER NOT NULL DEFAULT 0,
    indexes_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    backup_size_bytes INTEGER NOT NULL DEFAULT 0,
    log_text TEXT NOT NULL DEFAULT '',
    UNIQUE (cadence, folder_name)
)";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
            Cadence::Yearly => "yearly",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Running => "running",
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// One row per attempt, immutable once written.
#[derive(Serialize, Debug, Clone, FromRow)]
pub struct BackupRecord {
    pub id: i64,
    pub timestamp: DateTime<FixedOffset>,
    pub cadence: Cadence,
    pub folder_name: String,
    pub database_name: String,
    pub status: BackupStatus,
    pub duration_seconds: i64,
    pub collections_count: i64,
    pub documents_count: i64,
    pub indexes_count: i64,
    pub error_message: Option<String>,
    pub backup_size_bytes: i64,
    pub log_text: String,
}

#[derive(Debug, Clone)]
pub struct NewBackupRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub cadence: Cadence,
    pub folder_name: String,
    pub database_name: String,
    pub status: BackupStatus,
    pub duration_seconds: i64,
    pub collections_count: i64,
    pub documents_count: i64,
    pub indexes_count: i64,
    pub error_message: Option<String>,
    pub backup_size_bytes: i64,
    pub log_text: String,
}

#[derive(Debug, Default, Clone)]
pub struct QueryFilter {
    pub status: Option<BackupStatus>,
    pub since: Option<DateTime<FixedOffset>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(path: &Path) -> Result<Database> {
        // WAL keeps the dashboard readable while a backup settles.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Database { pool })
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Database> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Database { pool })
    }

    pub async fn insert(&self, record: &NewBackupRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO backups (timestamp, cadence, folder_name, database_name, status, \
             duration_seconds, collections_count, documents_count, indexes_count, \
             error_message, backup_size_bytes, log_text) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(record.timestamp)
        .bind(record.cadence)
        .bind(&record.folder_name)
        .bind(&record.database_name)
        .bind(record.status)
        .bind(record.duration_seconds)
        .bind(record.collections_count)
        .bind(record.documents_count)
        .bind(record.indexes_count)
        .bind(&record.error_message)
        .bind(record.backup_size_bytes)
        .bind(&record.log_text)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    // Newest first; ties on the textual timestamp break by insertion order.
    pub async fn query(&self, cadence: Cadence, filter: &QueryFilter) -> Result<Vec<BackupRecord>> {
        let mut sql = String::from("SELECT * FROM backups WHERE cadence = ?");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND datetime(timestamp) >= datetime(?)");
        }
        sql.push_str(" ORDER BY datetime(timestamp) DESC, id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, BackupRecord>(&sql).bind(cadence);
        if let Some(status) = filter.status {
            query = query.bind(status);
        }
        if let Some(since) = filter.since {
            query = query.bind(since);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn count_since(
        &self,
        cadence: Cadence,
        status: BackupStatus,
        since: DateTime<FixedOffset>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backups \
             WHERE cadence = $1 AND status = $2 AND datetime(timestamp) >= datetime($3)",
        )
        .bind(cadence)
        .bind(status)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
