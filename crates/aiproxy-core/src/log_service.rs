//! Log Service (spec §4.5): filter-and-stream historical request logs to
//! CSV.
//!
//! `RelationalStore::export_logs` already builds the window-function query
//! that collapses to one row per `key_hash` (the latest by `timestamp DESC,
//! id DESC`); this module owns the filter shape, the `LIKE` escaping it
//! relies on, and turning the decrypted rows into CSV (grounded on
//! `mockforge-analytics::export`'s `export_to_csv<W: Write>` shape).

use crate::db::{ExportedLogRow, RelationalStore};
use crate::encryption::EncryptionService;
use crate::error::Result;
use crate::model::RequestType;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::sync::Arc;

/// Scope applied to one `ExportLogs` call (spec §4.5). Every field is
/// optional; an absent field is not included in the `WHERE` clause at all.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub parent_group_name: Option<String>,
    pub group_name: Option<String>,
    pub key_hash: Option<String>,
    pub model: Option<String>,
    pub is_success: Option<bool>,
    pub request_type: Option<RequestType>,
    pub status_code: Option<i32>,
    pub source_ip: Option<String>,
    pub error_contains: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Escapes `%`, `_`, and the escape character itself for a `LIKE ...
/// ESCAPE '!'` pattern (spec §4.5), then wraps the term in `%...%` for a
/// substring match.
pub fn escape_like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        match ch {
            '!' | '%' | '_' => {
                escaped.push('!');
                escaped.push(ch);
            }
            other => escaped.push(other),
        }
    }
    escaped.push('%');
    escaped
}

/// Filters and streams historical logs as CSV (spec §4.5).
pub struct LogService {
    db: Arc<RelationalStore>,
    encryption: Arc<EncryptionService>,
}

impl LogService {
    pub fn new(db: Arc<RelationalStore>, encryption: Arc<EncryptionService>) -> Arc<Self> {
        Arc::new(Self { db, encryption })
    }

    /// Fetches the filtered, deduped rows without writing CSV; exposed for
    /// callers that want the decrypted rows directly (e.g. a JSON export).
    pub async fn fetch(&self, filter: &LogFilter) -> Result<Vec<DecryptedLogRow>> {
        let rows = self.db.export_logs(filter).await?;
        Ok(rows.into_iter().map(|row| self.decrypt_row(row)).collect())
    }

    fn decrypt_row(&self, row: ExportedLogRow) -> DecryptedLogRow {
        let key_value = match &row.key_value {
            Some(encrypted) => self
                .encryption
                .decrypt(encrypted)
                .unwrap_or_else(|_| "failed-to-decrypt".to_string()),
            None => "failed-to-decrypt".to_string(),
        };
        DecryptedLogRow {
            key_hash: row.key_hash,
            key_value,
            group_name: row.group_name,
            model: row.model,
            is_success: row.is_success,
            status_code: row.status_code,
            timestamp: row.timestamp,
        }
    }

    /// Writes the filtered export as CSV, one row per distinct `key_hash`
    /// (spec §4.5). Returns the row count written.
    pub async fn export_to_csv<W: Write>(&self, writer: &mut W, filter: &LogFilter) -> Result<usize> {
        writeln!(writer, "key_hash,key_value,group_name,model,is_success,status_code,timestamp")?;

        let rows = self.fetch(filter).await?;
        for row in &rows {
            writeln!(
                writer,
                "{},{},{},{},{},{},{}",
                csv_escape(&row.key_hash),
                csv_escape(&row.key_value),
                csv_escape(&row.group_name),
                csv_escape(row.model.as_deref().unwrap_or("")),
                row.is_success,
                row.status_code,
                row.timestamp.to_rfc3339(),
            )?;
        }
        Ok(rows.len())
    }
}

/// One decrypted, filtered export row (spec §4.5): `key_value` is the
/// decrypted credential, or the literal `"failed-to-decrypt"`.
#[derive(Debug, Clone)]
pub struct DecryptedLogRow {
    pub key_hash: String,
    pub key_value: String,
    pub group_name: String,
    pub model: Option<String>,
    pub is_success: bool,
    pub status_code: i32,
    pub timestamp: DateTime<Utc>,
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbPool;
    use crate::model::RequestLog;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_db() -> Arc<RelationalStore> {
        let pool = SqlitePoolOptions::new().connect(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE request_logs (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                group_id INTEGER NOT NULL,
                parent_group_id INTEGER,
                group_name TEXT NOT NULL,
                parent_group_name TEXT,
                key_hash TEXT,
                is_success INTEGER NOT NULL,
                status_code INTEGER NOT NULL,
                request_type TEXT NOT NULL,
                is_stream INTEGER NOT NULL,
                model TEXT,
                source_ip TEXT,
                request_path TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                key_hash TEXT NOT NULL,
                key_value BLOB NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                request_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        Arc::new(RelationalStore::new(DbPool::Sqlite(pool)))
    }

    fn test_encryption() -> Arc<EncryptionService> {
        Arc::new(EncryptionService::generate().0)
    }

    fn log(id: &str, key_hash: &str, timestamp: DateTime<Utc>, is_success: bool, status_code: i32) -> RequestLog {
        RequestLog {
            id: id.to_string(),
            timestamp,
            group_id: 1,
            parent_group_id: None,
            group_name: "g1".to_string(),
            parent_group_name: None,
            key_hash: Some(key_hash.to_string()),
            is_success,
            status_code,
            request_type: RequestType::Final,
            is_stream: false,
            model: Some("gpt-4".to_string()),
            source_ip: None,
            request_path: "/v1/chat/completions".to_string(),
            duration_ms: 10,
            error_message: None,
        }
    }

    #[test]
    fn escape_like_pattern_escapes_wildcards_and_self() {
        assert_eq!(escape_like_pattern("50%_off!"), "%50!%!_off!!!%");
    }

    #[test]
    fn csv_escape_quotes_fields_with_commas() {
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("has\"quote"), "\"has\"\"quote\"");
    }

    #[tokio::test]
    async fn export_deduplicates_to_latest_row_per_key_hash_and_decrypts() {
        let db = test_db().await;
        let encryption = test_encryption();
        let encrypted = encryption.encrypt("sk-test-key").unwrap();
        db.insert_key(1, "hash-a", &encrypted).await.unwrap();

        let older = log("log-1", "hash-a", Utc::now() - chrono::Duration::minutes(5), false, 500);
        let newer = log("log-2", "hash-a", Utc::now(), true, 200);
        db.insert_logs(&[older, newer]).await.unwrap();

        let service = LogService::new(db, encryption);
        let rows = service.fetch(&LogFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_success);
        assert_eq!(rows[0].key_value, "sk-test-key");
    }

    #[tokio::test]
    async fn missing_key_yields_failed_to_decrypt_without_dropping_the_row() {
        let db = test_db().await;
        let encryption = test_encryption();
        db.insert_logs(&[log("log-1", "hash-gone", Utc::now(), true, 200)])
            .await
            .unwrap();

        let service = LogService::new(db, encryption);
        let rows = service.fetch(&LogFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key_value, "failed-to-decrypt");
    }

    #[tokio::test]
    async fn filter_by_group_name_and_is_success_narrows_export() {
        let db = test_db().await;
        let encryption = test_encryption();
        let encrypted = encryption.encrypt("sk-test-key").unwrap();
        db.insert_key(1, "hash-a", &encrypted).await.unwrap();
        db.insert_logs(&[
            log("log-1", "hash-a", Utc::now(), true, 200),
            log("log-2", "hash-b", Utc::now(), false, 500),
        ])
        .await
        .unwrap();

        let service = LogService::new(db, encryption);
        let rows = service
            .fetch(&LogFilter {
                is_success: Some(false),
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key_hash, "hash-b");
    }

    #[tokio::test]
    async fn csv_export_writes_header_and_rows() {
        let db = test_db().await;
        let encryption = test_encryption();
        let encrypted = encryption.encrypt("sk-test-key").unwrap();
        db.insert_key(1, "hash-a", &encrypted).await.unwrap();
        db.insert_logs(&[log("log-1", "hash-a", Utc::now(), true, 200)])
            .await
            .unwrap();

        let service = LogService::new(db, encryption);
        let mut buf = Vec::new();
        let count = service.export_to_csv(&mut buf, &LogFilter::default()).await.unwrap();
        assert_eq!(count, 1);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("key_hash,key_value,group_name,model,is_success,status_code,timestamp\n"));
        assert!(text.contains("hash-a,sk-test-key,g1,gpt-4,true,200,"));
    }
}
