//! SQLite-backed idempotency index.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  The async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::IdempotencyIndex;

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Idempotency index backed by a single SQLite database file.
pub struct SqliteIdempotencyIndex {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteIdempotencyIndex {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.apply_pragmas()?;
        index.init_db()?;
        Ok(index)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the table if it does not already exist.  Safe to call on
    /// every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key_hash   TEXT PRIMARY KEY,
                upload_id  TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now_rfc3339()],
        )?;
        Ok(())
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl IdempotencyIndex for SqliteIdempotencyIndex {
    fn lookup(
        &self,
        key_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key_hash = key_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let upload_id = conn
                .query_row(
                    "SELECT upload_id FROM idempotency_keys WHERE key_hash = ?1",
                    params![key_hash],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(upload_id)
        })
    }

    fn record(
        &self,
        key_hash: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key_hash = key_hash.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO idempotency_keys (key_hash, upload_id, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key_hash) DO UPDATE SET
                     upload_id = excluded.upload_id,
                     created_at = excluded.created_at",
                params![key_hash, upload_id, now_rfc3339()],
            )?;
            Ok(())
        })
    }
}
