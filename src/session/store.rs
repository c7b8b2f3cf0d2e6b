//! Session persistence
//!
//! The connection core only talks to the [`SessionStore`] trait. The SQLite
//! implementation keeps one connection behind a mutex so that every update
//! and the read-back that follows it happen as one unit. Queries run on the
//! blocking pool; callers awaiting them keep their runtime worker free.

use crate::error::{TetherError, TetherResult};
use crate::session::state::{FieldUpdate, Session, SessionStatus, StatusChange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, Span};
use uuid::Uuid;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;";

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'INIT',
    detail TEXT,
    token TEXT,
    pairing_code TEXT,
    qr TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const SELECT_COLUMNS: &str =
    "SELECT id, status, detail, token, pairing_code, qr, created_at, updated_at FROM sessions";

/// Durable session records, the single source of truth for status
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session in `INIT` unless it already exists; returns the row
    async fn create(&self, id: &str) -> TetherResult<Session>;

    /// Get a session by ID
    async fn find_by_id(&self, id: &str) -> TetherResult<Option<Session>>;

    /// List all sessions, oldest first
    async fn list(&self) -> TetherResult<Vec<Session>>;

    /// Apply a status transition atomically and return the updated row
    async fn update_status(&self, id: &str, change: &StatusChange) -> TetherResult<Session>;

    /// Delete a session; returns whether a row existed
    async fn delete(&self, id: &str) -> TetherResult<bool>;
}

/// SQLite-backed session store
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteSessionStore {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> TetherResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TetherError::io(format!("creating store directory {}", parent.display()), e)
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(CREATE_TABLES)?;

        info!(path = %path.display(), "session store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn in_memory() -> TetherResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query_one(conn: &Connection, id: &str) -> TetherResult<Option<Session>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let raw = conn
            .query_row(&sql, [id], RawRow::from_row)
            .optional()?;
        raw.map(RawRow::into_session).transpose()
    }

    /// Run `f` against the connection on the blocking pool, inside the
    /// caller's span
    async fn with_conn<T, F>(&self, f: F) -> TetherResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> TetherResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let span = Span::current();
        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| TetherError::Store(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self))]
    async fn create(&self, id: &str) -> TetherResult<Session> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions (id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![id, SessionStatus::Init.as_str(), now],
            )?;
            if inserted > 0 {
                debug!("Created session row");
            }

            Self::query_one(conn, &id)?.ok_or(TetherError::SessionNotFound(id))
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> TetherResult<Option<Session>> {
        let id = id.to_string();
        self.with_conn(move |conn| Self::query_one(conn, &id)).await
    }

    async fn list(&self) -> TetherResult<Vec<Session>> {
        self.with_conn(|conn| {
            let sql = format!("{SELECT_COLUMNS} ORDER BY created_at ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], RawRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawRow::into_session).collect()
        })
        .await
    }

    #[instrument(skip(self, change), fields(status = %change.status))]
    async fn update_status(&self, id: &str, change: &StatusChange) -> TetherResult<Session> {
        let id = id.to_string();
        let change = change.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let (code_mode, code_value) = bind_field(&change.pairing_code);
            let (qr_mode, qr_value) = bind_field(&change.qr);
            let (token_mode, token_value) = bind_field(&change.token);
            let fresh_token = Uuid::new_v4().to_string();

            let updated = tx.execute(
                "UPDATE sessions SET
                    status = ?1,
                    detail = ?2,
                    pairing_code = CASE ?3 WHEN 0 THEN pairing_code WHEN 1 THEN NULL ELSE ?4 END,
                    qr = CASE ?5 WHEN 0 THEN qr WHEN 1 THEN NULL ELSE ?6 END,
                    token = CASE ?7
                        WHEN 1 THEN NULL
                        WHEN 2 THEN ?8
                        ELSE CASE WHEN ?1 = 'CONNECTED' AND token IS NULL THEN ?9 ELSE token END
                    END,
                    updated_at = ?10
                 WHERE id = ?11",
                params![
                    change.status.as_str(),
                    change.detail,
                    code_mode,
                    code_value,
                    qr_mode,
                    qr_value,
                    token_mode,
                    token_value,
                    fresh_token,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?;

            if updated == 0 {
                return Err(TetherError::SessionNotFound(id));
            }

            let session =
                Self::query_one(&tx, &id)?.ok_or_else(|| TetherError::SessionNotFound(id.clone()))?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> TetherResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", [&id])?;
            Ok(removed > 0)
        })
        .await
    }
}

/// Encode a tri-state field as (mode, value) SQL parameters
fn bind_field(update: &FieldUpdate<String>) -> (i64, Option<&str>) {
    match update {
        FieldUpdate::Unset => (0, None),
        FieldUpdate::Clear => (1, None),
        FieldUpdate::Set(v) => (2, Some(v.as_str())),
    }
}

/// Row as read from SQLite, before parsing status and timestamps
struct RawRow {
    id: String,
    status: String,
    detail: Option<String>,
    token: Option<String>,
    pairing_code: Option<String>,
    qr: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            detail: row.get(2)?,
            token: row.get(3)?,
            pairing_code: row.get(4)?,
            qr: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_session(self) -> TetherResult<Session> {
        let status = self.status.parse().map_err(|reason| TetherError::StoreRow {
            id: self.id.clone(),
            reason,
        })?;
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let updated_at = parse_timestamp(&self.id, &self.updated_at)?;

        Ok(Session {
            id: self.id,
            status,
            detail: self.detail,
            token: self.token,
            pairing_code: self.pairing_code,
            qr: self.qr,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(id: &str, raw: &str) -> TetherResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TetherError::StoreRow {
            id: id.to_string(),
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}
