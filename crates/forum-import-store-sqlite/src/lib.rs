use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use forum_import_core::data::schemas;
use forum_import_core::{
    Filter, IdentifierMap, ImportError, ImportResult, ImportSession, Row, SessionStore,
    SourceQuery, SourceRows, TargetStorage, Value,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Legacy ids resolved per `IN (...)` query.
const LOOKUP_CHUNK: usize = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS import_log (
  content_type TEXT NOT NULL,
  old_id INTEGER NOT NULL,
  new_id INTEGER NOT NULL,
  PRIMARY KEY (content_type, old_id)
);

CREATE TABLE IF NOT EXISTS import_session (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  session_id TEXT NOT NULL,
  importer TEXT NOT NULL,
  session_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS user_group (
  user_group_id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  user_title TEXT NOT NULL DEFAULT '',
  display_style_priority INTEGER NOT NULL DEFAULT 0,
  username_css TEXT NOT NULL DEFAULT ''
);

INSERT OR IGNORE INTO user_group(user_group_id, title, user_title, display_style_priority)
VALUES
  (1, 'Unregistered / Unconfirmed', 'Guest', 0),
  (2, 'Registered', '', 0),
  (3, 'Administrative', 'Administrator', 1000),
  (4, 'Moderating', 'Moderator', 900);

CREATE TABLE IF NOT EXISTS user (
  user_id INTEGER PRIMARY KEY,
  username TEXT NOT NULL,
  email TEXT NOT NULL DEFAULT '',
  user_group_id INTEGER NOT NULL DEFAULT 2,
  secondary_group_ids TEXT NOT NULL DEFAULT '',
  display_style_group_id INTEGER NOT NULL DEFAULT 0,
  custom_title TEXT NOT NULL DEFAULT '',
  register_date INTEGER NOT NULL DEFAULT 0,
  last_activity INTEGER NOT NULL DEFAULT 0,
  message_count INTEGER NOT NULL DEFAULT 0,
  is_admin INTEGER NOT NULL DEFAULT 0,
  is_moderator INTEGER NOT NULL DEFAULT 0,
  is_banned INTEGER NOT NULL DEFAULT 0,
  user_state TEXT NOT NULL DEFAULT 'valid'
    CHECK (user_state IN ('valid','email_confirm','moderated','rejected','disabled')),
  timezone TEXT NOT NULL DEFAULT 'UTC',
  signature TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS node (
  node_id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  node_type_id TEXT NOT NULL CHECK (node_type_id IN ('Category','Forum','Page')),
  parent_node_id INTEGER NOT NULL DEFAULT 0,
  display_order INTEGER NOT NULL DEFAULT 1,
  display_in_list INTEGER NOT NULL DEFAULT 1,
  lft INTEGER NOT NULL DEFAULT 0,
  rgt INTEGER NOT NULL DEFAULT 0,
  depth INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS forum (
  node_id INTEGER PRIMARY KEY,
  discussion_count INTEGER NOT NULL DEFAULT 0,
  message_count INTEGER NOT NULL DEFAULT 0,
  last_post_date INTEGER NOT NULL DEFAULT 0,
  allow_posting INTEGER NOT NULL DEFAULT 1,
  FOREIGN KEY (node_id) REFERENCES node(node_id)
);

CREATE TABLE IF NOT EXISTS category (
  node_id INTEGER PRIMARY KEY,
  FOREIGN KEY (node_id) REFERENCES node(node_id)
);

CREATE TABLE IF NOT EXISTS page (
  node_id INTEGER PRIMARY KEY,
  publish_date INTEGER NOT NULL DEFAULT 0,
  modified_date INTEGER NOT NULL DEFAULT 0,
  view_count INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (node_id) REFERENCES node(node_id)
);

CREATE TABLE IF NOT EXISTS thread (
  thread_id INTEGER PRIMARY KEY,
  node_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  user_id INTEGER NOT NULL DEFAULT 0,
  username TEXT NOT NULL,
  post_date INTEGER NOT NULL,
  reply_count INTEGER NOT NULL DEFAULT 0,
  view_count INTEGER NOT NULL DEFAULT 0,
  sticky INTEGER NOT NULL DEFAULT 0,
  discussion_open INTEGER NOT NULL DEFAULT 1,
  discussion_state TEXT NOT NULL DEFAULT 'visible'
    CHECK (discussion_state IN ('visible','moderated','deleted')),
  last_post_date INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_thread_node_last_post ON thread(node_id, last_post_date);

CREATE TABLE IF NOT EXISTS post (
  post_id INTEGER PRIMARY KEY,
  thread_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL DEFAULT 0,
  username TEXT NOT NULL,
  post_date INTEGER NOT NULL,
  message TEXT NOT NULL,
  message_state TEXT NOT NULL DEFAULT 'visible'
    CHECK (message_state IN ('visible','moderated','deleted')),
  position INTEGER NOT NULL DEFAULT 0,
  ip_id INTEGER NOT NULL DEFAULT 0,
  last_edit_date INTEGER NOT NULL DEFAULT 0,
  last_edit_user_id INTEGER NOT NULL DEFAULT 0,
  edit_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_post_thread_date ON post(thread_id, post_date);

CREATE TABLE IF NOT EXISTS moderator (
  user_id INTEGER PRIMARY KEY,
  is_super_moderator INTEGER NOT NULL DEFAULT 0,
  extra_user_group_ids TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS permission_entry (
  permission_entry_id INTEGER PRIMARY KEY,
  user_group_id INTEGER NOT NULL DEFAULT 0,
  user_id INTEGER NOT NULL DEFAULT 0,
  permission_group_id TEXT NOT NULL,
  permission_id TEXT NOT NULL,
  permission_value TEXT NOT NULL CHECK (permission_value IN ('allow','deny','unset')),
  permission_value_int INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS template (
  template_id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  type TEXT NOT NULL,
  style_id INTEGER NOT NULL DEFAULT 0,
  template TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_watch (
  user_id INTEGER NOT NULL,
  thread_id INTEGER NOT NULL,
  email_subscribe INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (user_id, thread_id)
);

CREATE TABLE IF NOT EXISTS ip (
  ip_id INTEGER PRIMARY KEY,
  user_id INTEGER NOT NULL DEFAULT 0,
  content_type TEXT NOT NULL,
  content_id INTEGER NOT NULL,
  action TEXT NOT NULL DEFAULT '',
  ip BLOB NOT NULL,
  log_date INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS approval_queue (
  content_type TEXT NOT NULL,
  content_id INTEGER NOT NULL,
  content_date INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (content_type, content_id)
);

CREATE TABLE IF NOT EXISTS deletion_log (
  content_type TEXT NOT NULL,
  content_id INTEGER NOT NULL,
  delete_date INTEGER NOT NULL DEFAULT 0,
  delete_user_id INTEGER NOT NULL DEFAULT 0,
  delete_username TEXT NOT NULL DEFAULT '',
  delete_reason TEXT NOT NULL DEFAULT '',
  PRIMARY KEY (content_type, content_id)
);
";

type LogKey = (String, i64);

/// Target database: forum tables, the import log and the persisted session.
pub struct SqliteStore {
    conn: Connection,
    /// Committed import log entries seen so far.
    log_cache: BTreeMap<LogKey, i64>,
    /// Entries recorded inside each open transaction level, innermost last.
    pending_log: Vec<BTreeMap<LogKey, i64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDigest {
    pub table: String,
    pub rows: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogStat {
    pub content_type: String,
    pub entries: u64,
}

impl SqliteStore {
    /// Open a SQLite target database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, log_cache: BTreeMap::new(), pending_log: Vec::new() })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// Safe to call on an up-to-date database.
    ///
    /// # Errors
    /// Returns an error when a migration fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version >= target {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration {target} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration {target}"))?;
            record_schema_version(&tx, target)?;
            tx.commit().with_context(|| format!("failed to commit migration {target}"))?;
            info!(version = target, "applied schema migration");
            version = target;
        }

        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// SHA-256 over every row of `table`, ordered by primary key.
    ///
    /// Two targets holding the same rows with the same identities digest identically.
    ///
    /// # Errors
    /// Returns an error when the table name is invalid or the table cannot be read.
    pub fn table_digest(&self, table: &str) -> Result<TableDigest> {
        let quoted = quote_identifier(table)?;
        if !table_exists(&self.conn, table)? {
            return Err(anyhow!("no such table: {table}"));
        }
        let order = primary_key_order(&self.conn, table)?;
        let sql = format!("SELECT * FROM {quoted} ORDER BY {order}");
        let mut stmt =
            self.conn.prepare(&sql).with_context(|| format!("failed to prepare digest of {table}"))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

        let mut hasher = Sha256::new();
        let mut count = 0_u64;
        let mut rows = stmt.query([]).with_context(|| format!("failed to read {table}"))?;
        while let Some(row) = rows.next()? {
            for (index, column) in columns.iter().enumerate() {
                hasher.update(column.as_bytes());
                hasher.update(b"=");
                match row.get_ref(index)? {
                    ValueRef::Null => hasher.update(b"n"),
                    ValueRef::Integer(value) => hasher.update(format!("i{value}")),
                    ValueRef::Real(value) => hasher.update(format!("f{}", value.to_bits())),
                    ValueRef::Text(value) => {
                        hasher.update(format!("t{}:", value.len()));
                        hasher.update(value);
                    }
                    ValueRef::Blob(value) => {
                        hasher.update(format!("b{}:", value.len()));
                        hasher.update(value);
                    }
                }
                hasher.update(b";");
            }
            hasher.update(b"\n");
            count += 1;
        }

        Ok(TableDigest { table: table.to_string(), rows: count, sha256: hex::encode(hasher.finalize()) })
    }

    /// Digests of every target table plus the import log.
    ///
    /// # Errors
    /// Returns an error when any table cannot be read.
    pub fn table_digests(&self) -> Result<Vec<TableDigest>> {
        digest_tables().iter().map(|table| self.table_digest(table)).collect()
    }

    /// Import log entries per content type.
    ///
    /// # Errors
    /// Returns an error when the import log cannot be read.
    pub fn log_stats(&self) -> Result<Vec<LogStat>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT content_type, COUNT(*) FROM import_log
                 GROUP BY content_type ORDER BY content_type",
            )
            .context("failed to prepare import log stats")?;
        let rows = stmt.query_map([], |row| {
            Ok(LogStat {
                content_type: row.get(0)?,
                entries: u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }

    /// Committed mapping for one legacy id, read straight from the import log.
    ///
    /// # Errors
    /// Returns an error when the import log cannot be read.
    pub fn find_mapping(&self, content_type: &str, old_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT new_id FROM import_log WHERE content_type = ?1 AND old_id = ?2",
                params![content_type, old_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up {content_type} legacy id {old_id}"))
    }

    /// # Errors
    /// Returns an error when the table name is invalid or the table cannot be read.
    pub fn count_rows(&self, table: &str) -> Result<u64> {
        let quoted = quote_identifier(table)?;
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.pending_log.len()
    }

    fn cached_mapping(&self, key: &LogKey) -> Option<i64> {
        self.pending_log
            .iter()
            .rev()
            .find_map(|frame| frame.get(key))
            .or_else(|| self.log_cache.get(key))
            .copied()
    }
}

impl TargetStorage for SqliteStore {
    fn begin(&mut self) -> ImportResult<()> {
        let depth = self.pending_log.len();
        let sql =
            if depth == 0 { "BEGIN IMMEDIATE".to_string() } else { format!("SAVEPOINT import_{depth}") };
        self.conn.execute_batch(&sql).map_err(storage_error("failed to begin transaction"))?;
        self.pending_log.push(BTreeMap::new());
        Ok(())
    }

    fn commit(&mut self) -> ImportResult<()> {
        let Some(frame) = self.pending_log.pop() else {
            return Err(ImportError::Storage("commit without an open transaction".to_string()));
        };
        let depth = self.pending_log.len();
        let sql = if depth == 0 { "COMMIT".to_string() } else { format!("RELEASE import_{depth}") };
        if let Err(err) = self.conn.execute_batch(&sql) {
            self.pending_log.push(frame);
            return Err(storage_error("failed to commit transaction")(err));
        }
        match self.pending_log.last_mut() {
            Some(parent) => parent.extend(frame),
            None => self.log_cache.extend(frame),
        }
        Ok(())
    }

    fn rollback(&mut self) -> ImportResult<()> {
        if self.pending_log.pop().is_none() {
            return Err(ImportError::Storage("rollback without an open transaction".to_string()));
        }
        let depth = self.pending_log.len();
        let sql = if depth == 0 {
            "ROLLBACK".to_string()
        } else {
            format!("ROLLBACK TO import_{depth}; RELEASE import_{depth}")
        };
        self.conn.execute_batch(&sql).map_err(storage_error("failed to roll back transaction"))
    }

    fn insert(&mut self, table: &str, row: &Row) -> ImportResult<i64> {
        let quoted = quote_identifier(table).map_err(config_error)?;
        if row.is_empty() {
            self.conn
                .execute(&format!("INSERT INTO {quoted} DEFAULT VALUES"), [])
                .map_err(storage_error(&format!("failed to insert into {table}")))?;
            return Ok(self.conn.last_insert_rowid());
        }

        let mut columns = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        let mut values = Vec::with_capacity(row.len());
        for (index, (column, value)) in row.iter().enumerate() {
            columns.push(quote_identifier(column).map_err(config_error)?);
            placeholders.push(format!("?{}", index + 1));
            values.push(to_sql_value(value));
        }
        let sql = format!(
            "INSERT INTO {quoted} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(values))
            .map_err(storage_error(&format!("failed to insert into {table}")))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update(&mut self, table: &str, row: &Row, key_column: &str, key: i64) -> ImportResult<usize> {
        if row.is_empty() {
            return Ok(0);
        }
        let quoted = quote_identifier(table).map_err(config_error)?;
        let key_quoted = quote_identifier(key_column).map_err(config_error)?;

        let mut assignments = Vec::with_capacity(row.len());
        let mut values = Vec::with_capacity(row.len() + 1);
        for (index, (column, value)) in row.iter().enumerate() {
            assignments.push(format!("{} = ?{}", quote_identifier(column).map_err(config_error)?, index + 1));
            values.push(to_sql_value(value));
        }
        values.push(SqlValue::Integer(key));
        let sql = format!(
            "UPDATE {quoted} SET {} WHERE {key_quoted} = ?{}",
            assignments.join(", "),
            values.len()
        );
        self.conn
            .execute(&sql, params_from_iter(values))
            .map_err(storage_error(&format!("failed to update {table}")))
    }

    fn select_all(&mut self, table: &str, columns: &[&str]) -> ImportResult<Vec<Row>> {
        let quoted = quote_identifier(table).map_err(config_error)?;
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|column| quote_identifier(column))
                .collect::<Result<Vec<_>>>()
                .map_err(config_error)?
                .join(", ")
        };
        query_rows(&self.conn, &format!("SELECT {projection} FROM {quoted} ORDER BY rowid"), Vec::new())
            .map_err(storage_error(&format!("failed to read {table}")))
    }
}

impl IdentifierMap for SqliteStore {
    fn lookup(&mut self, entity_type: &str, legacy_id: i64) -> ImportResult<Option<i64>> {
        let key = (entity_type.to_string(), legacy_id);
        if let Some(new_id) = self.cached_mapping(&key) {
            return Ok(Some(new_id));
        }

        let found = self
            .conn
            .query_row(
                "SELECT new_id FROM import_log WHERE content_type = ?1 AND old_id = ?2",
                params![entity_type, legacy_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(storage_error("failed to read import log"))?;
        if let Some(new_id) = found {
            self.log_cache.insert(key, new_id);
        }
        Ok(found)
    }

    fn lookup_batch(
        &mut self,
        entity_type: &str,
        legacy_ids: &[i64],
    ) -> ImportResult<BTreeMap<i64, i64>> {
        let mut mapped = BTreeMap::new();
        let mut missing = Vec::new();
        for legacy_id in legacy_ids {
            match self.cached_mapping(&(entity_type.to_string(), *legacy_id)) {
                Some(new_id) => {
                    mapped.insert(*legacy_id, new_id);
                }
                None => missing.push(*legacy_id),
            }
        }

        for chunk in missing.chunks(LOOKUP_CHUNK) {
            let placeholders =
                (0..chunk.len()).map(|index| format!("?{}", index + 2)).collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT old_id, new_id FROM import_log
                 WHERE content_type = ?1 AND old_id IN ({placeholders})"
            );
            let mut values = vec![SqlValue::Text(entity_type.to_string())];
            values.extend(chunk.iter().map(|legacy_id| SqlValue::Integer(*legacy_id)));

            let mut stmt =
                self.conn.prepare(&sql).map_err(storage_error("failed to prepare import log batch"))?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(storage_error("failed to read import log batch"))?;
            for row in rows {
                let (old_id, new_id) = row.map_err(storage_error("failed to read import log batch"))?;
                self.log_cache.insert((entity_type.to_string(), old_id), new_id);
                mapped.insert(old_id, new_id);
            }
        }

        debug!(entity_type, requested = legacy_ids.len(), mapped = mapped.len(), "resolved legacy ids");
        Ok(mapped)
    }

    fn record(&mut self, entity_type: &str, legacy_id: i64, new_id: i64) -> ImportResult<()> {
        match self.lookup(entity_type, legacy_id)? {
            Some(existing) if existing == new_id => return Ok(()),
            Some(existing) => {
                return Err(ImportError::Configuration(format!(
                    "{entity_type} legacy id {legacy_id} is already mapped to {existing}, not {new_id}"
                )))
            }
            None => {}
        }

        self.conn
            .execute(
                "INSERT INTO import_log(content_type, old_id, new_id) VALUES (?1, ?2, ?3)",
                params![entity_type, legacy_id, new_id],
            )
            .map_err(storage_error("failed to write import log"))?;

        let key = (entity_type.to_string(), legacy_id);
        match self.pending_log.last_mut() {
            Some(frame) => {
                frame.insert(key, new_id);
            }
            None => {
                self.log_cache.insert(key, new_id);
            }
        }
        Ok(())
    }
}

impl SessionStore for SqliteStore {
    fn load_session(&mut self) -> ImportResult<Option<ImportSession>> {
        let raw = self
            .conn
            .query_row("SELECT session_json FROM import_session WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(storage_error("failed to read import session"))?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|err| ImportError::Storage(format!("failed to decode import session: {err}")))
        })
        .transpose()
    }

    fn save_session(&mut self, session: &ImportSession) -> ImportResult<()> {
        let json = serde_json::to_string(session)
            .map_err(|err| ImportError::Storage(format!("failed to encode import session: {err}")))?;
        let now = now_rfc3339().map_err(|err| ImportError::Storage(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO import_session(id, session_id, importer, session_json, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   session_id = excluded.session_id,
                   importer = excluded.importer,
                   session_json = excluded.session_json,
                   updated_at = excluded.updated_at",
                params![session.session_id.to_string(), session.importer, json, now],
            )
            .map_err(storage_error("failed to write import session"))?;
        Ok(())
    }

    fn clear_session(&mut self) -> ImportResult<()> {
        self.conn
            .execute("DELETE FROM import_session", [])
            .map_err(storage_error("failed to clear import session"))?;
        Ok(())
    }
}

/// Read-only view of a legacy database.
pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    /// Open a legacy database without write access.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open source database at {}", path.display()))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure source pragmas")?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl SourceRows for SqliteSource {
    fn max_key(&self, table: &str, key_column: &str) -> ImportResult<i64> {
        let table_quoted = quote_identifier(table).map_err(config_error)?;
        let key_quoted = quote_identifier(key_column).map_err(config_error)?;
        self.conn
            .query_row(
                &format!("SELECT COALESCE(MAX({key_quoted}), 0) FROM {table_quoted}"),
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(source_error(&format!("failed to read max {key_column} of {table}")))
    }

    fn fetch(&self, query: &SourceQuery) -> ImportResult<Vec<Row>> {
        let (sql, values) = build_source_sql(query).map_err(config_error)?;
        query_rows(&self.conn, &sql, values)
            .map_err(source_error(&format!("failed to read {}", query.table)))
    }
}

fn build_source_sql(query: &SourceQuery) -> Result<(String, Vec<SqlValue>)> {
    let key = quote_identifier(&query.key_column)?;
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(start_after) = query.start_after {
        conditions.push(format!("{key} > {}", bind(&mut values, SqlValue::Integer(start_after))));
    }
    if let Some(end) = query.end {
        conditions.push(format!("{key} <= {}", bind(&mut values, SqlValue::Integer(end))));
    }
    for filter in &query.filters {
        match filter {
            Filter::Eq(column, value) => {
                let column = quote_identifier(column)?;
                conditions.push(format!("{column} = {}", bind(&mut values, to_sql_value(value))));
            }
            Filter::NotEq(column, value) => {
                let column = quote_identifier(column)?;
                conditions.push(format!("{column} <> {}", bind(&mut values, to_sql_value(value))));
            }
            Filter::After(columns, after) => {
                if columns.len() != after.len() || columns.is_empty() {
                    return Err(anyhow!("row-value filter needs one value per column"));
                }
                let columns =
                    columns.iter().map(|column| quote_identifier(column)).collect::<Result<Vec<_>>>()?;
                let placeholders = after
                    .iter()
                    .map(|value| bind(&mut values, to_sql_value(value)))
                    .collect::<Vec<_>>();
                conditions.push(format!("({}) > ({})", columns.join(", "), placeholders.join(", ")));
            }
        }
    }

    let order = query
        .effective_order()
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let mut sql = format!("SELECT * FROM {}", quote_identifier(&query.table)?);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&order);
    if let Some(limit) = query.limit {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sql.push_str(&format!(" LIMIT {}", bind(&mut values, SqlValue::Integer(limit))));
    }
    Ok((sql, values))
}

fn bind(values: &mut Vec<SqlValue>, value: SqlValue) -> String {
    values.push(value);
    format!("?{}", values.len())
}

fn query_rows(conn: &Connection, sql: &str, values: Vec<SqlValue>) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query(params_from_iter(values))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.clone(), from_sql_value(row.get_ref(index)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(value) => SqlValue::Integer(*value),
        Value::Float(value) => SqlValue::Real(*value),
        Value::Text(value) => SqlValue::Text(value.clone()),
        Value::Bytes(value) => SqlValue::Blob(value.clone()),
        Value::Bool(value) => SqlValue::Integer(i64::from(*value)),
        Value::IntList(values) => SqlValue::Text(
            values.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        ),
        Value::Json(value) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Int(value),
        ValueRef::Real(value) => Value::Float(value),
        ValueRef::Text(value) => Value::Text(String::from_utf8_lossy(value).into_owned()),
        ValueRef::Blob(value) => Value::Bytes(value.to_vec()),
    }
}

/// Double-quotes a table or column name after checking it is a plain identifier.
fn quote_identifier(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && !name.starts_with(|ch: char| ch.is_ascii_digit())
        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if !valid {
        return Err(anyhow!("invalid sql identifier `{name}`"));
    }
    Ok(format!("\"{name}\""))
}

fn primary_key_order(conn: &Connection, table: &str) -> Result<String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)?))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let position: i64 = row.get(5)?;
        if position > 0 {
            keys.push((position, name));
        }
    }
    if keys.is_empty() {
        return Ok("rowid".to_string());
    }
    keys.sort();
    keys.into_iter()
        .map(|(_, name)| quote_identifier(&name))
        .collect::<Result<Vec<_>>>()
        .map(|columns| columns.join(", "))
}

fn digest_tables() -> Vec<&'static str> {
    let mut tables = vec![
        "user_group", "user", "node", "forum", "category", "page", "thread", "post", "moderator",
    ];
    tables.extend_from_slice(schemas::SECONDARY_TABLES);
    tables.push("import_log");
    tables
}

fn storage_error(context: &str) -> impl FnOnce(rusqlite::Error) -> ImportError + '_ {
    move |err| ImportError::Storage(format!("{context}: {err}"))
}

fn source_error(context: &str) -> impl FnOnce(rusqlite::Error) -> ImportError + '_ {
    move |err| ImportError::Source(format!("{context}: {err}"))
}

fn config_error(err: anyhow::Error) -> ImportError {
    ImportError::Configuration(err.to_string())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
