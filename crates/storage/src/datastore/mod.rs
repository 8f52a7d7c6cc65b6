#![forbid(unsafe_code)]
//! The per-connection database session.
//!
//! A `DataStore` belongs to exactly one thread for its lifetime. It counts
//! nested transactions (only the outermost touches the database), records
//! statements for deadlock replay on backends with concurrent writers, and
//! owns the pending-notification collector.

mod collections;
mod items;

pub use items::NewPart;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use pimd_core::Entity;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::{debug, error, warn};

use crate::collector::NotificationCollector;
use crate::entity::{Collection, MimeType, PimItem};
use crate::error::StoreError;
use crate::query::QueryBuilder;
use crate::schema::migrate_schema;

/// Which kind of database the session is configured for. The binding is
/// always SQLite; the backend kind selects the behavioral differences:
/// transaction serialization, deadlock replay, keep-alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbBackend {
    Sqlite,
    MySql,
    Postgres,
}

impl DbBackend {
    /// Backends that can run writers concurrently and therefore can
    /// deadlock; statements are recorded for replay only on these.
    pub fn supports_concurrent_writers(self) -> bool {
        matches!(self, Self::MySql | Self::Postgres)
    }

    /// Backends whose idle timeout silently drops connections.
    pub fn needs_keep_alive(self) -> bool {
        matches!(self, Self::MySql)
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub backend: DbBackend,
    pub enforce_foreign_keys: bool,
    /// Parts at least this large live in external files.
    pub external_payload_threshold: usize,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backend: DbBackend::Sqlite,
            enforce_foreign_keys: true,
            external_payload_threshold: 4096,
        }
    }
}

// SQLite cannot run concurrent writers; outermost transactions across all
// sessions in the process are serialized on this.
static SQLITE_TRANSACTION_MUTEX: Mutex<()> = Mutex::new(());

struct RecordedStatement {
    sql: String,
    params: Vec<Value>,
}

pub struct DataStore {
    conn: Connection,
    config: StoreConfig,
    session_id: Vec<u8>,
    transaction_level: u32,
    rolled_back_at_current_level: bool,
    recorded: Vec<RecordedStatement>,
    collector: NotificationCollector,
    transaction_guard: Option<MutexGuard<'static, ()>>,
}

impl DataStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.data_dir.join("file_db_data"))?;
        let db_path = config.data_dir.join("pimd.db");
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrate_schema(&conn, config.enforce_foreign_keys)?;
        debug!(path = %db_path.display(), backend = ?config.backend, "database session opened");
        Ok(Self {
            conn,
            config,
            session_id: Vec::new(),
            transaction_level: 0,
            rolled_back_at_current_level: false,
            recorded: Vec::new(),
            collector: NotificationCollector::new(),
            transaction_guard: None,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn set_session_id(&mut self, session_id: &[u8]) {
        self.session_id = session_id.to_vec();
        self.collector.set_session_id(session_id);
    }

    pub fn collector(&mut self) -> &mut NotificationCollector {
        &mut self.collector
    }

    /* --- statement execution ------------------------------------------ */

    fn recording(&self) -> bool {
        self.transaction_level > 0 && self.config.backend.supports_concurrent_writers()
    }

    fn record(&mut self, sql: &str, params: &[Value]) {
        if self.recording() {
            self.recorded.push(RecordedStatement {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
        }
    }

    fn is_deadlock(&self, err: &rusqlite::Error) -> bool {
        self.config.backend.supports_concurrent_writers()
            && err.to_string().to_ascii_lowercase().contains("deadlock")
    }

    fn log_db_error(&self, action: &str, err: &rusqlite::Error) {
        error!("Database error: {action}");
        error!("  Last database error: {err}");
    }

    fn run_dml(&self, sql: &str, params: &[Value]) -> Result<usize, rusqlite::Error> {
        let mut stmt = self.conn.prepare(sql)?;
        stmt.execute(params_from_iter(params.iter()))
    }

    // Replay runs every statement kind; query-and-drain handles both DML
    // and SELECT through one code path, with a freshly prepared statement
    // so no driver error state leaks.
    fn run_any(conn: &Connection, sql: &str, params: &[Value]) -> Result<(), rusqlite::Error> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while rows.next()?.is_some() {}
        Ok(())
    }

    /// Executes a mutating statement, with deadlock replay.
    pub fn exec(&mut self, sql: &str, params: Vec<Value>) -> Result<usize, StoreError> {
        match self.run_dml(sql, &params) {
            Ok(changed) => {
                self.record(sql, &params);
                Ok(changed)
            }
            Err(err) if self.recording() && self.is_deadlock(&err) => {
                if self.replay_transaction().is_err() {
                    // Surface the original error when the replay fails too.
                    self.log_db_error(sql, &err);
                    return Err(StoreError::Sql(err));
                }
                match self.run_dml(sql, &params) {
                    Ok(changed) => {
                        self.record(sql, &params);
                        Ok(changed)
                    }
                    Err(_) => {
                        self.log_db_error(sql, &err);
                        Err(StoreError::Sql(err))
                    }
                }
            }
            Err(err) => {
                self.log_db_error(sql, &err);
                Err(StoreError::Sql(err))
            }
        }
    }

    pub fn exec_builder(&mut self, builder: &QueryBuilder) -> Result<usize, StoreError> {
        let (sql, params) = builder.build()?;
        self.exec(&sql, params)
    }

    pub fn insert(&mut self, sql: &str, params: Vec<Value>) -> Result<i64, StoreError> {
        self.exec(sql, params)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn query_rows<T>(
        &mut self,
        sql: &str,
        params: Vec<Value>,
        mut map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        self.record(sql, &params);
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            result.push(map(row)?);
        }
        Ok(result)
    }

    pub fn query_opt<T>(
        &mut self,
        sql: &str,
        params: Vec<Value>,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>, StoreError> {
        Ok(self.query_rows(sql, params, map)?.into_iter().next())
    }

    pub fn query_builder_rows<T>(
        &mut self,
        builder: &QueryBuilder,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let (sql, params) = builder.build()?;
        self.query_rows(&sql, params, map)
    }

    /* --- transactions -------------------------------------------------- */

    pub fn in_transaction(&self) -> bool {
        self.transaction_level > 0
    }

    pub fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.transaction_level == 0 {
            if self.config.backend == DbBackend::Sqlite {
                let guard = SQLITE_TRANSACTION_MUTEX
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                self.transaction_guard = Some(guard);
            }
            if let Err(err) = self.conn.execute_batch("BEGIN") {
                self.log_db_error("begin transaction", &err);
                self.transaction_guard = None;
                return Err(StoreError::Sql(err));
            }
            self.rolled_back_at_current_level = false;
            self.collector.set_in_transaction(true);
        }
        self.transaction_level += 1;
        Ok(())
    }

    /// Outermost rollback semantics: any rollback aborts the whole
    /// transaction stack; later commits from outer scopes are no-ops.
    pub fn rollback_transaction(&mut self) -> Result<(), StoreError> {
        if self.transaction_level == 0 {
            warn!("rollback_transaction(): no transaction in progress");
            return Err(StoreError::NoTransaction);
        }
        self.transaction_level = 0;
        self.rolled_back_at_current_level = true;
        self.recorded.clear();
        self.collector.set_in_transaction(false);
        self.collector.transaction_rolled_back();
        let result = self.conn.execute_batch("ROLLBACK");
        self.transaction_guard = None;
        if let Err(err) = result {
            self.log_db_error("rollback transaction", &err);
            return Err(StoreError::Sql(err));
        }
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<(), StoreError> {
        if self.transaction_level == 0 {
            if self.rolled_back_at_current_level {
                // An inner scope rolled the stack back already.
                return Ok(());
            }
            warn!("commit_transaction(): no transaction in progress");
            return Err(StoreError::NoTransaction);
        }
        if self.transaction_level == 1 {
            if let Err(err) = self.commit_with_replay() {
                let _ = self.rollback_transaction();
                return Err(err);
            }
            self.transaction_guard = None;
            self.recorded.clear();
            self.collector.set_in_transaction(false);
            self.collector.transaction_committed();
        }
        self.transaction_level -= 1;
        Ok(())
    }

    fn commit_with_replay(&mut self) -> Result<(), StoreError> {
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) if self.recording() && self.is_deadlock(&err) => {
                // The recorded COMMIT is discarded: replay the statements in
                // a fresh transaction and commit that one instead.
                if self.replay_transaction().is_err() {
                    self.log_db_error("commit transaction", &err);
                    return Err(StoreError::Sql(err));
                }
                self.conn.execute_batch("COMMIT").map_err(|_| {
                    self.log_db_error("commit transaction", &err);
                    StoreError::Sql(err)
                })
            }
            Err(err) => {
                self.log_db_error("commit transaction", &err);
                Err(StoreError::Sql(err))
            }
        }
    }

    /// Re-executes the recorded statements of the current transaction after
    /// the backend aborted it with a deadlock error.
    fn replay_transaction(&mut self) -> Result<(), StoreError> {
        debug!(
            statements = self.recorded.len(),
            "replaying transaction after deadlock"
        );
        self.conn.execute_batch("BEGIN")?;
        for statement in &self.recorded {
            Self::run_any(&self.conn, &statement.sql, &statement.params)?;
        }
        Ok(())
    }

    /// Number of statements currently recorded for replay.
    pub fn recorded_statement_count(&self) -> usize {
        self.recorded.len()
    }

    /* --- session lifecycle --------------------------------------------- */

    /// Periodic dummy query so MySQL-like backends do not silently drop the
    /// idle connection.
    pub fn keep_alive(&mut self) {
        if self.config.backend.needs_keep_alive() {
            let _ = self.conn.query_row("SELECT 1", [], |_row| Ok(()));
        }
    }

    /// Closes the session. Invoked by the connection after its idle
    /// interval; a transaction still open here was leaked by a handler.
    pub fn close(&mut self) {
        if self.in_transaction() {
            warn!("closing database session with an open transaction");
            let _ = self.rollback_transaction();
        }
        self.recorded.clear();
    }

    /* --- notification helpers ----------------------------------------- */

    /// Turns items into notification entities, resolving mime-type names
    /// through the cache.
    pub(crate) fn item_entities(&mut self, items: &[PimItem]) -> Result<Vec<Entity>, StoreError> {
        let mut entities = Vec::with_capacity(items.len());
        for item in items {
            let mime_type = MimeType::retrieve_by_id(self, item.mime_type_id)?
                .map(|mt| mt.name)
                .unwrap_or_default();
            entities.push(Entity {
                id: item.id,
                remote_id: item.remote_id.clone(),
                remote_revision: item.remote_revision.clone(),
                mime_type,
            });
        }
        Ok(entities)
    }

    pub(crate) fn collection_entity(&mut self, collection: &Collection) -> Entity {
        Entity {
            id: collection.id,
            remote_id: collection.remote_id.clone(),
            remote_revision: collection.remote_revision.clone(),
            mime_type: String::new(),
        }
    }

    pub(crate) fn resource_name_of(&mut self, collection: &Collection) -> Result<String, StoreError> {
        Ok(collection.resource(self)?.name)
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        if self.in_transaction() {
            warn!("database session dropped inside a transaction, rolling back");
            let _ = self.rollback_transaction();
        }
    }
}
