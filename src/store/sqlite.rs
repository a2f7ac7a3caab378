//! SQLite-backed store.
//!
//! One database file, one connection behind a mutex: SQLite is
//! single-writer even in WAL mode, so writers are serialized here rather
//! than left to fight over the file lock. Busy/locked errors from other
//! processes are transient conflicts and are retried on a 250 ms step for
//! up to ~30 s, unless the ambient shutdown token cancels first.

use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{DelegateRecord, KeyRecord, Store};
use crate::error::{KeyError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    id        INTEGER PRIMARY KEY,
    salt      BLOB NOT NULL,
    nonce     BLOB NOT NULL,
    ct        BLOB NOT NULL,
    pub       BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS delegate (
    id        TEXT PRIMARY KEY,
    salt      BLOB NOT NULL,
    nonce     BLOB NOT NULL,
    ct        BLOB NOT NULL,
    pub       BLOB NOT NULL,
    key_index INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS delegate_key_index ON delegate (key_index);
";

const RETRY_STEP: Duration = Duration::from_millis(250);
const RETRY_LIMIT: u32 = 120;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    shutdown: CancellationToken,
}

impl SqliteStore {
    pub fn open(path: &Path, shutdown: CancellationToken) -> Result<Self> {
        info!("opening database at {}", path.display());
        let conn = Connection::open(path)
            .map_err(|e| KeyError::Db(format!("opening {}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| KeyError::Db(format!("setting pragmas: {e}")))?;
        Self::init(conn, shutdown)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory(shutdown: CancellationToken) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| KeyError::Db(format!("opening in-memory database: {e}")))?;
        Self::init(conn, shutdown)
    }

    fn init(conn: Connection, shutdown: CancellationToken) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| KeyError::Db(format!("creating schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            shutdown,
        })
    }

    /// Run `work` with the connection, retrying transient conflicts.
    fn with_conn<T>(
        &self,
        name: &str,
        mut work: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut waited = Duration::ZERO;
        loop {
            let result = {
                let mut conn = self
                    .conn
                    .lock()
                    .map_err(|_| KeyError::Internal("store lock poisoned".into()))?;
                work(&mut conn)
            };
            match result {
                Err(KeyError::DbConflict) => {
                    if self.shutdown.is_cancelled() {
                        return Err(KeyError::Db(format!(
                            "{name}: cancelled while retrying a conflict"
                        )));
                    }
                    if waited >= RETRY_STEP * RETRY_LIMIT {
                        return Err(KeyError::Db(format!("{name}: conflict retries exhausted")));
                    }
                    thread::sleep(RETRY_STEP);
                    waited += RETRY_STEP;
                }
                other => return other,
            }
        }
    }
}

fn db_err(e: rusqlite::Error, context: &str) -> KeyError {
    match &e {
        rusqlite::Error::QueryReturnedNoRows => KeyError::NotFound,
        rusqlite::Error::SqliteFailure(f, _) => match f.code {
            ErrorCode::ConstraintViolation => KeyError::AlreadyExists,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => KeyError::DbConflict,
            _ => KeyError::Db(format!("{context}: {e}")),
        },
        _ => KeyError::Db(format!("{context}: {e}")),
    }
}

impl Store for SqliteStore {
    fn set_key(&self, id: u32, rec: &KeyRecord, allow_replace: bool) -> Result<()> {
        self.with_conn("set_key", |conn| {
            let sql = if allow_replace {
                "INSERT INTO config (id, salt, nonce, ct, pub) VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO UPDATE SET salt=?2, nonce=?3, ct=?4, pub=?5"
            } else {
                "INSERT INTO config (id, salt, nonce, ct, pub) VALUES (?1, ?2, ?3, ?4, ?5)"
            };
            conn.execute(
                sql,
                params![id, rec.salt, rec.nonce, rec.ciphertext, rec.pubkey],
            )
            .map_err(|e| db_err(e, "set_key"))?;
            Ok(())
        })
    }

    fn get_key(&self, id: u32) -> Result<KeyRecord> {
        self.with_conn("get_key", |conn| {
            conn.query_row(
                "SELECT salt, nonce, ct, pub FROM config WHERE id = ?1",
                params![id],
                |row| {
                    Ok(KeyRecord {
                        salt: row.get(0)?,
                        nonce: row.get(1)?,
                        ciphertext: row.get(2)?,
                        pubkey: row.get(3)?,
                    })
                },
            )
            .map_err(|e| db_err(e, "get_key"))
        })
    }

    fn get_key_pub(&self, id: u32) -> Result<Vec<u8>> {
        self.with_conn("get_key_pub", |conn| {
            conn.query_row(
                "SELECT pub FROM config WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|e| db_err(e, "get_key_pub"))
        })
    }

    fn set_delegate(&self, rec: &DelegateRecord) -> Result<()> {
        self.with_conn("set_delegate", |conn| {
            conn.execute(
                "INSERT INTO delegate (id, salt, nonce, ct, pub, key_index) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    rec.id,
                    rec.salt,
                    rec.nonce,
                    rec.ciphertext,
                    rec.pubkey,
                    rec.key_index
                ],
            )
            .map_err(|e| db_err(e, "set_delegate"))?;
            Ok(())
        })
    }

    fn get_delegate_pub(&self, id: &str) -> Result<(Vec<u8>, u32)> {
        self.with_conn("get_delegate_pub", |conn| {
            conn.query_row(
                "SELECT pub, key_index FROM delegate WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| db_err(e, "get_delegate_pub"))
        })
    }

    fn get_delegate_priv(&self, id: &str) -> Result<DelegateRecord> {
        self.with_conn("get_delegate_priv", |conn| {
            conn.query_row(
                "SELECT id, salt, nonce, ct, pub, key_index FROM delegate WHERE id = ?1",
                params![id],
                |row| {
                    Ok(DelegateRecord {
                        id: row.get(0)?,
                        salt: row.get(1)?,
                        nonce: row.get(2)?,
                        ciphertext: row.get(3)?,
                        pubkey: row.get(4)?,
                        key_index: row.get(5)?,
                    })
                },
            )
            .map_err(|e| db_err(e, "get_delegate_priv"))
        })
    }

    fn get_max_delegate(&self) -> Result<u32> {
        self.with_conn("get_max_delegate", |conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(key_index), 0) FROM delegate",
                [],
                |row| row.get(0),
            )
            .map_err(|e| db_err(e, "get_max_delegate"))
        })
    }

    fn create_delegate(
        &self,
        id: &str,
        build: &mut dyn FnMut(u32) -> Result<DelegateRecord>,
    ) -> Result<DelegateRecord> {
        self.with_conn("create_delegate", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| db_err(e, "begin transaction"))?;
            let max: u32 = tx
                .query_row(
                    "SELECT COALESCE(MAX(key_index), 0) FROM delegate",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| db_err(e, "max key_index"))?;
            let rec = build(max + 1)?;
            tx.execute(
                "INSERT INTO delegate (id, salt, nonce, ct, pub, key_index) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    rec.salt,
                    rec.nonce,
                    rec.ciphertext,
                    rec.pubkey,
                    rec.key_index
                ],
            )
            .map_err(|e| db_err(e, "insert delegate"))?;
            tx.commit().map_err(|e| db_err(e, "commit"))?;
            Ok(rec)
        })
    }
}
