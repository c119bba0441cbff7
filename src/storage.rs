use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags, OptionalExtension};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::secrets::{SecretLifecycle, SecretVault};

pub const DB_KEY_ALIAS: &str = "sqlcipher-local-state-key";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<()>;
}

#[derive(Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteKeyValueStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteKeyValueStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.connection.lock();
        conn.query_row(
            "SELECT value FROM local_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT INTO local_state (key, value, updated_at)
            VALUES (?1, ?2, DATETIME('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            (key, value),
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        let conn = self.connection.lock();
        conn.execute("DELETE FROM local_state WHERE key = ?1", [key])?;
        Ok(())
    }
}

pub struct LocalStore {
    pub connection: Connection,
    pub path: PathBuf,
    pub key_lifecycle: SecretLifecycle,
    pub recovered: bool,
}

// an unreadable store is discarded and recreated with a fresh key
pub fn open_local_store<P: AsRef<Path>>(
    data_dir: P,
    database_file: &str,
    vault: &SecretVault,
) -> AppResult<LocalStore> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);
    let mut key = vault.ensure(DB_KEY_ALIAS)?;

    match open_encrypted(&db_path, key.secret()) {
        Ok(connection) => {
            info!(
                target: "local_store",
                path = %db_path.display(),
                lifecycle = key.lifecycle().as_str(),
                "encrypted local store opened"
            );
            Ok(LocalStore {
                connection,
                path: db_path,
                key_lifecycle: key.lifecycle(),
                recovered: false,
            })
        }
        Err(AppError::Database(err)) if is_unreadable(&err, &db_path) => {
            warn!(
                target: "local_store",
                path = %db_path.display(),
                error = %err,
                "local store unreadable with current key; recreating"
            );
            discard_database_files(&db_path)?;
            if key.lifecycle() == SecretLifecycle::Retrieved {
                key = vault.rotate(DB_KEY_ALIAS)?;
            }
            let connection = open_encrypted(&db_path, key.secret())?;
            Ok(LocalStore {
                connection,
                path: db_path,
                key_lifecycle: key.lifecycle(),
                recovered: true,
            })
        }
        Err(err) => Err(err),
    }
}

fn open_encrypted(db_path: &Path, passphrase: &SecretString) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    connection.pragma_update(None, "key", passphrase.expose_secret())?;
    connection.pragma_update(None, "cipher_default_kdf_iter", 64000_i64)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    migrate(&connection)?;
    ensure_ciphertext_header(db_path)?;
    Ok(connection)
}

fn migrate(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS local_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );
        "#,
    )?;
    let version: i64 = connection.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < 1 {
        connection.pragma_update(None, "user_version", 1_i64)?;
        debug!(target: "local_store", "local store schema initialised");
    }
    Ok(())
}

fn ensure_ciphertext_header(db_path: &Path) -> AppResult<()> {
    if !db_path.exists() {
        return Err(AppError::Path(format!(
            "expected encrypted database at {}",
            db_path.display()
        )));
    }
    let mut header = [0_u8; 16];
    let read = File::open(db_path)?.read(&mut header)?;
    if read == header.len() && &header == b"SQLite format 3\0" {
        return Err(AppError::Config(
            "local store header is plaintext; SQLCipher key not applied".into(),
        ));
    }
    Ok(())
}

fn is_unreadable(err: &SqliteError, db_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }
    match err {
        SqliteError::SqliteFailure(code, message) => {
            code.code == ErrorCode::NotADatabase
                || message
                    .as_deref()
                    .map(|msg| msg.contains("encrypted") || msg.contains("malformed"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn discard_database_files(db_path: &Path) -> AppResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(suffix);
        match std::fs::remove_file(PathBuf::from(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(AppError::Io(err)),
        }
    }
    Ok(())
}
