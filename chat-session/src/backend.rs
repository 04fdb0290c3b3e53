//! Storage backends for the persisted conversation record.
//!
//! A backend is a plain key/value store: one serialized record per namespace.
//! Changes go through [`StateBackend::update`], which reads the current record
//! and writes its replacement while holding the backend's lock, so separate
//! processes sharing a store see each other's changes.

use anyhow::{Context, Result};
use chat_common::config::{StoreBackendKind, StoreConfig};
use fs4::fs_std::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// SQLite database file name inside the store directory.
pub const SQLITE_FILE: &str = "chat.db";

/// Computes the replacement for a stored record. `None` leaves it untouched.
pub type UpdateFn<'a> = dyn FnMut(Option<&str>) -> Result<Option<String>> + 'a;

/// Durable key/value storage for serialized state records.
pub trait StateBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Read the record stored under `namespace`, if any.
    fn load(&self, namespace: &str) -> Result<Option<String>>;

    /// Read the record under `namespace` and store what `apply` returns for
    /// it. No other writer can change the record in between.
    fn update(&self, namespace: &str, apply: &mut UpdateFn<'_>) -> Result<()>;

    /// Replace the record stored under `namespace`.
    fn save(&self, namespace: &str, record: &str) -> Result<()> {
        self.update(namespace, &mut |_| Ok(Some(record.to_string())))
    }
}

/// Open the backend selected by the store configuration.
pub fn open_backend(config: &StoreConfig) -> Result<Box<dyn StateBackend>> {
    let dir = config.dir();
    match config.backend {
        StoreBackendKind::File => Ok(Box::new(JsonFileBackend::new(dir))),
        StoreBackendKind::Sqlite => Ok(Box::new(SqliteBackend::new(&dir.join(SQLITE_FILE))?)),
    }
}

// ============================================================================
// JSON file
// ============================================================================

/// Stores each namespace as `<dir>/<namespace>.json`.
///
/// Updates hold an exclusive lock on `<namespace>.lock` for the whole
/// read-modify-write. The new record is written to a temporary file and
/// renamed over the old one, so readers and crashes only ever see a complete
/// record.
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the file holding `namespace`.
    pub fn path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn lock_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.lock"))
    }

    fn temp_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json.tmp"))
    }

    fn update_locked(&self, namespace: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        let current = self.load(namespace)?;
        let Some(record) = apply(current.as_deref())? else {
            return Ok(());
        };

        let path = self.path(namespace);
        let temp = self.temp_path(namespace);
        write_synced(&temp, &record)
            .with_context(|| format!("Failed to write state file {}", temp.display()))?;
        fs::rename(&temp, &path)
            .with_context(|| format!("Failed to replace state file {}", path.display()))
    }
}

impl StateBackend for JsonFileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn load(&self, namespace: &str) -> Result<Option<String>> {
        let path = self.path(namespace);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file {}", path.display()))
            }
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(contents))
    }

    fn update(&self, namespace: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let lock_path = self.lock_path(namespace);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        lock.lock_exclusive().context("Failed to lock state file")?;

        let result = self.update_locked(namespace, apply);

        FileExt::unlock(&lock).context("Failed to unlock state file")?;
        result
    }
}

fn write_synced(path: &Path, record: &str) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(record.as_bytes())?;
    file.sync_all()
}

// ============================================================================
// SQLite
// ============================================================================

/// How long a writer waits for another process holding the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Stores records in a `kv_store` table, one row per namespace.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl StateBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn load(&self, namespace: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;

        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![namespace],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn update(&self, namespace: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;

        // IMMEDIATE takes the write lock up front so the read below is current
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![namespace],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        if let Some(record) = apply(current.as_deref())? {
            tx.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![namespace, record, chrono::Utc::now().timestamp()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// In memory
// ============================================================================

/// Process-local backend. Writes can be made to fail for testing.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, e.g. to simulate a previous run.
    pub fn with_record(self, namespace: &str, record: &str) -> Self {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), record.to_string());
        self
    }

    /// Make every following `save` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The record currently stored under `namespace`.
    pub fn record(&self, namespace: &str) -> Option<String> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }
}

impl StateBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self, namespace: &str) -> Result<Option<String>> {
        Ok(self.record(namespace))
    }

    fn update(&self, namespace: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = apply(records.get(namespace).map(String::as_str))? else {
            return Ok(());
        };
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("storage quota exceeded");
        }
        records.insert(namespace.to_string(), record);
        Ok(())
    }
}

impl<B: StateBackend + ?Sized> StateBackend for std::sync::Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn load(&self, namespace: &str) -> Result<Option<String>> {
        (**self).load(namespace)
    }

    fn update(&self, namespace: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        (**self).update(namespace, apply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_backend_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(tmp.path().join("nested"));

        assert_eq!(backend.load("chat-state").unwrap(), None);
        backend.save("chat-state", r#"{"version":1}"#).unwrap();
        assert_eq!(
            backend.load("chat-state").unwrap().as_deref(),
            Some(r#"{"version":1}"#)
        );
        assert!(tmp.path().join("nested/chat-state.json").exists());
    }

    #[test]
    fn test_file_backend_shorter_write_truncates() {
        let tmp = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(tmp.path());

        backend.save("ns", "a much longer first record").unwrap();
        backend.save("ns", "short").unwrap();
        assert_eq!(backend.load("ns").unwrap().as_deref(), Some("short"));
    }

    #[test]
    fn test_file_backend_replaces_atomically() {
        let tmp = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(tmp.path());
        backend.save("ns", "first").unwrap();

        // Leftover from a write that crashed before the rename
        fs::write(tmp.path().join("ns.json.tmp"), "half a rec").unwrap();
        assert_eq!(backend.load("ns").unwrap().as_deref(), Some("first"));

        backend.save("ns", "second").unwrap();
        assert_eq!(backend.load("ns").unwrap().as_deref(), Some("second"));
        assert!(!tmp.path().join("ns.json.tmp").exists());
    }

    #[test]
    fn test_file_backend_update_sees_other_writers() {
        let tmp = TempDir::new().unwrap();
        let one = JsonFileBackend::new(tmp.path());
        let two = JsonFileBackend::new(tmp.path());

        one.save("ns", "a").unwrap();
        two.update("ns", &mut |current| Ok(Some(format!("{}b", current.unwrap_or_default()))))
            .unwrap();
        one.update("ns", &mut |current| Ok(Some(format!("{}c", current.unwrap_or_default()))))
            .unwrap();
        assert_eq!(one.load("ns").unwrap().as_deref(), Some("abc"));

        // Declining to write leaves the record alone
        one.update("ns", &mut |_| Ok(None)).unwrap();
        assert_eq!(two.load("ns").unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_file_backend_updates_from_threads_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        JsonFileBackend::new(&dir).save("count", "0").unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    let backend = JsonFileBackend::new(dir);
                    for _ in 0..25 {
                        backend
                            .update("count", &mut |current| {
                                let n: u32 = current.unwrap_or("0").parse()?;
                                Ok(Some((n + 1).to_string()))
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let backend = JsonFileBackend::new(&dir);
        assert_eq!(backend.load("count").unwrap().as_deref(), Some("100"));
    }

    #[test]
    fn test_file_backend_namespaces_are_separate() {
        let tmp = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(tmp.path());

        backend.save("one", "1").unwrap();
        backend.save("two", "2").unwrap();
        assert_eq!(backend.load("one").unwrap().as_deref(), Some("1"));
        assert_eq!(backend.load("two").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_sqlite_backend_upsert() {
        let backend = SqliteBackend::in_memory().unwrap();

        assert_eq!(backend.load("chat-state").unwrap(), None);
        backend.save("chat-state", "first").unwrap();
        backend.save("chat-state", "second").unwrap();
        assert_eq!(backend.load("chat-state").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn test_sqlite_backend_update_across_connections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(SQLITE_FILE);
        let one = SqliteBackend::new(&path).unwrap();
        let two = SqliteBackend::new(&path).unwrap();

        one.save("ns", "a").unwrap();
        two.update("ns", &mut |current| Ok(Some(format!("{}b", current.unwrap_or_default()))))
            .unwrap();
        one.update("ns", &mut |current| Ok(Some(format!("{}c", current.unwrap_or_default()))))
            .unwrap();
        assert_eq!(two.load("ns").unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_sqlite_backend_persists_on_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db").join(SQLITE_FILE);

        SqliteBackend::new(&path).unwrap().save("ns", "kept").unwrap();
        let reopened = SqliteBackend::new(&path).unwrap();
        assert_eq!(reopened.load("ns").unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn test_memory_backend_failing_writes() {
        let backend = MemoryBackend::new();
        backend.save("ns", "ok").unwrap();

        backend.set_fail_writes(true);
        let err = backend.save("ns", "lost").unwrap_err();
        assert!(err.to_string().contains("quota"));
        assert_eq!(backend.record("ns").as_deref(), Some("ok"));
    }

    #[test]
    fn test_open_backend_from_config() {
        let tmp = TempDir::new().unwrap();
        let mut config = StoreConfig {
            path: Some(tmp.path().to_string_lossy().into_owned()),
            ..StoreConfig::default()
        };

        assert_eq!(open_backend(&config).unwrap().name(), "file");

        config.backend = StoreBackendKind::Sqlite;
        assert_eq!(open_backend(&config).unwrap().name(), "sqlite");
        assert!(tmp.path().join(SQLITE_FILE).exists());
    }
}
