//! Flat-file persistence for every entity (module registry, batch state, batch
//! results, execution history).
//!
//! Files are small and read/rewritten wholesale. Each operation runs on the
//! blocking pool and holds an in-process lock for its file path, so every file
//! has a single writer at a time. Reads are tolerant: a missing or malformed
//! file reads as empty.

pub mod pagination;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::logger::warn_if_slow;

/// A row type persisted as one line of a delimited file.
///
/// Serde field names must match `HEADERS`, in order.
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    const HEADERS: &'static [&'static str];
    const DELIMITER: u8 = b',';
}

pub struct RecordStore {
    root: PathBuf,
    /// Per-path write locks; an entry lives only while an operation holds it.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `file`; absolute inputs are returned unchanged.
    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    /// Appends `rows`, writing the header first if the file is new or empty.
    #[instrument(skip(self, rows), target = "store", fields(count = rows.len()))]
    pub async fn append<T: Record>(&self, file: &str, rows: Vec<T>) -> AppResult<()> {
        self.with_file(file, move |path| append_rows(path, &rows))
            .await
            .map_err(|e| AppError::not_saved(file, e))
    }

    /// Every row of `file`; empty if the file is absent or any row is malformed.
    pub async fn read_all<T: Record>(&self, file: &str) -> Vec<T> {
        match self.with_file(file, |path| read_rows::<T>(path)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(file, error = %format!("{e:#}"), "unreadable record file; treating as empty");
                Vec::new()
            }
        }
    }

    /// Replaces the content of `file` with the header and `rows`.
    #[instrument(skip(self, rows), target = "store", fields(count = rows.len()))]
    pub async fn rewrite_all<T: Record>(&self, file: &str, rows: Vec<T>) -> AppResult<()> {
        self.with_file(file, move |path| rewrite_rows(path, &rows))
            .await
            .map_err(|e| AppError::not_saved(file, e))
    }

    /// Read-modify-rewrite under the file lock.
    ///
    /// `f` receives every current row and returns the rows to keep plus a value
    /// handed back to the caller. Unlike `read_all`, a malformed file is an
    /// error here so it is never silently overwritten.
    #[instrument(skip(self, f), target = "store")]
    pub async fn update<T, R, F>(&self, file: &str, f: F) -> AppResult<R>
    where
        T: Record,
        R: Send + 'static,
        F: FnOnce(Vec<T>) -> (Vec<T>, R) + Send + 'static,
    {
        self.with_file(file, move |path| {
            let rows = read_rows::<T>(path)?;
            let (rows, out) = f(rows);
            rewrite_rows(path, &rows)?;
            Ok(out)
        })
        .await
        .map_err(|e| AppError::not_saved(file, e))
    }

    /// Raw bytes of `file`, or `None` if it does not exist.
    pub async fn read_bytes(&self, file: &str) -> AppResult<Option<Vec<u8>>> {
        self.with_file(file, |path| {
            if !path.exists() {
                return Ok(None);
            }
            fs::read(path)
                .map(Some)
                .with_context(|| format!("failed to read {}", path.display()))
        })
        .await
        .map_err(|e| AppError::not_found(format!("{file}: {e:#}")))
    }

    pub async fn exists(&self, file: &str) -> bool {
        let path = self.path(file);
        tokio::task::spawn_blocking(move || path.exists())
            .await
            .unwrap_or(false)
    }

    /// Deletes `file`; a missing file is not an error and yields `false`.
    pub async fn remove_file(&self, file: &str) -> AppResult<bool> {
        self.with_file(file, |path| match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context(format!("failed to delete {}", path.display()))),
        })
        .await
        .map_err(|e| AppError::not_saved(file, e))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry for `path` once no operation references it.
    fn release(&self, path: &Path) {
        let mut locks = self.locks.lock();
        if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(path);
        }
    }

    /// Runs `f` on the blocking pool while holding the lock for `file`.
    async fn with_file<R, F>(&self, file: &str, f: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Path) -> anyhow::Result<R> + Send + 'static,
    {
        let path = self.path(file);
        let lock = self.lock_for(&path);

        let target = path.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            f(&target)
        });

        let out = warn_if_slow("record_file_io", Duration::from_millis(200), task).await;
        self.release(&path);
        out.context("record file task panicked")?
    }
}

fn append_rows<T: Record>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let is_new = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut writer = csv::WriterBuilder::new()
        .delimiter(T::DELIMITER)
        .has_headers(false)
        .from_writer(file);

    if is_new {
        writer.write_record(T::HEADERS)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    debug!(path = %path.display(), count = rows.len(), "rows appended");
    Ok(())
}

fn read_rows<T: Record>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(T::DELIMITER)
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.with_context(|| format!("malformed row in {}", path.display()))?);
    }
    Ok(rows)
}

/// Writes to a sibling temp file and renames it over `path`.
fn rewrite_rows<T: Record>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(T::DELIMITER)
            .has_headers(false)
            .from_path(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;

        writer.write_record(T::HEADERS)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }

    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    debug!(path = %path.display(), count = rows.len(), "file rewritten");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        payload: String,
        note: Option<String>,
    }

    impl Record for Row {
        const HEADERS: &'static [&'static str] = &["id", "payload", "note"];
        const DELIMITER: u8 = b'|';
    }

    fn row(id: &str, payload: &str) -> Row {
        Row {
            id: id.into(),
            payload: payload.into(),
            note: None,
        }
    }

    #[tokio::test]
    async fn append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        store.append("t.csv", vec![row("1", "a")]).await.unwrap();
        store.append("t.csv", vec![row("2", "b")]).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("t.csv")).unwrap();
        assert_eq!(text.matches("id|payload|note").count(), 1);

        let rows: Vec<Row> = store.read_all("t.csv").await;
        assert_eq!(rows, vec![row("1", "a"), row("2", "b")]);
    }

    #[tokio::test]
    async fn json_with_delimiters_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let tricky = row("1", r#"{"a":"x|y","b":"line\nbreak, \"quoted\""}"#);

        store.append("t.csv", vec![tricky.clone()]).await.unwrap();

        let rows: Vec<Row> = store.read_all("t.csv").await;
        assert_eq!(rows, vec![tricky]);
    }

    #[tokio::test]
    async fn missing_or_malformed_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let rows: Vec<Row> = store.read_all("absent.csv").await;
        assert!(rows.is_empty());

        std::fs::write(dir.path().join("bad.csv"), "id|payload|note\n1|a|x|extra|cells\n").unwrap();
        let rows: Vec<Row> = store.read_all("bad.csv").await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn update_filters_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store
            .append("t.csv", vec![row("1", "a"), row("2", "b"), row("3", "c")])
            .await
            .unwrap();

        let removed = store
            .update("t.csv", |rows: Vec<Row>| {
                let before = rows.len();
                let kept: Vec<Row> = rows.into_iter().filter(|r| r.id != "2").collect();
                let removed = before - kept.len();
                (kept, removed)
            })
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let rows: Vec<Row> = store.read_all("t.csv").await;
        assert_eq!(rows, vec![row("1", "a"), row("3", "c")]);
    }

    #[tokio::test]
    async fn rewrite_with_no_rows_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        store.rewrite_all::<Row>("t.csv", vec![]).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("t.csv")).unwrap();
        assert_eq!(text.trim(), "id|payload|note");
        assert!(store.read_all::<Row>("t.csv").await.is_empty());
    }

    #[tokio::test]
    async fn remove_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        assert!(!store.remove_file("nope.csv").await.unwrap());
        store.append("t.csv", vec![row("1", "a")]).await.unwrap();
        assert!(store.exists("t.csv").await);
        assert!(store.remove_file("t.csv").await.unwrap());
        assert!(store.read_bytes("t.csv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::new(dir.path()));

        let mut set = tokio::task::JoinSet::new();
        for i in 0..20 {
            let s = Arc::clone(&store);
            set.spawn(async move { s.append("t.csv", vec![row(&i.to_string(), "x")]).await });
        }
        while let Some(res) = set.join_next().await {
            res.expect("task panicked").expect("append failed");
        }

        let rows: Vec<Row> = store.read_all("t.csv").await;
        assert_eq!(rows.len(), 20);
        assert!(store.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn file_locks_are_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        for i in 0..10 {
            let file = format!("b_{i}.csv");
            store.append(&file, vec![row("1", "a")]).await.unwrap();
            let _: Vec<Row> = store.read_all(&file).await;
            store.remove_file(&file).await.unwrap();
        }

        assert!(store.locks.lock().is_empty());
    }
}
