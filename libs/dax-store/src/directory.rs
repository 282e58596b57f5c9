//! Document store on a shared directory
//!
//! Layout under the root:
//!
//! - `control/{id}.json`: one file per command
//! - `options/{name}.json`: one file per options profile
//! - `status.jsonl`, `log.jsonl`: append-only, one document per line
//! - `.lock`: held while a command is acknowledged or purged
//!
//! Documents are written to a temporary name and renamed into place, so a
//! reader never sees half a file. Acknowledgment and purge are
//! read-modify-write cycles and run under the lock file, which makes them
//! atomic across every process sharing the directory.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dax_domain::control::{ControlDocument, DocumentId, DocumentStore, LogEntry, StatusReport, StoreError};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const LOCK_FILE: &str = ".lock";
const LOCK_RETRY: Duration = Duration::from_millis(2);
const LOCK_TRIES: u32 = 5000;
/// A lock older than this is left over from a crashed process
const STALE_LOCK: Duration = Duration::from_secs(30);

fn backend(what: &str, path: &Path, err: std::io::Error) -> StoreError {
    StoreError::backend(format!("{} {}: {}", what, path.display(), err))
}

/// Exclusive lock on the store directory, released on drop
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    async fn acquire(root: &Path) -> Result<Self, StoreError> {
        let path = root.join(LOCK_FILE);
        for _ in 0..LOCK_TRIES {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path).await {
                        warn!(path = %path.display(), "removing stale store lock");
                        Self::break_stale(&path).await?;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(backend("cannot create lock", &path, e)),
            }
        }
        Err(StoreError::backend(format!(
            "timed out waiting for {}",
            path.display()
        )))
    }

    /// Remove a stale lock without racing other nodes doing the same
    ///
    /// The lock is first renamed to a name only this caller knows, so at most
    /// one node claims it. If what was claimed turns out to be a fresh lock
    /// (taken by another node after the staleness check), it is linked back
    /// in place before the claimed name is removed.
    async fn break_stale(path: &Path) -> Result<(), StoreError> {
        let claimed = path.with_file_name(format!("{}.stale-{}", LOCK_FILE, Uuid::new_v4()));
        match fs::rename(path, &claimed).await {
            Ok(()) => {}
            // Already broken by another node
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(backend("cannot claim stale lock", path, e)),
        }

        if !Self::is_stale(&claimed).await {
            match fs::hard_link(&claimed, path).await {
                Ok(()) => debug!(path = %path.display(), "live store lock handed back"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not hand back a live store lock")
                }
            }
        }
        fs::remove_file(&claimed)
            .await
            .map_err(|e| backend("cannot remove claimed lock", &claimed, e))
    }

    async fn is_stale(path: &Path) -> bool {
        let Ok(metadata) = fs::metadata(path).await else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map_or(false, |age| age > STALE_LOCK)
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join("control"), root.join("options")] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| backend("cannot create", &dir, e))?;
        }
        info!(root = %root.display(), "directory store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn command_path(&self, id: &DocumentId) -> PathBuf {
        self.root.join("control").join(format!("{}.json", id))
    }

    fn options_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(StoreError::backend(format!("invalid options name '{}'", name)));
        }
        Ok(self.root.join("options").join(format!("{}.json", name)))
    }

    async fn write_atomic(path: &Path, value: &impl serde::Serialize) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::corrupt(path.display().to_string(), e))?;
        let tmp = path.with_extension(format!("tmp-{}", Uuid::now_v7()));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| backend("cannot write", &tmp, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| backend("cannot rename into", path, e))
    }

    async fn append_line(&self, file: &str, value: &impl serde::Serialize) -> Result<(), StoreError> {
        let path = self.root.join(file);
        let mut line = serde_json::to_vec(value)
            .map_err(|e| StoreError::corrupt(path.display().to_string(), e))?;
        line.push(b'\n');
        let mut out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| backend("cannot open", &path, e))?;
        out.write_all(&line)
            .await
            .map_err(|e| backend("cannot append to", &path, e))
    }

    /// Read one command; `None` if it does not exist
    async fn read_command(path: &Path) -> Result<Option<ControlDocument>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt(path.display().to_string(), e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend("cannot read", path, e)),
        }
    }

    async fn all_commands(&self) -> Result<Vec<(PathBuf, ControlDocument)>, StoreError> {
        let dir = self.root.join("control");
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| backend("cannot list", &dir, e))?;
        let mut commands = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| backend("cannot list", &dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_command(&path).await {
                Ok(Some(doc)) => commands.push((path, doc)),
                Ok(None) => {}
                // One bad file must not stop the control loop
                Err(e) => warn!(error = %e, "skipping unreadable command"),
            }
        }
        commands.sort_by_key(|(_, doc)| doc.id);
        Ok(commands)
    }

    /// Status reports written so far, oldest first
    pub async fn status_reports(&self) -> Result<Vec<StatusReport>, StoreError> {
        self.read_lines("status.jsonl").await
    }

    pub async fn log_entries(&self) -> Result<Vec<LogEntry>, StoreError> {
        self.read_lines("log.jsonl").await
    }

    async fn read_lines<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, StoreError> {
        let path = self.root.join(file);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend("cannot read", &path, e)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| StoreError::corrupt(path.display().to_string(), e))
            })
            .collect()
    }
}

impl DocumentStore for DirectoryStore {
    fn pending_commands(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Vec<ControlDocument>, StoreError>> + Send {
        async move {
            Ok(self
                .all_commands()
                .await?
                .into_iter()
                .map(|(_, doc)| doc)
                .filter(|doc| doc.is_addressed_to(host) && !doc.is_acknowledged_by(host))
                .collect())
        }
    }

    #[instrument(skip(self, id), fields(id = %id))]
    fn acknowledge(
        &self,
        id: &DocumentId,
        host: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let path = self.command_path(id);
        let host = host.to_string();
        async move {
            let _lock = DirLock::acquire(&self.root).await?;
            let Some(mut doc) = Self::read_command(&path).await? else {
                return Ok(false);
            };
            if doc.acknowledge(&host) {
                Self::write_atomic(&path, &doc).await?;
            }
            Ok(true)
        }
    }

    fn purge_acknowledged(&self) -> impl Future<Output = Result<usize, StoreError>> + Send {
        async move {
            let _lock = DirLock::acquire(&self.root).await?;
            let mut purged = 0;
            for (path, doc) in self.all_commands().await? {
                if !doc.is_complete() {
                    continue;
                }
                match fs::remove_file(&path).await {
                    Ok(()) => purged += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(backend("cannot remove", &path, e)),
                }
            }
            if purged > 0 {
                debug!(purged, "purged acknowledged commands");
            }
            Ok(purged)
        }
    }

    fn find_options(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send {
        let path = self.options_path(name);
        async move {
            let path = path?;
            match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(|e| StoreError::corrupt(path.display().to_string(), e)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(backend("cannot read", &path, e)),
            }
        }
    }

    fn insert_status(
        &self,
        report: &StatusReport,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move { self.append_line("status.jsonl", report).await }
    }

    fn insert_log(&self, entry: &LogEntry) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move { self.append_line("log.jsonl", entry).await }
    }

    fn insert_command(
        &self,
        command: &ControlDocument,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let path = self.command_path(&command.id);
        async move { Self::write_atomic(&path, command).await }
    }

    fn insert_options(&self, profile: Value) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            let name = profile
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| StoreError::backend("options profile has no name"))?;
            let path = self.options_path(name)?;
            Self::write_atomic(&path, &profile).await
        }
    }
}
