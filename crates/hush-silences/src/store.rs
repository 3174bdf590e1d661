//! Durable silence storage.
//!
//! This module provides:
//! - [`SilenceStore`]: The storage abstraction the manager writes through
//! - [`MemoryStore`]: A volatile store with availability and latency knobs
//! - [`FileStore`]: A JSON snapshot on disk, replaced atomically on every write
//!
//! Stores own the version counter. `update` succeeds only when the caller's
//! expected version matches the stored one and always writes
//! `expected + 1`. The `status` field kept by a store is a hint; the manager
//! recomputes status from the clock on every read.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SilenceError};
use crate::types::{paginate, Page, PageRequest, Silence, SilenceFilter, SilenceStatus};

/// Storage backend for silences.
#[async_trait]
pub trait SilenceStore: Send + Sync + fmt::Debug {
    /// Persists a new silence.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the ID is taken, or a store failure.
    async fn create(&self, silence: Silence) -> Result<Silence>;

    /// Fetches a silence by ID.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if absent, or a store failure.
    async fn get(&self, id: &str) -> Result<Silence>;

    /// Replaces a silence if its stored version equals `expected_version`.
    ///
    /// The written record carries version `expected_version + 1`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `ConcurrentModification`, or a store failure.
    async fn update(&self, silence: Silence, expected_version: u64) -> Result<Silence>;

    /// Removes a silence, returning the removed record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if absent, or a store failure.
    async fn delete(&self, id: &str) -> Result<Silence>;

    /// Lists silences newest-created-first. Status filtering uses the stored
    /// status hint.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    async fn list(&self, filter: &SilenceFilter, page: PageRequest) -> Result<Page<Silence>>;

    /// Refreshes stored status hints without bumping versions. Unknown IDs
    /// are ignored. Returns the number of records changed.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    async fn set_status_hints(&self, hints: &[(String, SilenceStatus)]) -> Result<usize>;

    /// Returns every stored silence, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    async fn load_all(&self) -> Result<Vec<Silence>>;
}

fn insert_new(map: &mut HashMap<String, Silence>, silence: Silence) -> Result<Silence> {
    if map.contains_key(&silence.id) {
        return Err(SilenceError::validation(format!(
            "silence {} already exists",
            silence.id
        )));
    }
    map.insert(silence.id.clone(), silence.clone());
    Ok(silence)
}

fn replace_versioned(
    map: &mut HashMap<String, Silence>,
    mut silence: Silence,
    expected_version: u64,
) -> Result<Silence> {
    let current = map
        .get(&silence.id)
        .ok_or_else(|| SilenceError::not_found(&silence.id))?;
    if current.version != expected_version {
        return Err(SilenceError::ConcurrentModification {
            id: silence.id,
            expected: expected_version,
            actual: current.version,
        });
    }
    silence.version = expected_version + 1;
    map.insert(silence.id.clone(), silence.clone());
    Ok(silence)
}

fn apply_hints(map: &mut HashMap<String, Silence>, hints: &[(String, SilenceStatus)]) -> usize {
    let mut changed = 0;
    for (id, status) in hints {
        if let Some(silence) = map.get_mut(id) {
            if silence.status != *status {
                silence.status = *status;
                changed += 1;
            }
        }
    }
    changed
}

fn list_filtered(
    map: &HashMap<String, Silence>,
    filter: &SilenceFilter,
    page: PageRequest,
) -> Page<Silence> {
    let matching = map
        .values()
        .filter(|s| filter.matches(s, s.status))
        .cloned()
        .collect();
    paginate(matching, page)
}

/// Volatile in-process store.
///
/// Besides being the default store for tests and single-node setups, it can
/// simulate an unreachable or slow backend.
#[derive(Debug)]
pub struct MemoryStore {
    silences: RwLock<HashMap<String, Silence>>,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            silences: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
        }
    }

    /// Marks the store reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Adds an artificial delay before every operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of stored silences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.silences.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.silences.read().is_empty()
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SilenceError::unavailable("memory store marked unavailable"))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SilenceStore for MemoryStore {
    async fn create(&self, silence: Silence) -> Result<Silence> {
        self.enter().await?;
        insert_new(&mut self.silences.write(), silence)
    }

    async fn get(&self, id: &str) -> Result<Silence> {
        self.enter().await?;
        self.silences
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SilenceError::not_found(id))
    }

    async fn update(&self, silence: Silence, expected_version: u64) -> Result<Silence> {
        self.enter().await?;
        replace_versioned(&mut self.silences.write(), silence, expected_version)
    }

    async fn delete(&self, id: &str) -> Result<Silence> {
        self.enter().await?;
        self.silences
            .write()
            .remove(id)
            .ok_or_else(|| SilenceError::not_found(id))
    }

    async fn list(&self, filter: &SilenceFilter, page: PageRequest) -> Result<Page<Silence>> {
        self.enter().await?;
        Ok(list_filtered(&self.silences.read(), filter, page))
    }

    async fn set_status_hints(&self, hints: &[(String, SilenceStatus)]) -> Result<usize> {
        self.enter().await?;
        Ok(apply_hints(&mut self.silences.write(), hints))
    }

    async fn load_all(&self) -> Result<Vec<Silence>> {
        self.enter().await?;
        Ok(self.silences.read().values().cloned().collect())
    }
}

/// On-disk snapshot layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    silences: Vec<Silence>,
}

const SNAPSHOT_FORMAT: u32 = 1;
const SNAPSHOT_FILE: &str = "silences.json";

/// Store backed by a single JSON snapshot file.
///
/// Every mutation rewrites the snapshot to a temporary file and renames it
/// over the previous one, so a crash leaves either the old or the new state.
/// The in-memory copy is only changed after the rename succeeded.
pub struct FileStore {
    path: Arc<PathBuf>,
    silences: Arc<Mutex<HashMap<String, Silence>>>,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Opens (or initialises) the snapshot in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the directory cannot be created or read,
    /// and `Serialization` if an existing snapshot is corrupt.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(SNAPSHOT_FILE);

        let silences = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.format != SNAPSHOT_FORMAT {
                    return Err(SilenceError::Serialization(format!(
                        "unsupported snapshot format {}",
                        snapshot.format
                    )));
                }
                snapshot
                    .silences
                    .into_iter()
                    .map(|s| (s.id.clone(), s))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), count = silences.len(), "Opened silence snapshot");
        Ok(Self {
            path: Arc::new(path),
            silences: Arc::new(Mutex::new(silences)),
        })
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `op` to a copy of the map, persists the copy if it changed and
    /// then swaps it in.
    ///
    /// The work runs on its own task, so a caller that stops waiting (for
    /// example on a deadline) cannot leave the snapshot on disk ahead of the
    /// in-memory copy.
    async fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut HashMap<String, Silence>) -> Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        let silences = Arc::clone(&self.silences);
        let task = tokio::spawn(async move {
            let mut guard = silences.lock_owned().await;
            let mut next = guard.clone();
            let out = op(&mut next)?;
            if next != *guard {
                write_snapshot(&path, &next).await?;
                *guard = next;
            }
            Ok::<T, SilenceError>(out)
        });
        task.await
            .map_err(|e| SilenceError::unavailable(format!("snapshot writer failed: {e}")))?
    }
}

async fn write_snapshot(path: &Path, silences: &HashMap<String, Silence>) -> Result<()> {
    let mut ordered: Vec<Silence> = silences.values().cloned().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let snapshot = Snapshot {
        format: SNAPSHOT_FORMAT,
        silences: ordered,
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = bytes.len(), "Wrote silence snapshot");
    Ok(())
}

#[async_trait]
impl SilenceStore for FileStore {
    async fn create(&self, silence: Silence) -> Result<Silence> {
        self.mutate(move |map| insert_new(map, silence)).await
    }

    async fn get(&self, id: &str) -> Result<Silence> {
        self.silences
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SilenceError::not_found(id))
    }

    async fn update(&self, silence: Silence, expected_version: u64) -> Result<Silence> {
        self.mutate(move |map| replace_versioned(map, silence, expected_version))
            .await
    }

    async fn delete(&self, id: &str) -> Result<Silence> {
        let id = id.to_string();
        self.mutate(move |map| map.remove(&id).ok_or_else(|| SilenceError::not_found(id)))
            .await
    }

    async fn list(&self, filter: &SilenceFilter, page: PageRequest) -> Result<Page<Silence>> {
        Ok(list_filtered(&*self.silences.lock().await, filter, page))
    }

    async fn set_status_hints(&self, hints: &[(String, SilenceStatus)]) -> Result<usize> {
        let hints = hints.to_vec();
        self.mutate(move |map| Ok(apply_hints(map, &hints))).await
    }

    async fn load_all(&self) -> Result<Vec<Silence>> {
        Ok(self.silences.lock().await.values().cloned().collect())
    }
}
