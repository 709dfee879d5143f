//! Finished artifacts awaiting one-time retrieval.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::JobId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub path: PathBuf,
    /// Name offered to the client on download.
    pub file_name: String,
    pub ready: bool,
    pub claimed: bool,
}

/// Storage behind the registry.
///
/// `claim` must be atomic: of two concurrent calls for the same ready entry
/// only one succeeds.
pub trait ArtifactStore: Send + Sync {
    fn insert(&self, id: JobId, entry: ArtifactEntry);
    fn get(&self, id: &JobId) -> Option<ArtifactEntry>;
    /// Returns false when the entry does not exist.
    fn set_ready(&self, id: &JobId) -> bool;
    fn claim(&self, id: &JobId) -> Option<ArtifactEntry>;
    fn release(&self, id: &JobId);
    fn remove(&self, id: &JobId) -> Option<ArtifactEntry>;
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: Mutex<HashMap<JobId, ArtifactEntry>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn insert(&self, id: JobId, entry: ArtifactEntry) {
        self.entries.lock().insert(id, entry);
    }

    fn get(&self, id: &JobId) -> Option<ArtifactEntry> {
        self.entries.lock().get(id).cloned()
    }

    fn set_ready(&self, id: &JobId) -> bool {
        match self.entries.lock().get_mut(id) {
            Some(entry) => {
                entry.ready = true;
                true
            }
            None => false,
        }
    }

    fn claim(&self, id: &JobId) -> Option<ArtifactEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).filter(|e| e.ready && !e.claimed)?;
        entry.claimed = true;
        Some(entry.clone())
    }

    fn release(&self, id: &JobId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.claimed = false;
        }
    }

    fn remove(&self, id: &JobId) -> Option<ArtifactEntry> {
        self.entries.lock().remove(id)
    }
}

#[derive(Clone)]
pub struct ArtifactRegistry {
    store: Arc<dyn ArtifactStore>,
    grace: Duration,
}

impl ArtifactRegistry {
    pub fn new(store: Arc<dyn ArtifactStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub fn in_memory(grace: Duration) -> Self {
        Self::new(Arc::new(InMemoryArtifactStore::new()), grace)
    }

    /// Record an artifact that is not yet retrievable.
    pub fn register(&self, id: JobId, path: impl Into<PathBuf>, file_name: impl Into<String>) {
        let entry = ArtifactEntry {
            path: path.into(),
            file_name: file_name.into(),
            ready: false,
            claimed: false,
        };
        debug!(job_id = %id, path = %entry.path.display(), "Artifact registered");
        self.store.insert(id, entry);
    }

    pub fn mark_ready(&self, id: &JobId) -> Result<()> {
        if self.store.set_ready(id) {
            debug!(job_id = %id, "Artifact ready");
            Ok(())
        } else {
            Err(Error::internal(format!("artifact `{id}` is not registered")))
        }
    }

    pub fn is_ready(&self, id: &JobId) -> bool {
        self.store.get(id).is_some_and(|e| e.ready)
    }

    /// Claim a ready artifact for transfer.
    ///
    /// Unknown, unfinished and already claimed artifacts are all `NotReady`.
    pub fn retrieve(&self, id: &JobId) -> Result<ArtifactLease> {
        let entry = self.store.claim(id).ok_or_else(|| Error::not_ready(id))?;
        debug!(job_id = %id, "Artifact claimed");
        Ok(ArtifactLease {
            id: id.clone(),
            path: entry.path,
            file_name: entry.file_name,
            registry: self.clone(),
            finished: false,
        })
    }

    /// Drop the entry and its file. Repeated calls are no-ops.
    pub async fn remove(&self, id: &JobId) {
        if let Some(entry) = self.store.remove(id) {
            remove_file_quietly(&entry.path).await;
            debug!(job_id = %id, "Artifact removed");
        }
    }

    fn schedule_removal(&self, id: JobId) {
        let registry = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(registry.grace).await;
                    registry.remove(&id).await;
                });
            }
            Err(_) => {
                if let Some(entry) = registry.store.remove(&id) {
                    let _ = std::fs::remove_file(entry.path);
                }
            }
        }
    }
}

/// Exclusive claim on a ready artifact.
///
/// The artifact is deleted after the grace period once the lease is dropped.
/// A lease dropped without [`finish`](Self::finish) also frees the claim, so
/// the artifact can be fetched again until deletion.
pub struct ArtifactLease {
    id: JobId,
    path: PathBuf,
    file_name: String,
    registry: ArtifactRegistry,
    finished: bool,
}

impl ArtifactLease {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Mark the transfer complete.
    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl std::fmt::Debug for ArtifactLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactLease")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        if !self.finished {
            warn!(job_id = %self.id, "Artifact transfer did not finish, releasing claim");
            self.registry.store.release(&self.id);
        }
        self.registry.schedule_removal(self.id.clone());
    }
}

pub(crate) async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
