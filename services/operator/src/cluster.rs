//! Cluster orchestration API and its file-backed implementation.
//!
//! The operator only needs a narrow slice of the cluster: fetch a managed
//! pair, write its status, list what exists, ask about units, and remove a
//! unit so it comes back on a new image. [`JsonDirStore`] serves that slice
//! from a directory of JSON documents, one per pair.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ttpair_model::{ManagedPair, ObjectKey};

/// Phase reported for units the store knows nothing special about.
pub const DEFAULT_UNIT_PHASE: &str = "Running";

/// Errors returned by the cluster API.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("managed pair {0} not found")]
    NotFound(ObjectKey),

    /// The operator lacks permission for the call.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The object changed underneath us.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// Credentials for the object could not be resolved.
    #[error("cannot resolve credentials for {key}: {reason}")]
    Credentials { key: ObjectKey, reason: String },
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        match self {
            ClusterError::Forbidden(_) => true,
            other => ttpair_events::is_permission_error(&other.to_string()),
        }
    }
}

/// Result type for cluster calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// A listed object and its spec generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub key: ObjectKey,
    pub generation: i64,
}

/// The slice of the cluster API the operator consumes.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> ClusterResult<ManagedPair>;

    /// Replace the status of the stored object; the spec is left alone.
    async fn update_status(&self, pair: &ManagedPair) -> ClusterResult<()>;

    async fn list_keys(&self) -> ClusterResult<Vec<ObjectRef>>;

    /// Lifecycle phase of a unit, or `None` when no such unit exists yet.
    async fn unit_phase(&self, pair: &ManagedPair, unit: &str) -> ClusterResult<Option<String>>;

    /// True when some unit still runs an outdated image.
    async fn image_update_requested(&self, pair: &ManagedPair) -> ClusterResult<bool>;

    /// Remove a unit so the cluster recreates it on the current image.
    async fn delete_unit(&self, pair: &ManagedPair, unit: &str) -> ClusterResult<()>;
}

/// Cluster-side facts about a pair kept next to the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Phase overrides by unit name.
    pub unit_phases: BTreeMap<String, String>,
    /// Units that do not exist in the cluster.
    pub absent_units: Vec<String>,
    /// Units still running an outdated image.
    pub outdated_units: Vec<String>,
    /// Units removed by the operator, oldest first.
    pub deleted_units: Vec<String>,
}

/// On-disk document: the managed pair plus its cluster section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPair {
    #[serde(flatten)]
    pub pair: ManagedPair,
    #[serde(default)]
    pub cluster: ClusterSection,
}

/// Cluster API over a directory of `<namespace>.<name>.json` documents.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &ObjectKey) -> PathBuf {
        self.dir.join(format!("{}.{}.json", key.namespace, key.name))
    }

    /// Load a full document.
    pub async fn load(&self, key: &ObjectKey) -> ClusterResult<StoredPair> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ClusterError::NotFound(key.clone()))
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| ClusterError::Store(format!("{}: {}", path.display(), e)))
    }

    /// Write a full document atomically.
    pub async fn save(&self, doc: &StoredPair) -> ClusterResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let path = self.path_for(&doc.pair.key());
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| ClusterError::Store(format!("serialize {}: {}", doc.pair.key(), e)))?;

        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| io_error(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(path = %path.display(), "Saved managed pair");
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for JsonDirStore {
    async fn get(&self, key: &ObjectKey) -> ClusterResult<ManagedPair> {
        Ok(self.load(key).await?.pair)
    }

    async fn update_status(&self, pair: &ManagedPair) -> ClusterResult<()> {
        let mut doc = self.load(&pair.key()).await?;
        doc.pair.status = pair.status.clone();
        self.save(&doc).await
    }

    async fn list_keys(&self) -> ClusterResult<Vec<ObjectRef>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        let mut refs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str::<StoredPair>(&c).map_err(|e| e.to_string()));
            match parsed {
                Ok(doc) => refs.push(ObjectRef {
                    key: doc.pair.key(),
                    generation: doc.pair.generation,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
            }
        }
        refs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(refs)
    }

    async fn unit_phase(&self, pair: &ManagedPair, unit: &str) -> ClusterResult<Option<String>> {
        let doc = self.load(&pair.key()).await?;
        if doc.cluster.absent_units.iter().any(|u| u == unit) {
            return Ok(None);
        }
        Ok(Some(
            doc.cluster
                .unit_phases
                .get(unit)
                .cloned()
                .unwrap_or_else(|| DEFAULT_UNIT_PHASE.to_string()),
        ))
    }

    async fn image_update_requested(&self, pair: &ManagedPair) -> ClusterResult<bool> {
        Ok(!self.load(&pair.key()).await?.cluster.outdated_units.is_empty())
    }

    async fn delete_unit(&self, pair: &ManagedPair, unit: &str) -> ClusterResult<()> {
        let mut doc = self.load(&pair.key()).await?;
        doc.cluster.outdated_units.retain(|u| u != unit);
        doc.cluster.deleted_units.push(unit.to_string());
        self.save(&doc).await?;
        info!(pair = %pair.key(), unit, "Unit removed for image update");
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> ClusterError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ClusterError::Forbidden(format!("{}: {}", path.display(), e))
    } else {
        ClusterError::Store(format!("{}: {}", path.display(), e))
    }
}
