//! Weight persistence.
//!
//! The durable store is an external collaborator; [`WeightStore`] is its
//! seam. Implementations must make `save` atomic per key: a reader sees
//! either the previous record or the new one, never a mix.
//!
//! - [`InMemoryWeightStore`]: process-local map, used by tests and simulation
//! - [`FileWeightStore`]: one JSON file per user, written to a temporary file
//!   and renamed over the target

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::ModelWeights;
use crate::error::StoreError;
use crate::privacy::user_tag;

/// Persistence seam for per-user model weights.
#[async_trait]
pub trait WeightStore: Send + Sync {
    /// Load a user's weights, `None` if the user has no model yet.
    async fn load(&self, user_id: &str) -> Result<Option<ModelWeights>, StoreError>;

    /// Atomically replace a user's weights.
    async fn save(&self, user_id: &str, weights: &ModelWeights) -> Result<(), StoreError>;

    /// Remove a user's weights. Removing an absent user is not an error.
    async fn delete(&self, user_id: &str) -> Result<(), StoreError>;

    /// Verify the backend is usable.
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// InMemoryWeightStore
// ---------------------------------------------------------------------------

/// Process-local store.
#[derive(Default)]
pub struct InMemoryWeightStore {
    records: DashMap<String, ModelWeights>,
}

impl InMemoryWeightStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored users.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no user has a model.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl WeightStore for InMemoryWeightStore {
    async fn load(&self, user_id: &str) -> Result<Option<ModelWeights>, StoreError> {
        Ok(self.records.get(user_id).map(|w| w.clone()))
    }

    async fn save(&self, user_id: &str, weights: &ModelWeights) -> Result<(), StoreError> {
        self.records.insert(user_id.to_string(), weights.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        self.records.remove(user_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// FileWeightStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per user under a root directory.
///
/// File names are derived from the anonymized user tag, so raw ids never
/// reach the file system.
pub struct FileWeightStore {
    root: PathBuf,
}

impl FileWeightStore {
    /// Store rooted at `root`. The directory is created on first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", user_tag(user_id)))
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))
    }
}

#[async_trait]
impl WeightStore for FileWeightStore {
    async fn load(&self, user_id: &str) -> Result<Option<ModelWeights>, StoreError> {
        let path = self.path_for(user_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let weights: ModelWeights = serde_json::from_slice(&bytes).map_err(|source| StoreError::Serialization {
            key: user_tag(user_id),
            source,
        })?;
        let issues = weights.integrity_issues();
        if !issues.is_empty() {
            return Err(StoreError::corrupt(user_tag(user_id), issues.join("; ")));
        }
        Ok(Some(weights))
    }

    async fn save(&self, user_id: &str, weights: &ModelWeights) -> Result<(), StoreError> {
        self.ensure_root().await?;
        let path = self.path_for(user_id);
        let tmp = path.with_extension(format!("json.tmp-{}", Uuid::new_v4().simple()));
        let json = serde_json::to_vec_pretty(weights).map_err(|source| StoreError::Serialization {
            key: user_tag(user_id),
            source,
        })?;
        tokio::fs::write(&tmp, json).await.map_err(|e| StoreError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(path, e));
        }
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(user_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.ensure_root().await?;
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;
        if meta.permissions().readonly() {
            return Err(StoreError::Unavailable(format!("{} is read-only", self.root.display())));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = InMemoryWeightStore::new();
        assert!(store.load("u").await.unwrap().is_none());
        let w = ModelWeights::default_architecture(1);
        store.save("u", &w).await.unwrap();
        assert_eq!(store.load("u").await.unwrap(), Some(w));
        store.delete("u").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn file_store_round_trip_and_no_raw_id_on_disk() {
        let dir = tempdir().unwrap();
        let store = FileWeightStore::new(dir.path().join("weights"));
        store.health_check().await.unwrap();

        let w = ModelWeights::default_architecture(2);
        store.save("alice@example.com", &w).await.unwrap();
        assert_eq!(store.load("alice@example.com").await.unwrap(), Some(w));

        let names: Vec<String> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1, "temporary file left behind: {names:?}");
        assert!(!names[0].contains("alice"));
    }

    #[tokio::test]
    async fn file_store_missing_user_is_none_and_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileWeightStore::new(dir.path());
        assert!(store.load("nobody").await.unwrap().is_none());
        store.delete("nobody").await.unwrap();
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_record() {
        let dir = tempdir().unwrap();
        let store = FileWeightStore::new(dir.path());
        let mut w = ModelWeights::default_architecture(2);
        w.layers[0].biases.clear();
        store.save("u", &w).await.unwrap();
        assert!(matches!(store.load("u").await, Err(StoreError::Corrupt { .. })));
    }
}
