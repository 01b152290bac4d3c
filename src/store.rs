//! Durable artifact persistence.
//!
//! The engine sees storage as three logical stores, each holding a single
//! JSON record under the key `"current"`:
//!
//! | [`StoreName`] | Record |
//! |---|---|
//! | `extractedPages`  | [`SourcePages`] |
//! | `generatedImages` | [`ImageSet`] (map `key → GeneratedImage`) |
//! | `generatedVideos` | [`VideoSet`] (map `key → GeneratedVideo`) |
//!
//! [`ArtifactStore`] is the raw get/put/delete contract; [`MemoryStore`] and
//! [`FileStore`] implement it. [`Artifacts`] sits on top and turns every
//! single-key update into a serialized read-modify-write of the whole map, so
//! two fan-out tasks finishing at the same instant cannot overwrite each
//! other's record.

use crate::error::FlipbookError;
use crate::model::{
    GeneratedImage, GeneratedVideo, ImageKey, ImageSet, SourcePages, VideoKey, VideoSet,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// The only record key the engine uses.
pub const CURRENT: &str = "current";

/// Logical store names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    ExtractedPages,
    GeneratedImages,
    GeneratedVideos,
}

impl StoreName {
    pub const ALL: [StoreName; 3] = [
        StoreName::ExtractedPages,
        StoreName::GeneratedImages,
        StoreName::GeneratedVideos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::ExtractedPages => "extractedPages",
            StoreName::GeneratedImages => "generatedImages",
            StoreName::GeneratedVideos => "generatedVideos",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key → JSON record persistence. Last write wins.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, FlipbookError>;

    async fn put(&self, store: StoreName, key: &str, record: Value) -> Result<(), FlipbookError>;

    /// Deleting an absent record is not an error.
    async fn delete(&self, store: StoreName, key: &str) -> Result<(), FlipbookError>;
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Process-local store. Used by tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(StoreName, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, FlipbookError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&(store, key.to_string())).cloned())
    }

    async fn put(&self, store: StoreName, key: &str, record: Value) -> Result<(), FlipbookError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((store, key.to_string()), record);
        Ok(())
    }

    async fn delete(&self, store: StoreName, key: &str) -> Result<(), FlipbookError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(store, key.to_string()));
        Ok(())
    }
}

// ── File-backed store ────────────────────────────────────────────────────

/// One JSON file per record: `<root>/<store>/<key>.json`.
///
/// Writes go to a sibling `.json.tmp` file which is then renamed over the
/// target, so a crash never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, store: StoreName, key: &str) -> PathBuf {
        self.root.join(store.as_str()).join(format!("{key}.json"))
    }
}

fn store_err(store: StoreName, detail: impl fmt::Display) -> FlipbookError {
    FlipbookError::Store {
        store: store.to_string(),
        detail: detail.to_string(),
    }
}

#[async_trait]
impl ArtifactStore for FileStore {
    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, FlipbookError> {
        let path = self.path_for(store, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err(store, format!("{}: {e}", path.display()))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| store_err(store, format!("{}: {e}", path.display())))
    }

    async fn put(&self, store: StoreName, key: &str, record: Value) -> Result<(), FlipbookError> {
        let path = self.path_for(store, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FlipbookError::OutputWriteFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let bytes = serde_json::to_vec(&record).map_err(|e| store_err(store, e))?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| FlipbookError::OutputWriteFailed {
                path: tmp_path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| FlipbookError::OutputWriteFailed {
                path: path.clone(),
                source: e,
            })?;
        debug!("Stored {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    async fn delete(&self, store: StoreName, key: &str) -> Result<(), FlipbookError> {
        let path = self.path_for(store, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_err(store, format!("{}: {e}", path.display()))),
        }
    }
}

// ── Typed, serialized access ─────────────────────────────────────────────

/// Typed view over an [`ArtifactStore`] with a single writer.
///
/// All mutations take the same async lock for the whole read-modify-write.
pub struct Artifacts {
    store: Arc<dyn ArtifactStore>,
    writer: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Artifacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifacts").finish_non_exhaustive()
    }
}

impl Artifacts {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    // ── Source pages ──

    pub async fn load_pages(&self) -> Result<Option<SourcePages>, FlipbookError> {
        self.load(StoreName::ExtractedPages).await
    }

    pub async fn save_pages(&self, pages: &SourcePages) -> Result<(), FlipbookError> {
        let _guard = self.writer.lock().await;
        self.save(StoreName::ExtractedPages, pages).await
    }

    // ── Images ──

    /// All stored images; empty when none were generated yet.
    pub async fn load_images(&self) -> Result<ImageSet, FlipbookError> {
        Ok(self
            .load(StoreName::GeneratedImages)
            .await?
            .unwrap_or_default())
    }

    /// Insert or replace the record for `image.key`, leaving every other
    /// record untouched.
    pub async fn upsert_image(&self, image: GeneratedImage) -> Result<(), FlipbookError> {
        self.modify(StoreName::GeneratedImages, |set: &mut ImageSet| {
            set.insert(image.key, image);
        })
        .await
    }

    /// Mark a stored image as downloaded. No-op when the record is gone.
    pub async fn mark_image_downloaded(&self, key: ImageKey) -> Result<(), FlipbookError> {
        self.modify(StoreName::GeneratedImages, |set: &mut ImageSet| {
            if let Some(img) = set.get_mut(&key) {
                img.downloaded = true;
            }
        })
        .await
    }

    pub async fn reset_images(&self) -> Result<(), FlipbookError> {
        let _guard = self.writer.lock().await;
        self.store.delete(StoreName::GeneratedImages, CURRENT).await
    }

    // ── Videos ──

    pub async fn load_videos(&self) -> Result<VideoSet, FlipbookError> {
        Ok(self
            .load(StoreName::GeneratedVideos)
            .await?
            .unwrap_or_default())
    }

    pub async fn upsert_video(&self, video: GeneratedVideo) -> Result<(), FlipbookError> {
        self.modify(StoreName::GeneratedVideos, |set: &mut VideoSet| {
            set.insert(video.key, video);
        })
        .await
    }

    pub async fn mark_video_downloaded(
        &self,
        key: VideoKey,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), FlipbookError> {
        self.modify(StoreName::GeneratedVideos, |set: &mut VideoSet| {
            if let Some(v) = set.get_mut(&key) {
                v.downloaded_at = Some(at);
            }
        })
        .await
    }

    pub async fn reset_videos(&self) -> Result<(), FlipbookError> {
        let _guard = self.writer.lock().await;
        self.store.delete(StoreName::GeneratedVideos, CURRENT).await
    }

    /// Drop every record in every store.
    pub async fn clear_all(&self) -> Result<(), FlipbookError> {
        let _guard = self.writer.lock().await;
        for name in StoreName::ALL {
            self.store.delete(name, CURRENT).await?;
        }
        Ok(())
    }

    // ── Internals ──

    async fn load<T: DeserializeOwned>(&self, name: StoreName) -> Result<Option<T>, FlipbookError> {
        match self.store.get(name, CURRENT).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| store_err(name, format!("malformed record: {e}"))),
        }
    }

    async fn save<T: Serialize>(&self, name: StoreName, record: &T) -> Result<(), FlipbookError> {
        let value = serde_json::to_value(record).map_err(|e| store_err(name, e))?;
        self.store.put(name, CURRENT, value).await
    }

    async fn modify<T, F>(&self, name: StoreName, f: F) -> Result<(), FlipbookError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let _guard = self.writer.lock().await;
        let mut record: T = self.load(name).await?.unwrap_or_default();
        f(&mut record);
        self.save(name, &record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn image(key: ImageKey, url: &str) -> GeneratedImage {
        GeneratedImage {
            key,
            url: url.to_string(),
            generated_at: Utc::now(),
            downloaded: false,
        }
    }

    #[tokio::test]
    async fn memory_store_get_put_delete() {
        let store = MemoryStore::new();
        assert!(store
            .get(StoreName::GeneratedImages, CURRENT)
            .await
            .unwrap()
            .is_none());
        store
            .put(StoreName::GeneratedImages, CURRENT, json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(
            store.get(StoreName::GeneratedImages, CURRENT).await.unwrap(),
            Some(json!({"a": 1}))
        );
        store.delete(StoreName::GeneratedImages, CURRENT).await.unwrap();
        store.delete(StoreName::GeneratedImages, CURRENT).await.unwrap();
        assert!(store
            .get(StoreName::GeneratedImages, CURRENT)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn file_store_round_trips_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .put(StoreName::GeneratedVideos, CURRENT, json!({"opening": {}}))
            .await
            .unwrap();
        let got = store.get(StoreName::GeneratedVideos, CURRENT).await.unwrap();
        assert_eq!(got, Some(json!({"opening": {}})));

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("generatedVideos"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["current.json"]);

        store.delete(StoreName::GeneratedVideos, CURRENT).await.unwrap();
        assert!(store
            .get(StoreName::GeneratedVideos, CURRENT)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn file_store_reports_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("extractedPages")).unwrap();
        std::fs::write(dir.path().join("extractedPages/current.json"), b"{not json").unwrap();
        let err = FileStore::new(dir.path())
            .get(StoreName::ExtractedPages, CURRENT)
            .await
            .unwrap_err();
        assert!(matches!(err, FlipbookError::Store { .. }));
    }

    #[tokio::test]
    async fn upsert_replaces_only_its_own_key() {
        let artifacts = Artifacts::new(Arc::new(MemoryStore::new()));
        artifacts.upsert_image(image(ImageKey::Cover, "a")).await.unwrap();
        artifacts
            .upsert_image(image(ImageKey::Spread(1), "b"))
            .await
            .unwrap();
        artifacts.upsert_image(image(ImageKey::Cover, "c")).await.unwrap();

        let images = artifacts.load_images().await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[&ImageKey::Cover].url, "c");
        assert_eq!(images[&ImageKey::Spread(1)].url, "b");
    }

    #[tokio::test]
    async fn concurrent_upserts_are_not_lost() {
        let artifacts = Arc::new(Artifacts::new(Arc::new(MemoryStore::new())));
        let tasks: Vec<_> = (1..=20)
            .map(|n| {
                let artifacts = Arc::clone(&artifacts);
                tokio::spawn(async move {
                    artifacts
                        .upsert_image(image(ImageKey::Spread(n), &format!("url-{n}")))
                        .await
                })
            })
            .collect();
        for t in futures::future::join_all(tasks).await {
            t.unwrap().unwrap();
        }
        assert_eq!(artifacts.load_images().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn mark_downloaded_and_clear_all() {
        let artifacts = Artifacts::new(Arc::new(MemoryStore::new()));
        artifacts.upsert_image(image(ImageKey::Cover, "a")).await.unwrap();
        artifacts.mark_image_downloaded(ImageKey::Cover).await.unwrap();
        assert!(artifacts.load_images().await.unwrap()[&ImageKey::Cover].downloaded);

        artifacts
            .save_pages(&SourcePages::from_ordered(vec![(vec![1], 1, 1)]))
            .await
            .unwrap();
        artifacts.clear_all().await.unwrap();
        assert!(artifacts.load_pages().await.unwrap().is_none());
        assert!(artifacts.load_images().await.unwrap().is_empty());
        assert!(artifacts.load_videos().await.unwrap().is_empty());
    }
}
