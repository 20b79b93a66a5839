//! Production implementations backed by Tokio and the local filesystem.

use crate::error::EnvError;
use crate::types::StreamKind;
use crate::{LabelViewContext, SolutionStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Production context backed by Tokio.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LabelViewContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "spawning task");
        tokio::spawn(future);
    }
}

/// File-backed solution store.
///
/// Layout: `<root>/<folder>/label/<stream file>`. Saves write a sibling
/// temporary file and rename it over the target, so readers never see a
/// partially written solution.
pub struct FsStore {
    root: PathBuf,
    /// Disambiguates temporary files of overlapping saves
    temp_counter: AtomicU64,
}

impl FsStore {
    /// Creates a store rooted at the given scene directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the on-disk path of a stream.
    pub fn stream_path(&self, stream: StreamKind, folder: &str) -> Result<PathBuf, EnvError> {
        if folder.is_empty() || folder.contains(['/', '\\']) || folder == "." || folder == ".." {
            return Err(EnvError::storage(format!("invalid folder name: {:?}", folder)));
        }
        Ok(self.root.join(folder).join("label").join(stream.file_name()))
    }
}

#[async_trait]
impl SolutionStore for FsStore {
    async fn load(&self, stream: StreamKind, folder: &str) -> Result<Option<Vec<u8>>, EnvError> {
        let path = self.stream_path(stream, folder)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, stream: StreamKind, folder: &str, bytes: Vec<u8>) -> Result<(), EnvError> {
        let path = self.stream_path(stream, folder)?;
        let dir = path
            .parent()
            .ok_or_else(|| EnvError::storage("stream path has no parent"))?;
        tokio::fs::create_dir_all(dir).await?;

        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{}.{}.tmp", stream.file_name(), n));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(%stream, folder, bytes = bytes.len(), "solution written");
        Ok(())
    }

    async fn folders(&self) -> Result<Vec<String>, EnvError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut folders = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    folders.push(name.to_string());
                }
            }
        }
        folders.sort();
        Ok(folders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_fs_store_missing_stream_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        let loaded = store.load(StreamKind::Objects, "scene-01").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_fs_store_save_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.save(StreamKind::Labels, "scene-01", vec![1, 2, 3, 4]).await.unwrap();
        store.save(StreamKind::Labels, "scene-01", vec![9]).await.unwrap();

        let loaded = store.load(StreamKind::Labels, "scene-01").await.unwrap();
        assert_eq!(loaded, Some(vec![9]));

        // Streams are independent
        let objects = store.load(StreamKind::Objects, "scene-01").await.unwrap();
        assert!(objects.is_none());

        assert_eq!(store.folders().await.unwrap(), vec!["scene-01".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        let result = store.save(StreamKind::Labels, "../escape", vec![1]).await;
        assert!(matches!(result, Err(EnvError::Storage(_))));
    }
}
