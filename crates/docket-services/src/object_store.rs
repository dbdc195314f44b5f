//! Filesystem-backed object store.
//!
//! Objects live at `{root}/{bucket}/{key}`. Writes go to a temporary sibling
//! and are renamed into place so readers never observe a partial object.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use docket_core::{defaults, Error, ObjectStore, Result, SourceLocation};

pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `OBJECT_STORE_ROOT`, falling back to the default.
    pub fn from_env() -> Self {
        let root = std::env::var("OBJECT_STORE_ROOT")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| defaults::OBJECT_STORE_ROOT.to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a location, refusing keys that would escape the root.
    fn path_for(&self, location: &SourceLocation) -> Result<PathBuf> {
        let relative = Path::new(&location.bucket).join(&location.key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || location.bucket.is_empty() || location.key.is_empty() {
            return Err(Error::Validation(format!(
                "invalid object location: {location}"
            )));
        }
        Ok(self.root.join(relative))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        path.with_file_name(name)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "object_store: create_dir_all failed");
                e
            })?;
        }
        Ok(())
    }

    fn not_found(location: &SourceLocation, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Validation(format!("source object not found: {location}"))
        } else {
            Error::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn size(&self, location: &SourceLocation) -> Result<u64> {
        let path = self.path_for(location)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(location, e))?;
        Ok(meta.len())
    }

    async fn read(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        let path = self.path_for(location)?;
        fs::read(&path)
            .await
            .map_err(|e| Self::not_found(location, e))
    }

    async fn download_to(&self, location: &SourceLocation, dest: &Path) -> Result<u64> {
        let path = self.path_for(location)?;
        let bytes = fs::copy(&path, dest)
            .await
            .map_err(|e| Self::not_found(location, e))?;
        debug!(
            subsystem = "services",
            component = "object_store",
            location = %location,
            dest = %dest.display(),
            size_bytes = bytes,
            "Object downloaded to local disk"
        );
        Ok(bytes)
    }

    async fn put(&self, location: &SourceLocation, data: &[u8]) -> Result<()> {
        let path = self.path_for(location)?;
        Self::ensure_parent(&path).await?;

        let temp = Self::temp_path(&path);
        let mut file = fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &path).await.map_err(|e| {
            warn!(from = %temp.display(), to = %path.display(), error = %e, "object_store: rename failed");
            e
        })?;
        Ok(())
    }

    async fn upload_from(&self, location: &SourceLocation, src: &Path) -> Result<u64> {
        let path = self.path_for(location)?;
        Self::ensure_parent(&path).await?;

        let temp = Self::temp_path(&path);
        let bytes = fs::copy(src, &temp).await?;
        fs::rename(&temp, &path).await?;
        Ok(bytes)
    }

    async fn delete(&self, location: &SourceLocation) -> Result<()> {
        let path = self.path_for(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::ErrorKind;

    #[tokio::test]
    async fn test_put_read_size_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        let loc = SourceLocation::new("intake", "2024/complaint.pdf");

        store.put(&loc, b"hello").await.unwrap();
        assert_eq!(store.size(&loc).await.unwrap(), 5);
        assert_eq!(store.read(&loc).await.unwrap(), b"hello");

        store.delete(&loc).await.unwrap();
        // Deleting twice is fine
        store.delete(&loc).await.unwrap();
        assert_eq!(store.size(&loc).await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_download_and_upload_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path().join("objects"));
        let loc = SourceLocation::new("intake", "big.pdf");
        store.put(&loc, &vec![7u8; 4096]).await.unwrap();

        let local = dir.path().join("local.bin");
        assert_eq!(store.download_to(&loc, &local).await.unwrap(), 4096);

        let part = loc.part(0);
        assert_eq!(store.upload_from(&part, &local).await.unwrap(), 4096);
        assert_eq!(store.read(&part).await.unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        let err = store
            .read(&SourceLocation::new("intake", "../../etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
