use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use super::{check_path, Storage, StorageError};

/// Files under a root directory. Writes land in `<path>.wip` and are
/// renamed into place once complete.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

fn wip_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".wip");
    PathBuf::from(name)
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(check_path(path)?))
    }

    async fn ensure_parent(&self, dest: &Path) -> Result<(), StorageError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(StorageError::io(parent.display()))?;
        }
        Ok(())
    }

    /// Remove empty directories from `dir` upwards, stopping at the root.
    async fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            tracing::trace!(dir = %current.display(), "Removed empty directory");
            dir = current.parent();
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::io(self.root.display()))
    }

    async fn stat(&self, path: &str) -> Result<Option<u64>, StorageError> {
        let full = self.resolve(path)?;
        match fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path)(e)),
        }
    }

    async fn get(
        &self,
        path: &str,
        start: u64,
        len: Option<u64>,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        let mut file = match fs::File::open(&full).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StorageError::io(path)(e)),
        };
        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(StorageError::io(path))?;
        }
        let copied = match len {
            Some(len) => tokio::io::copy(&mut file.take(len), sink).await,
            None => tokio::io::copy(&mut file, sink).await,
        };
        copied.map_err(StorageError::io(path))?;
        sink.flush().await.map_err(StorageError::io(path))?;
        Ok(true)
    }

    async fn put(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, StorageError> {
        let dest = self.resolve(path)?;
        self.ensure_parent(&dest).await?;
        let wip = wip_path(&dest);

        let written = async {
            let mut file = fs::File::create(&wip).await?;
            let n = tokio::io::copy(source, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(n)
        }
        .await;

        match written {
            Ok(n) => {
                fs::rename(&wip, &dest)
                    .await
                    .map_err(StorageError::io(path))?;
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&wip).await;
                Err(StorageError::io(wip.display())(e))
            }
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = self.resolve(from)?;
        let dest = self.resolve(to)?;
        self.ensure_parent(&dest).await?;
        fs::rename(&src, &dest)
            .await
            .map_err(StorageError::io(from))?;
        self.prune_empty_dirs(src.parent()).await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(path)(e)),
        }
        self.prune_empty_dirs(full.parent()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::hashing::HashingReader;

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("files"));
        storage.init().await.unwrap();
        (dir, storage)
    }

    async fn read_all(storage: &LocalStorage, path: &str, start: u64, len: Option<u64>) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        storage
            .get(path, start, len, &mut out)
            .await
            .unwrap()
            .then_some(out)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_dir, storage) = storage().await;
        let mut body: &[u8] = b"hello world";
        let n = storage.put("ab/cd/file.txt", &mut body).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(storage.stat("ab/cd/file.txt").await.unwrap(), Some(11));
        assert_eq!(
            read_all(&storage, "ab/cd/file.txt", 0, None).await.unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let (_dir, storage) = storage().await;
        let mut body: &[u8] = b"0123456789";
        storage.put("r.bin", &mut body).await.unwrap();
        assert_eq!(read_all(&storage, "r.bin", 3, Some(4)).await.unwrap(), b"3456");
        assert_eq!(read_all(&storage, "r.bin", 8, None).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn test_missing_is_not_error() {
        let (_dir, storage) = storage().await;
        assert_eq!(storage.stat("nope/x").await.unwrap(), None);
        assert!(read_all(&storage, "nope/x", 0, None).await.is_none());
        storage.delete("nope/x").await.unwrap();
    }

    #[tokio::test]
    async fn test_put_leaves_no_wip() {
        let (dir, storage) = storage().await;
        let mut body: &[u8] = b"data";
        storage.put("aa/bb/c.jpg", &mut body).await.unwrap();
        let leaf = dir.path().join("files/aa/bb");
        let names: Vec<String> = std::fs::read_dir(&leaf)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["c.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_short_body_leaves_nothing() {
        let (dir, storage) = storage().await;
        let body: &[u8] = b"abc";
        let mut reader = HashingReader::new(body).with_expected_len(Some(10));
        assert!(storage.put("aa/bb/c.jpg", &mut reader).await.is_err());
        assert_eq!(storage.stat("aa/bb/c.jpg").await.unwrap(), None);
        let leaf = dir.path().join("files/aa/bb");
        if leaf.exists() {
            assert_eq!(std::fs::read_dir(&leaf).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn test_put_replaces_existing() {
        let (_dir, storage) = storage().await;
        let mut first: &[u8] = b"first";
        storage.put("x.txt", &mut first).await.unwrap();
        let mut second: &[u8] = b"2nd";
        storage.put("x.txt", &mut second).await.unwrap();
        assert_eq!(read_all(&storage, "x.txt", 0, None).await.unwrap(), b"2nd");
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_parents() {
        let (dir, storage) = storage().await;
        let mut a: &[u8] = b"a";
        let mut b: &[u8] = b"b";
        storage.put("aa/bb/one", &mut a).await.unwrap();
        storage.put("aa/cc/two", &mut b).await.unwrap();

        storage.delete("aa/bb/one").await.unwrap();
        assert!(!dir.path().join("files/aa/bb").exists());
        assert!(dir.path().join("files/aa/cc/two").exists());

        storage.delete("aa/cc/two").await.unwrap();
        assert!(!dir.path().join("files/aa").exists());
        assert!(dir.path().join("files").exists());
    }

    #[tokio::test]
    async fn test_rename_moves_and_prunes() {
        let (dir, storage) = storage().await;
        let mut body: &[u8] = b"move me";
        storage.put("old/place/f", &mut body).await.unwrap();
        storage.rename("old/place/f", "new/spot/f").await.unwrap();
        assert_eq!(storage.stat("new/spot/f").await.unwrap(), Some(7));
        assert!(!dir.path().join("files/old").exists());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_dir, storage) = storage().await;
        let mut body: &[u8] = b"x";
        assert!(matches!(
            storage.put("../escape", &mut body).await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            storage.stat("/etc/passwd").await,
            Err(StorageError::InvalidPath(_))
        ));
    }
}
