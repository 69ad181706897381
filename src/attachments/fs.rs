//! Filesystem attachment storage

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{AttachmentError, AttachmentReader, AttachmentResult, AttachmentStore, SavedFile};
use crate::policy::sri_sha256;
use crate::utils::generate_id;

const CHUNK_SIZE: usize = 64 * 1024;
const PARTIAL_SUFFIX: &str = ".part";

/// Attachment storage rooted at a directory
#[derive(Debug, Clone)]
pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user_id: &str) -> AttachmentResult<PathBuf> {
        Ok(self.root.join(checked(user_id)?))
    }

    fn event_dir(&self, user_id: &str, event_id: &str) -> AttachmentResult<PathBuf> {
        Ok(self.user_dir(user_id)?.join(checked(event_id)?))
    }

    fn file_path(&self, user_id: &str, event_id: &str, file_id: &str) -> AttachmentResult<PathBuf> {
        Ok(self.event_dir(user_id, event_id)?.join(checked(file_id)?))
    }
}

/// Reject names that are not a single plain path component
fn checked(name: &str) -> AttachmentResult<&str> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.ends_with(PARTIAL_SUFFIX);
    if valid {
        Ok(name)
    } else {
        Err(AttachmentError::InvalidName(name.to_string()))
    }
}

async fn remove_dir_if_exists(dir: &Path) -> AttachmentResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn dir_size(dir: PathBuf) -> AttachmentResult<u64> {
    let mut total = 0;
    let mut pending = vec![dir];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn save(
        &self,
        user_id: &str,
        event_id: &str,
        payload: &mut (dyn AsyncRead + Send + Unpin),
    ) -> AttachmentResult<SavedFile> {
        let dir = self.event_dir(user_id, event_id)?;
        fs::create_dir_all(&dir).await?;

        let file_id = generate_id();
        let final_path = dir.join(&file_id);
        let partial_path = dir.join(format!("{}{}", file_id, PARTIAL_SUFFIX));

        let mut file = fs::File::create(&partial_path).await?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];

        let copied: std::io::Result<()> = async {
            loop {
                let n = payload.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                size += n as u64;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = copied {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&partial_path).await {
                warn!(path = %partial_path.display(), error = %cleanup, "failed to remove partial attachment");
            }
            return Err(e.into());
        }
        drop(file);
        fs::rename(&partial_path, &final_path).await?;

        debug!(user_id, event_id, file_id = %file_id, size, "saved attachment");
        Ok(SavedFile {
            id: file_id,
            size,
            integrity: sri_sha256(&hasher.finalize()),
        })
    }

    async fn read(&self, user_id: &str, event_id: &str, file_id: &str) -> AttachmentResult<AttachmentReader> {
        let path = self.file_path(user_id, event_id, file_id)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AttachmentError::NotFound {
                event_id: event_id.to_string(),
                file_id: file_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, user_id: &str, event_id: &str, file_id: &str) -> AttachmentResult<()> {
        let path = self.file_path(user_id, event_id, file_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AttachmentError::NotFound {
                event_id: event_id.to_string(),
                file_id: file_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all_for_event(&self, user_id: &str, event_id: &str) -> AttachmentResult<()> {
        remove_dir_if_exists(&self.event_dir(user_id, event_id)?).await
    }

    async fn delete_all_for_user(&self, user_id: &str) -> AttachmentResult<()> {
        remove_dir_if_exists(&self.user_dir(user_id)?).await
    }

    async fn list_file_ids(&self, user_id: &str, event_id: &str) -> AttachmentResult<Vec<String>> {
        let dir = self.event_dir(user_id, event_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(PARTIAL_SUFFIX) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn usage_bytes(&self, user_id: &str) -> AttachmentResult<u64> {
        dir_size(self.user_dir(user_id)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_read_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsAttachmentStore::new(temp_dir.path());

        let mut payload: &[u8] = b"hello attachment";
        let saved = store.save("u1", "e1", &mut payload).await.unwrap();
        assert_eq!(saved.size, 16);
        assert!(saved.integrity.starts_with("sha256-"));
        assert_eq!(store.list_file_ids("u1", "e1").await.unwrap(), vec![saved.id.clone()]);

        let mut reader = store.read("u1", "e1", &saved.id).await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "hello attachment");

        store.delete("u1", "e1", &saved.id).await.unwrap();
        assert!(store.list_file_ids("u1", "e1").await.unwrap().is_empty());
        assert!(matches!(
            store.delete("u1", "e1", &saved.id).await,
            Err(AttachmentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_all_scopes() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsAttachmentStore::new(temp_dir.path());
        let mut a: &[u8] = b"aaaa";
        let mut b: &[u8] = b"bb";
        store.save("u1", "e1", &mut a).await.unwrap();
        store.save("u1", "e2", &mut b).await.unwrap();
        assert_eq!(store.usage_bytes("u1").await.unwrap(), 6);

        store.delete_all_for_event("u1", "e1").await.unwrap();
        assert!(store.list_file_ids("u1", "e1").await.unwrap().is_empty());
        assert_eq!(store.usage_bytes("u1").await.unwrap(), 2);

        store.delete_all_for_user("u1").await.unwrap();
        assert_eq!(store.usage_bytes("u1").await.unwrap(), 0);
        // Deleting again is a no-op
        store.delete_all_for_user("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsAttachmentStore::new(temp_dir.path());
        assert!(matches!(
            store.read("..", "e1", "f").await,
            Err(AttachmentError::InvalidName(_))
        ));
        assert!(matches!(
            store.delete("u1", "a/b", "f").await,
            Err(AttachmentError::InvalidName(_))
        ));
    }
}
