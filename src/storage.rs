//! Attachment bytes on disk.

use crate::attachment::FileInfo;
use crate::error::Error;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Gives up looking for a free name after this many `_N` suffixes.
const MAX_COLLISIONS: u32 = 1000;

/// Filesystem store rooted at the configured upload directory.
///
/// Files land in `YYYY/MM/DD/<timestamp>_<hash8>_<name>`; the returned reference is
/// that path relative to the root, always with `/` separators.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn store(
        &self,
        data: &[u8],
        sender_hash: &str,
        info: &FileInfo,
    ) -> Result<String, Error> {
        self.store_at(Utc::now(), data, sender_hash, info).await
    }

    async fn store_at(
        &self,
        now: DateTime<Utc>,
        data: &[u8],
        sender_hash: &str,
        info: &FileInfo,
    ) -> Result<String, Error> {
        let day = now.format("%Y/%m/%d").to_string();
        let dir = self.root.join(&day);
        fs::create_dir_all(&dir).await?;

        let hash8 = sender_hash.get(..8).unwrap_or(sender_hash);
        let base = format!(
            "{}_{hash8}_{}",
            now.format("%Y%m%d_%H%M%S"),
            info.sanitized_filename
        );

        let (name, mut file) = create_exclusive(&dir, &base).await?;
        let path = dir.join(&name);

        let finished = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            let written = fs::metadata(&path).await?.len();
            if written != data.len() as u64 {
                return Err(Error::Store(format!(
                    "wrote {written} bytes of {} for {name}",
                    data.len()
                )));
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        drop(file);

        if let Err(e) = finished {
            discard(&path).await;
            return Err(e);
        }

        Ok(format!("{day}/{name}"))
    }

    /// Maps a stored reference back to its path, refusing anything that could
    /// escape the upload root.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(reference);
        if reference.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::Store(format!("invalid stored reference {reference}")));
        }
        Ok(self.root.join(relative))
    }

    /// Returns `false` when the file was already gone.
    pub async fn delete(&self, reference: &str) -> Result<bool, Error> {
        match fs::remove_file(self.resolve(reference)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Removes a file that did not make it into the store.
async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("Cannot remove partial file {}: {e}", path.display()),
    }
}

async fn create_exclusive(dir: &Path, base: &str) -> Result<(String, fs::File), Error> {
    let (stem, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => base.split_at(idx),
        _ => (base, ""),
    };

    for attempt in 0..=MAX_COLLISIONS {
        let name = if attempt == 0 {
            base.to_string()
        } else {
            format!("{stem}_{attempt}{ext}")
        };
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&name))
            .await
        {
            Ok(file) => return Ok((name, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Store(format!("no free name for {base}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentPolicy;
    use crate::attachment::Validation;
    use crate::utils::sender_hash;
    use chrono::TimeZone;
    use testresult::TestResult;

    fn info_for(filename: &str, data: &[u8]) -> FileInfo {
        let policy = AttachmentPolicy {
            max_file_size: 1 << 20,
            max_file_count: 5,
            allowed_extensions: vec![],
            blocked_extensions: vec![],
        };
        match policy.validate(filename, data) {
            Validation::Valid(info) => info,
            Validation::Invalid(reason) => panic!("fixture rejected: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_store_layout_and_length() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = AttachmentStore::new(dir.path());
        let data = vec![b'a'; 1024];
        let info = info_for("report.pdf", &data);
        let hash = sender_hash("user@allowed.com");
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).single().ok_or("bad date")?;

        let reference = store.store_at(now, &data, &hash, &info).await?;
        assert_eq!(
            reference,
            format!("2024/03/09/20240309_140507_{}_report.pdf", &hash[..8])
        );
        let stored = fs::read(store.resolve(&reference)?).await?;
        assert_eq!(stored.len(), info.size);
        assert_eq!(stored, data);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.resolve(&reference)?)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_collisions_get_suffix() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = AttachmentStore::new(dir.path());
        let info = info_for("notes.txt", b"one");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().ok_or("bad date")?;

        let first = store.store_at(now, b"one", "abcdef0123", &info).await?;
        let second = store.store_at(now, b"two", "abcdef0123", &info).await?;
        let third = store.store_at(now, b"three", "abcdef0123", &info).await?;
        assert_eq!(first, "2024/01/02/20240102_030405_abcdef01_notes.txt");
        assert_eq!(second, "2024/01/02/20240102_030405_abcdef01_notes_1.txt");
        assert_eq!(third, "2024/01/02/20240102_030405_abcdef01_notes_2.txt");
        assert_eq!(fs::read(store.resolve(&first)?).await?, b"one");
        assert_eq!(fs::read(store.resolve(&third)?).await?, b"three");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = AttachmentStore::new(dir.path());
        let info = info_for("notes.txt", b"data");
        let reference = store.store(b"data", "00000000", &info).await?;
        assert!(store.delete(&reference).await?);
        assert!(!store.delete(&reference).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_unwritable_root_fails() -> TestResult {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("uploads");
        std::fs::write(&root, b"not a directory")?;
        let store = AttachmentStore::new(&root);
        let info = info_for("notes.txt", b"data");
        assert!(store.store(b"data", "00000000", &info).await.is_err());
        assert_eq!(std::fs::read(&root)?, b"not a directory");
        Ok(())
    }

    #[tokio::test]
    async fn test_discard_removes_partial_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partial.txt");
        std::fs::write(&path, b"half")?;
        discard(&path).await;
        assert!(!path.exists());
        // Already gone is fine.
        discard(&path).await;
        Ok(())
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = AttachmentStore::new("/srv/uploads");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
        assert!(store.resolve("2024/01/02/file.txt").is_ok());
    }
}
