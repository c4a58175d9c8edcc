//! Save-as targets for stripped images.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Where a finished download goes.
#[async_trait::async_trait]
pub trait DownloadSink: Send + Sync {
    /// Store `bytes` under `file_name` and return where they ended up.
    async fn save_as(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf>;
}

/// Writes downloads into a fixed directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait::async_trait]
impl DownloadSink for DirectorySink {
    async fn save_as(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = safe_file_name(file_name)
            .with_context(|| format!("Refusing to save under {file_name:?}"))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let target = self.dir.join(name);
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;

        log::info!("Saved {} ({} bytes)", target.display(), bytes.len());
        Ok(target)
    }
}

/// Last path component of `name`, so a remote or user-supplied name can't
/// escape the download directory.
fn safe_file_name(name: &str) -> Option<&str> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    match last {
        "" | "." | ".." => None,
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn safe_file_name_strips_directories() {
        assert_eq!(safe_file_name("cleaned_a.jpg"), Some("cleaned_a.jpg"));
        assert_eq!(safe_file_name("../../etc/passwd"), Some("passwd"));
        assert_eq!(safe_file_name("C:\\Users\\me\\pic.png"), Some("pic.png"));
        assert_eq!(safe_file_name("dir/"), None);
        assert_eq!(safe_file_name(".."), None);
    }

    #[tokio::test]
    async fn directory_sink_writes_file() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path().join("out"));

        let path = sink.save_as("cleaned_photo.jpg", b"jpegdata").await.unwrap();
        assert_eq!(path, dir.path().join("out").join("cleaned_photo.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpegdata");
    }

    #[tokio::test]
    async fn directory_sink_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());
        assert!(sink.save_as("", b"x").await.is_err());
    }
}
