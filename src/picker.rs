//! File pickers: anything that can hand the orchestrator a file.
//!
//! Each provider only has to produce a [`FileHandle`]. Once it has, every
//! provider is treated identically. Provider sign-in is not handled here;
//! the cloud pickers take ready-made links or tokens.

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::PathBuf;

use crate::codec::{self, FileHandle};

/// Something that can produce a file for intake.
#[async_trait::async_trait]
pub trait FilePicker: Send + Sync {
    /// The display name of this provider (e.g., "Google Drive").
    fn name(&self) -> &str;
    /// Produce the chosen file, or `None` if the user backed out.
    async fn pick(&self) -> Result<Option<FileHandle>>;
}

/// A file on the local disk.
pub struct LocalFilePicker {
    path: PathBuf,
}

impl LocalFilePicker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl FilePicker for LocalFilePicker {
    fn name(&self) -> &str {
        "Local"
    }

    async fn pick(&self) -> Result<Option<FileHandle>> {
        codec::read_file(&self.path).await.map(Some)
    }
}

/// A Google Drive file, fetched with an OAuth access token.
pub struct GoogleDrivePicker {
    file_id: String,
    file_name: String,
    mime_type: Option<String>,
    access_token: String,
    client: Client,
    api_base: String,
}

impl GoogleDrivePicker {
    pub fn new(
        file_id: String,
        file_name: String,
        mime_type: Option<String>,
        access_token: String,
    ) -> Self {
        Self {
            file_id,
            file_name,
            mime_type,
            access_token,
            client: Client::new(),
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
        }
    }

    fn download_url(&self) -> String {
        format!("{}/files/{}?alt=media", self.api_base, self.file_id)
    }
}

#[async_trait::async_trait]
impl FilePicker for GoogleDrivePicker {
    fn name(&self) -> &str {
        "Google Drive"
    }

    async fn pick(&self) -> Result<Option<FileHandle>> {
        if self.access_token.is_empty() {
            anyhow::bail!("Google Drive download failed: no access token configured");
        }

        let resp = self
            .client
            .get(self.download_url())
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Google Drive download failed")?;

        if !resp.status().is_success() {
            anyhow::bail!(
                "Google Drive download failed: Failed to download file from Google Drive ({})",
                resp.status()
            );
        }

        let header_mime = content_type(&resp);
        let bytes = resp
            .bytes()
            .await
            .context("Google Drive download failed")?;

        let mime_type = self
            .mime_type
            .clone()
            .filter(|m| !m.is_empty())
            .or(header_mime)
            .unwrap_or_default();

        Ok(Some(FileHandle::new(
            self.file_name.clone(),
            mime_type,
            bytes.to_vec(),
            now_millis(),
        )))
    }
}

/// A Dropbox file behind a direct link from the Chooser.
pub struct DropboxPicker {
    link: String,
    file_name: String,
    client: Client,
}

impl DropboxPicker {
    pub fn new(link: String, file_name: String) -> Self {
        Self {
            link,
            file_name,
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl FilePicker for DropboxPicker {
    fn name(&self) -> &str {
        "Dropbox"
    }

    async fn pick(&self) -> Result<Option<FileHandle>> {
        let resp = self
            .client
            .get(&self.link)
            .send()
            .await
            .context("Dropbox download failed")?;

        if !resp.status().is_success() {
            anyhow::bail!(
                "Dropbox download failed: Failed to download file from Dropbox ({})",
                resp.status()
            );
        }

        let mime_type = content_type(&resp).unwrap_or_default();
        let bytes = resp.bytes().await.context("Dropbox download failed")?;

        Ok(Some(FileHandle::new(
            self.file_name.clone(),
            mime_type,
            bytes.to_vec(),
            now_millis(),
        )))
    }
}

/// The media type of a response, without parameters.
fn content_type(resp: &reqwest::Response) -> Option<String> {
    let raw = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)?
        .to_str()
        .ok()?;
    media_type(raw)
}

fn media_type(raw: &str) -> Option<String> {
    let essence = raw.split(';').next()?.trim().to_lowercase();
    if essence.is_empty() { None } else { Some(essence) }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_picker_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cat.gif");
        std::fs::write(&path, b"GIF89a").unwrap();

        let picker = LocalFilePicker::new(&path);
        let file = picker.pick().await.unwrap().unwrap();
        assert_eq!(file.name, "cat.gif");
        assert_eq!(file.mime_type, "image/gif");
        assert_eq!(file.bytes, b"GIF89a");
    }

    #[tokio::test]
    async fn local_picker_missing_file_fails() {
        let picker = LocalFilePicker::new("/nonexistent/cat.gif");
        assert!(picker.pick().await.is_err());
    }

    #[tokio::test]
    async fn drive_picker_requires_token() {
        let picker = GoogleDrivePicker::new("abc".into(), "a.jpg".into(), None, String::new());
        let err = picker.pick().await.unwrap_err();
        assert!(err.to_string().contains("no access token"));
    }

    #[test]
    fn drive_download_url() {
        let picker =
            GoogleDrivePicker::new("1AbC".into(), "a.jpg".into(), Some("image/jpeg".into()), "t".into());
        assert_eq!(
            picker.download_url(),
            "https://www.googleapis.com/drive/v3/files/1AbC?alt=media"
        );
    }

    #[test]
    fn media_type_drops_parameters() {
        assert_eq!(media_type("image/JPEG; charset=binary").as_deref(), Some("image/jpeg"));
        assert_eq!(media_type("image/png").as_deref(), Some("image/png"));
        assert_eq!(media_type(" ; x=y"), None);
    }

    #[test]
    fn pickers_are_interchangeable() {
        let pickers: Vec<Box<dyn FilePicker>> = vec![
            Box::new(LocalFilePicker::new("a.jpg")),
            Box::new(GoogleDrivePicker::new("id".into(), "a.jpg".into(), None, "t".into())),
            Box::new(DropboxPicker::new("https://dl.dropbox.com/x".into(), "a.jpg".into())),
        ];
        let names: Vec<&str> = pickers.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["Local", "Google Drive", "Dropbox"]);
    }
}
