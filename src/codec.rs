//! Conversion between in-memory files and their storable form.
//!
//! A [`SerializedFile`] embeds the bytes in a data URL
//! (`data:<mime>;base64,<payload>`) so a stored record is self-contained.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// MIME type used when a file declares none.
const FALLBACK_MIME: &str = "application/octet-stream";

/// A file held in memory: what a picker produces and what the remote
/// service receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Original file name, without any directory part.
    pub name: String,
    /// Declared MIME type. Not sniffed from the content.
    pub mime_type: String,
    pub bytes: Vec<u8>,
    /// Last modification time in milliseconds since the Unix epoch.
    pub last_modified: i64,
}

impl FileHandle {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
        last_modified: i64,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
            last_modified,
        }
    }

    /// Byte length.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Storable projection of a [`FileHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedFile {
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub size: u64,
    pub data_url: String,
    pub last_modified: i64,
}

/// Encode a file into its storable form.
pub fn encode(file: &FileHandle) -> SerializedFile {
    let mime = if file.mime_type.is_empty() {
        FALLBACK_MIME
    } else {
        file.mime_type.as_str()
    };
    let payload = STANDARD.encode(&file.bytes);

    SerializedFile {
        name: file.name.clone(),
        file_type: file.mime_type.clone(),
        size: file.size(),
        data_url: format!("data:{mime};base64,{payload}"),
        last_modified: file.last_modified,
    }
}

/// Read a file from disk and encode it. The whole file is read before the
/// record is built.
pub async fn encode_path(path: &Path) -> Result<SerializedFile> {
    let file = read_file(path).await?;
    Ok(encode(&file))
}

/// Rebuild a file from its storable form.
///
/// Returns `None` when the data URL has no `,` separator, no MIME type in
/// its header, an undecodable payload, or a payload whose length disagrees
/// with the recorded size. Stored data is untrusted; a bad record means
/// "no usable saved file", never a panic.
pub fn decode(serialized: &SerializedFile) -> Option<FileHandle> {
    let Some((header, payload)) = serialized.data_url.split_once(',') else {
        log::error!("Invalid data URL in stored file {}", serialized.name);
        return None;
    };

    if header_mime(header).is_none() {
        log::error!("Unable to extract MIME type from stored file {}", serialized.name);
        return None;
    }

    let bytes = match STANDARD.decode(payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Stored file {} has a corrupt payload: {e}", serialized.name);
            return None;
        }
    };

    if bytes.len() as u64 != serialized.size {
        log::error!(
            "Stored file {} is {} bytes, record says {}",
            serialized.name,
            bytes.len(),
            serialized.size
        );
        return None;
    }

    Some(FileHandle {
        name: serialized.name.clone(),
        mime_type: serialized.file_type.clone(),
        bytes,
        last_modified: serialized.last_modified,
    })
}

/// The MIME type between `:` and the first `;` of a data URL header.
fn header_mime(header: &str) -> Option<&str> {
    let (_, rest) = header.split_once(':')?;
    let (mime, _) = rest.split_once(';')?;
    if mime.is_empty() { None } else { Some(mime) }
}

/// Read a file from disk into a [`FileHandle`], declaring its MIME type
/// from the extension.
pub async fn read_file(path: &Path) -> Result<FileHandle> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let last_modified = tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Path has no file name")?;

    Ok(FileHandle {
        name,
        mime_type: mime_type_for_path(path).to_string(),
        bytes,
        last_modified,
    })
}

/// Declared MIME type for a file name, by extension.
pub fn mime_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        _ => FALLBACK_MIME,
    }
}
