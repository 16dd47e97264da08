use crate::error::{CatalogError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

/// ImageStore keeps uploaded images in one flat directory.
/// Files are named `{sha256 hex}{.ext}`, so identical uploads share a file.
pub struct ImageStore {
    base_path: PathBuf,
    default_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreImageResult {
    pub file_name: String,
    pub reused: bool,
}

impl ImageStore {
    pub fn new(base_path: PathBuf, default_image: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(&base_path).map_err(|error| {
            CatalogError::Write(format!(
                "failed to create image directory {:?}: {}",
                base_path, error
            ))
        })?;
        Ok(Self {
            base_path,
            default_image: default_image.into(),
        })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    pub fn default_image_name(&self) -> &str {
        &self.default_image
    }

    pub fn default_image_path(&self) -> PathBuf {
        self.base_path.join(&self.default_image)
    }

    pub fn default_image_exists(&self) -> bool {
        self.default_image_path().is_file()
    }

    /// Stream an upload into the store and return its content-addressed name.
    ///
    /// Bytes go to a uniquely named temporary file while the digest is
    /// computed. The temporary file becomes `{digest}{ext}` only when no file
    /// with that name exists yet; otherwise it is discarded.
    pub async fn store<S, E>(&self, stream: S, original_name: &str) -> Result<StoreImageResult>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let extension = file_extension(original_name);
        let temp = TempUpload::new(self.base_path.join(format!(".upload-{}.tmp", Ulid::new())));

        let digest = write_and_hash(stream, temp.path()).await?;

        let file_name = format!("{}{}", digest, extension);
        let image_path = self.base_path.join(&file_name);

        if image_path.exists() {
            tracing::debug!("Image {} already stored, skipping write", file_name);
            return Ok(StoreImageResult {
                file_name,
                reused: true,
            });
        }

        fs::rename(temp.path(), &image_path).await.map_err(|error| {
            CatalogError::Write(format!(
                "failed to move upload into {:?}: {}",
                image_path, error
            ))
        })?;
        temp.keep();

        tracing::debug!("Stored image {} (from {})", file_name, original_name);
        Ok(StoreImageResult {
            file_name,
            reused: false,
        })
    }

    /// Path for a stored file name, or `None` when the name could escape the
    /// image directory.
    pub fn image_path(&self, file_name: &str) -> Option<PathBuf> {
        is_safe_file_name(file_name).then(|| self.base_path.join(file_name))
    }

    /// Resolve a stored file name to a servable path, falling back to the
    /// sentinel image when the name is absent, unsafe or missing on disk.
    pub fn resolve_or_default(&self, file_name: Option<&str>) -> PathBuf {
        let Some(file_name) = file_name else {
            return self.default_image_path();
        };

        match self.image_path(file_name) {
            Some(path) if path.is_file() => path,
            Some(path) => {
                tracing::warn!("Image not found: {:?}, serving default", path);
                self.default_image_path()
            }
            None => {
                tracing::warn!("Rejected image name {:?}, serving default", file_name);
                self.default_image_path()
            }
        }
    }
}

/// Temporary upload file, removed on drop unless kept.
///
/// Dropping covers every early exit, including the store future itself being
/// dropped by a timeout halfway through an upload.
struct TempUpload {
    path: PathBuf,
    armed: bool,
}

impl TempUpload {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// The file was moved into place; leave it alone.
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!("Failed to remove temporary upload {:?}: {}", self.path, error)
            }
        }
    }
}

async fn write_and_hash<S, E>(stream: S, temp_path: &Path) -> Result<String>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Display,
{
    let write_error =
        |error: std::io::Error| CatalogError::Write(format!("{:?}: {}", temp_path, error));

    let mut file = fs::File::create(temp_path).await.map_err(write_error)?;
    let mut hasher = Sha256::new();
    let mut stream = std::pin::pin!(stream);

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|error| CatalogError::Read(format!("image upload stream: {}", error)))?;
        hasher.update(&chunk);
        file.write_all(&chunk).await.map_err(write_error)?;
    }

    file.sync_all().await.map_err(write_error)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Extension of `original_name` including the dot, or an empty string.
/// Extensions with anything but ASCII alphanumerics are dropped.
pub fn file_extension(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}
