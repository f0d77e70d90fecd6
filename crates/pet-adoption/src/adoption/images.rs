use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Largest accepted upload, matching the intake limit shelters were given.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// External image hosting: takes PNG bytes, returns a stable URL.
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn store(&self, bytes: Vec<u8>) -> Result<String, ImageHostError>;

    /// Removes an image this host returned from [`ImageHost::store`]. Unknown URLs are ignored.
    async fn discard(&self, url: &str) -> Result<(), ImageHostError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ImageHostError {
    #[error("only PNG images are accepted")]
    UnsupportedFormat,
    #[error("image exceeds the 10 MiB upload limit")]
    TooLarge,
    #[error("image storage failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejects anything that is not a PNG within the size limit.
pub fn validate_png(bytes: &[u8]) -> Result<(), ImageHostError> {
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ImageHostError::TooLarge);
    }
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return Err(ImageHostError::UnsupportedFormat);
    }
    Ok(())
}

/// Writes images to a local directory and serves them under a fixed URL prefix.
pub struct LocalImageHost {
    directory: PathBuf,
    public_base_url: String,
    sequence: AtomicU64,
}

impl LocalImageHost {
    pub fn new(directory: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn public_base_url(&self) -> &str {
        &self.public_base_url
    }

    /// Reads a stored image by file name. Names with path components or another extension
    /// resolve to `None`, as do files that do not exist.
    pub async fn read(&self, file_name: &str) -> Result<Option<Vec<u8>>, ImageHostError> {
        let Some(path) = self.path_for(file_name) else {
            return Ok(None);
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn path_for(&self, file_name: &str) -> Option<PathBuf> {
        let plain = !file_name.is_empty()
            && !file_name.starts_with('.')
            && !file_name.contains(['/', '\\'])
            && file_name.ends_with(".png");
        plain.then(|| self.directory.join(file_name))
    }
}

#[async_trait]
impl ImageHost for LocalImageHost {
    async fn store(&self, bytes: Vec<u8>) -> Result<String, ImageHostError> {
        validate_png(&bytes)?;
        tokio::fs::create_dir_all(&self.directory).await?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let file_name = format!("{}-{sequence}.png", Utc::now().timestamp_millis());
        tokio::fs::write(self.directory.join(&file_name), bytes).await?;

        Ok(format!("{}/{file_name}", self.public_base_url))
    }

    async fn discard(&self, url: &str) -> Result<(), ImageHostError> {
        let Some(path) = url
            .strip_prefix(self.public_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|file_name| self.path_for(file_name))
        else {
            return Ok(());
        };
        match tokio::fs::remove_file(path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
