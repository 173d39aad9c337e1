use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProviderError, ProviderErrorKind};
use crate::models::Provider;

/// Writes generated images under `<root>/generated_images/`.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("generated_images")
    }

    /// Decode a base64 image payload and write it with a random name.
    pub async fn save_base64(&self, provider: Provider, encoded: &str, format: &str) -> Result<PathBuf, ProviderError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProviderError::malformed(provider, format!("image payload is not base64: {e}")))?;
        if bytes.is_empty() {
            return Err(ProviderError::malformed(provider, "image payload is empty"));
        }
        self.save(provider, &bytes, format).await
    }

    pub async fn save(&self, provider: Provider, bytes: &[u8], format: &str) -> Result<PathBuf, ProviderError> {
        let dir = self.images_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::new(provider, ProviderErrorKind::Io, format!("creating {}: {e}", dir.display())))?;

        let path = dir.join(format!("{}.{}", Uuid::new_v4().simple(), format));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ProviderError::new(provider, ProviderErrorKind::Io, format!("writing {}: {e}", path.display())))?;

        debug!(path = %path.display(), bytes = bytes.len(), "saved generated image");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_with_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());
        let encoded = STANDARD.encode(b"\x89PNG fake");

        let a = store.save_base64(Provider::OpenAi, &encoded, "png").await.unwrap();
        let b = store.save_base64(Provider::OpenAi, &encoded, "png").await.unwrap();

        assert_ne!(a, b);
        assert_eq!(a.parent().unwrap(), store.images_dir());
        assert_eq!(a.extension().unwrap(), "png");
        assert_eq!(std::fs::read(&a).unwrap(), b"\x89PNG fake");
    }

    #[tokio::test]
    async fn rejects_bad_base64() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());
        let err = store.save_base64(Provider::Gemini, "!!not base64!!", "png").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::MalformedResponse);
    }
}
