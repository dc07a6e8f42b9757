use thiserror::Error;

pub mod auth;
mod oci;

pub use oci::OciRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference {image}: {reason}")]
    InvalidReference { image: String, reason: String },
    #[error("failed to fetch digest for {image}: {reason}")]
    Lookup { image: String, reason: String },
}

/// Source of truth for the newest published digest of an image.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Latest digest published for `image` (name and tag, no digest).
    /// `namespace` is where pull credentials for the image live, if any.
    async fn latest_digest(&self, image: &str, namespace: Option<&str>) -> Result<String, RegistryError>;
}
