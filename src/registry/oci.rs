use super::auth::AuthManager;
use super::{Registry, RegistryError};
use oci_distribution::{Client as OciClient, Reference, secrets::RegistryAuth};
use tracing::debug;

/// Registry client speaking the OCI distribution protocol
pub struct OciRegistry {
    client: OciClient,
    auth: Option<AuthManager>,
}

impl OciRegistry {
    /// Anonymous access only
    pub fn new() -> Self {
        Self {
            client: OciClient::new(Default::default()),
            auth: None,
        }
    }

    /// Authenticate with pull secrets found through `auth`
    pub fn with_auth(auth: AuthManager) -> Self {
        Self {
            client: OciClient::new(Default::default()),
            auth: Some(auth),
        }
    }

    async fn auth_for(&self, image: &str, namespace: Option<&str>) -> RegistryAuth {
        match (&self.auth, namespace) {
            (Some(auth), Some(namespace)) => auth.get_auth_for_image(image, namespace).await,
            _ => RegistryAuth::Anonymous,
        }
    }
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Registry for OciRegistry {
    async fn latest_digest(&self, image: &str, namespace: Option<&str>) -> Result<String, RegistryError> {
        let reference = Reference::try_from(image).map_err(|e| RegistryError::InvalidReference {
            image: image.to_string(),
            reason: e.to_string(),
        })?;

        let auth = self.auth_for(image, namespace).await;

        let digest = self
            .client
            .fetch_manifest_digest(&reference, &auth)
            .await
            .map_err(|e| RegistryError::Lookup {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        debug!("Latest digest for {} is {}", image, digest);
        Ok(digest)
    }
}
