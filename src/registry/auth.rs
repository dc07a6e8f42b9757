//! Registry credentials taken from a namespace's default service account.

use anyhow::{Context, Result};
use base64::prelude::*;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Api, Client};
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

const DOCKER_HUB: &str = "docker.io";

/// `.dockerconfigjson` payload
#[derive(Debug, Deserialize)]
struct DockerConfig {
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Resolves pull credentials per `(namespace, registry)` and caches hits
pub struct AuthManager {
    client: Client,
    cache: Mutex<HashMap<(String, String), Credentials>>,
}

impl AuthManager {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Credentials for `image`, falling back to anonymous access.
    pub async fn get_auth_for_image(&self, image: &str, namespace: &str) -> RegistryAuth {
        let registry = registry_for_image(image);
        let key = (namespace.to_string(), registry.clone());

        if let Some(creds) = self.cached(&key) {
            debug!("Using cached credentials for {} in {}", registry, namespace);
            return RegistryAuth::Basic(creds.username, creds.password);
        }

        match self.lookup(&registry, namespace).await {
            Ok(Some(creds)) => {
                debug!("Found pull secret for {} in {}", registry, namespace);
                let auth = RegistryAuth::Basic(creds.username.clone(), creds.password.clone());
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(key, creds);
                }
                auth
            },
            Ok(None) => {
                debug!("No credentials for {}, using anonymous access", registry);
                RegistryAuth::Anonymous
            },
            Err(e) => {
                warn!("Error fetching credentials for {}: {}", registry, e);
                RegistryAuth::Anonymous
            },
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<Credentials> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    async fn lookup(&self, registry: &str, namespace: &str) -> Result<Option<Credentials>> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = match accounts.get("default").await {
            Ok(account) => account,
            Err(e) => {
                debug!("Failed to get default service account in {}: {}", namespace, e);
                return Ok(None);
            },
        };

        let Some(pull_secrets) = account.image_pull_secrets else {
            return Ok(None);
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        for secret_ref in pull_secrets {
            match secrets.get(&secret_ref.name).await {
                Ok(secret) => {
                    if let Some(creds) = credentials_from_secret(&secret, registry)? {
                        return Ok(Some(creds));
                    }
                },
                Err(e) => warn!("Failed to get secret {}: {}", secret_ref.name, e),
            }
        }

        Ok(None)
    }
}

/// Read credentials for `registry` from a docker config secret, new or legacy format.
fn credentials_from_secret(secret: &Secret, registry: &str) -> Result<Option<Credentials>> {
    let Some(data) = &secret.data else {
        return Ok(None);
    };

    let auths = if let Some(raw) = data.get(".dockerconfigjson") {
        serde_json::from_slice::<DockerConfig>(&raw.0)
            .context("Failed to parse .dockerconfigjson")?
            .auths
    } else if let Some(raw) = data.get(".dockercfg") {
        serde_json::from_slice::<HashMap<String, DockerAuthEntry>>(&raw.0)
            .context("Failed to parse .dockercfg")?
    } else {
        return Ok(None);
    };

    auths
        .iter()
        .find(|(key, _)| registry_matches(key, registry))
        .map(|(_, entry)| decode_entry(entry))
        .transpose()
        .map(Option::flatten)
}

fn decode_entry(entry: &DockerAuthEntry) -> Result<Option<Credentials>> {
    if !entry.username.is_empty() && !entry.password.is_empty() {
        return Ok(Some(Credentials {
            username: entry.username.clone(),
            password: entry.password.clone(),
        }));
    }

    if entry.auth.is_empty() {
        return Ok(None);
    }

    let decoded = BASE64_STANDARD
        .decode(entry.auth.as_bytes())
        .context("Failed to decode auth token")?;
    let decoded = String::from_utf8(decoded).context("Auth token is not valid UTF-8")?;

    Ok(decoded.split_once(':').map(|(username, password)| Credentials {
        username: username.to_string(),
        password: password.to_string(),
    }))
}

/// Registry host of an image reference; Docker Hub when none is named.
pub fn registry_for_image(image: &str) -> String {
    match image.split_once('/') {
        Some((host, _)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            host.to_string()
        },
        _ => DOCKER_HUB.to_string(),
    }
}

fn registry_matches(key: &str, registry: &str) -> bool {
    let key = key
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let key = key.strip_suffix("/v1").unwrap_or(key);

    key == registry
        || (registry == DOCKER_HUB && matches!(key, "index.docker.io" | "registry-1.docker.io"))
}
