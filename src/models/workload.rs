use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A container image reference split into its name and optional content digest.
///
/// `nginx:1.25@sha256:abc` has name `nginx:1.25` and digest `sha256:abc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub name: String,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn new(name: impl Into<String>, digest: Option<String>) -> Self {
        Self {
            name: name.into(),
            digest,
        }
    }

    /// Split a reference on the first `@`. Anything after it is the digest.
    pub fn parse(reference: &str) -> Self {
        match reference.split_once('@') {
            Some((name, digest)) if !digest.is_empty() => Self {
                name: name.to_string(),
                digest: Some(digest.to_string()),
            },
            Some((name, _)) => Self {
                name: name.to_string(),
                digest: None,
            },
            None => Self {
                name: reference.to_string(),
                digest: None,
            },
        }
    }

    /// The same image name pinned to `digest`.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            name: self.name.clone(),
            digest: Some(digest.into()),
        }
    }

    /// Whether `digest` is what this reference is already pinned to.
    /// An unknown current digest never matches.
    pub fn is_pinned_to(&self, digest: &str) -> bool {
        self.digest.as_deref() == Some(digest)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.name, digest),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    #[default]
    Idle,
    Updating,
}

/// Transient, per-cycle view of a workload owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub id: String,
    pub name: String,
    pub short_id: String,
    /// Namespace the workload lives in, if the orchestrator has namespaces
    pub namespace: Option<String>,
    pub image: ImageReference,
    pub update_state: UpdateState,
    pub labels: BTreeMap<String, String>,
}

impl Workload {
    pub fn is_updating(&self) -> bool {
        self.update_state == UpdateState::Updating
    }

    /// `namespace/name` when namespaced, otherwise just the name.
    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// Derive a short identifier the same length as Docker's short ids.
pub fn short_id(id: &str) -> String {
    id.chars().filter(|c| *c != '-').take(12).collect()
}
