use crate::models::{ImageReference, Workload};
use thiserror::Error;

mod kubernetes;

pub use kubernetes::KubeOrchestrator;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The workload no longer exists
    #[error("workload {0} not found")]
    NotFound(String),
    #[error("orchestrator request failed: {0}")]
    Api(String),
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// The system that owns and runs workloads.
#[async_trait::async_trait]
pub trait Orchestrator: Send + Sync {
    /// List workloads, optionally restricted by a `key=value` label selector.
    async fn list_workloads(&self, selector: Option<&str>) -> Result<Vec<Workload>, OrchestratorError>;

    /// Fresh view of one workload, including its update state.
    async fn get_workload(&self, workload: &Workload) -> Result<Workload, OrchestratorError>;

    /// Point the workload at `image`. With `force` set, a redeploy happens even if
    /// the reference is unchanged.
    async fn update_image(
        &self,
        workload: &Workload,
        image: &ImageReference,
        force: bool,
    ) -> Result<(), OrchestratorError>;
}
