use super::workload::{ImageReference, Workload};

/// Result of processing one workload in one cycle. Never persisted.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub workload: Workload,
    pub previous_image: ImageReference,
    pub new_image: ImageReference,
    pub changed: bool,
}

impl UpdateOutcome {
    pub fn unchanged(workload: Workload) -> Self {
        let image = workload.image.clone();
        Self {
            workload,
            previous_image: image.clone(),
            new_image: image,
            changed: false,
        }
    }

    pub fn updated(workload: Workload, previous_image: ImageReference, new_image: ImageReference) -> Self {
        Self {
            workload,
            previous_image,
            new_image,
            changed: true,
        }
    }
}
