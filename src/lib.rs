// Library exports for integration testing
//
// This file exposes internal modules for integration tests while keeping
// the binary entrypoint in main.rs

pub mod config;
pub mod labels;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod webhook;

// Re-export commonly used types for testing
pub use config::{Config, ConfigError, ReconcilerConfig};
pub use labels::WebhookConfig;
pub use models::{ImageReference, UpdateOutcome, UpdateState, Workload};
pub use notifications::{NotificationManager, NotificationPayload, Notifier};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use reconciler::Reconciler;
pub use registry::{Registry, RegistryError};
pub use scheduler::Schedule;
pub use webhook::{WebhookDispatcher, WebhookStatus};
