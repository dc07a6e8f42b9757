//! One reconciliation cycle: discover workloads, compare digests, update,
//! wait for the rollout, then report.

use crate::config::ReconcilerConfig;
use crate::metrics::{self, REGISTRY_ERRORS_TOTAL, ServiceLabels, UPDATES_FAILED_TOTAL};
use crate::models::{UpdateOutcome, Workload};
use crate::notifications::{DEFAULT_TITLE, NotificationManager, NotificationPayload};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::registry::Registry;
use crate::webhook::WebhookDispatcher;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Reconciler {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<dyn Registry>,
    notifications: NotificationManager,
    webhooks: WebhookDispatcher,
    config: ReconcilerConfig,
    poll_interval: Duration,
}

impl Reconciler {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<dyn Registry>,
        notifications: NotificationManager,
        webhooks: WebhookDispatcher,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            notifications,
            webhooks,
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often convergence is checked after an update request
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    /// Run one full cycle and return an outcome per workload that reached a decision.
    ///
    /// Workloads are handled one at a time. If a workload disappears mid-way the
    /// list is fetched again and only workloads not yet seen this cycle are handled.
    pub async fn run_cycle(&self) -> Vec<UpdateOutcome> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut outcomes = Vec::new();

        'refresh: loop {
            let workloads = match self.retained_workloads().await {
                Ok(workloads) => workloads,
                Err(e) => {
                    error!("Failed to list workloads: {}", e);
                    break;
                },
            };

            for workload in &workloads {
                metrics::register_service(&service_labels(workload));
            }

            for workload in workloads {
                if !seen.insert(workload.id.clone()) {
                    continue;
                }

                let name = workload.display_name();
                match self.process(workload).await {
                    Ok(Some(outcome)) => outcomes.push(outcome),
                    Ok(None) => {},
                    Err(e) => {
                        warn!("{}: {}. Refreshing the workload list.", name, e);
                        continue 'refresh;
                    },
                }
            }

            break;
        }

        for outcome in outcomes.iter().filter(|o| o.changed) {
            self.webhooks.trigger(outcome).await;
            self.notifications.notify(self.payload_for(outcome)).await;
        }

        outcomes
    }

    async fn retained_workloads(&self) -> Result<Vec<Workload>, OrchestratorError> {
        let workloads = self
            .orchestrator
            .list_workloads(self.config.filter.as_deref())
            .await?;

        Ok(workloads
            .into_iter()
            .filter(|w| {
                let excluded = self.config.blacklist.iter().any(|b| b == &w.name);
                if excluded {
                    info!("{}: Blacklisted, skipping", w.name);
                }
                !excluded
            })
            .collect())
    }

    /// Decide and apply the update for one workload.
    ///
    /// `Ok(None)` means the workload was skipped this cycle. An error is only
    /// returned when the workload no longer exists.
    async fn process(&self, workload: Workload) -> Result<Option<UpdateOutcome>, OrchestratorError> {
        let name = workload.display_name();
        let current = workload.image.clone();

        let latest = match self
            .registry
            .latest_digest(&current.name, workload.namespace.as_deref())
            .await
        {
            Ok(digest) => digest,
            Err(e) => {
                error!("{}: {}", name, e);
                REGISTRY_ERRORS_TOTAL.inc();
                return Ok(None);
            },
        };

        if current.is_pinned_to(&latest) {
            debug!("{}: Image {} is up to date", name, current);
            return Ok(Some(UpdateOutcome::unchanged(workload)));
        }

        let target = current.with_digest(latest);
        info!("{}: Updating image {} to {}", name, current, target);

        match self.orchestrator.update_image(&workload, &target, true).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => {
                error!("{}: Update request failed: {}", name, e);
                UPDATES_FAILED_TOTAL.inc();
                return Ok(Some(UpdateOutcome::unchanged(workload)));
            },
        }

        if !self.wait_for_convergence(&workload).await? {
            return Ok(Some(UpdateOutcome::unchanged(workload)));
        }

        info!("{}: Updated to {}", name, target);
        metrics::record_service_update(&service_labels(&workload));
        Ok(Some(UpdateOutcome::updated(workload, current, target)))
    }

    /// Poll until the workload stops updating. `Ok(false)` when the optional
    /// timeout runs out first or the status can no longer be read.
    async fn wait_for_convergence(&self, workload: &Workload) -> Result<bool, OrchestratorError> {
        let name = workload.display_name();
        let started = Instant::now();

        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.orchestrator.get_workload(workload).await {
                Ok(current) if !current.is_updating() => return Ok(true),
                Ok(_) => debug!("{}: Still updating", name),
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    error!("{}: Status check failed, skipping this cycle: {}", name, e);
                    UPDATES_FAILED_TOTAL.inc();
                    return Ok(false);
                },
            }

            if let Some(limit) = self.config.convergence_timeout
                && started.elapsed() >= limit
            {
                error!(
                    "{}: Did not converge within {}s, giving up",
                    name,
                    limit.as_secs()
                );
                return Ok(false);
            }
        }
    }

    fn payload_for(&self, outcome: &UpdateOutcome) -> NotificationPayload {
        let include = self.config.notify_include;
        let workload = &outcome.workload;

        let mut payload = NotificationPayload::new(DEFAULT_TITLE)
            .with_field("service_name", &workload.name)
            .with_field("service_short_id", &workload.short_id);

        if include.image {
            payload = payload.with_field("image", &outcome.new_image.name);
        }
        if include.old_image {
            payload = payload.with_field("old_image", outcome.previous_image.to_string());
        }
        if include.new_image {
            payload = payload.with_field("new_image", outcome.new_image.to_string());
        }

        payload
    }
}

/// Counter labels are keyed on the image name, so one series survives digest changes.
pub fn service_labels(workload: &Workload) -> ServiceLabels<'_> {
    ServiceLabels {
        name: &workload.name,
        id: &workload.id,
        short_id: &workload.short_id,
        image: &workload.image.name,
    }
}
