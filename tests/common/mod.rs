// Common test utilities for integration tests
//
// In-memory orchestrator and registry fakes plus a recording notifier, so a
// full reconciliation cycle can run without a cluster or a registry.

#![allow(dead_code)]

use anyhow::Result;
use crosswind::config::ReconcilerConfig;
use crosswind::labels::{self, keys};
use crosswind::models::{ImageReference, UpdateState, Workload, short_id};
use crosswind::notifications::{NotificationManager, NotificationPayload, Notifier};
use crosswind::orchestrator::{Orchestrator, OrchestratorError};
use crosswind::reconciler::Reconciler;
use crosswind::registry::{Registry, RegistryError};
use crosswind::webhook::WebhookDispatcher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Creates a workload with a unique id derived from `id_seed`
pub fn workload(id_seed: &str, name: &str, image: &str) -> Workload {
    let id = format!("{}-0000-4000-8000-{}", id_seed, name);
    Workload {
        short_id: short_id(&id),
        id,
        name: name.to_string(),
        namespace: Some("default".to_string()),
        image: ImageReference::parse(image),
        update_state: UpdateState::Idle,
        labels: BTreeMap::new(),
    }
}

/// Webhook labels pointing at `url`, plus any extra `(key, value)` pairs
pub fn webhook_labels(url: &str, extra: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(labels::label(keys::HTTP_URL), url.to_string());
    for (key, value) in extra {
        map.insert(labels::label(key), value.to_string());
    }
    map
}

#[derive(Default)]
struct OrchestratorState {
    workloads: Vec<Workload>,
    /// Status checks answered with `Updating` before the rollout completes
    pending_polls: HashMap<String, usize>,
    list_calls: usize,
    selectors: Vec<Option<String>>,
    updates: Vec<(String, String, bool)>,
    polls: HashMap<String, usize>,
}

/// Orchestrator keeping workloads in memory
#[derive(Default)]
pub struct FakeOrchestrator {
    state: Mutex<OrchestratorState>,
    /// Status checks reporting `Updating` after each update
    polls_before_idle: usize,
    /// Update requests for these names are rejected
    failing_updates: HashSet<String>,
    /// These names vanish during their first status check
    vanishing: HashSet<String>,
    /// These names never finish rolling out
    stuck: HashSet<String>,
    /// Status checks for these names fail with an API error
    failing_status: HashSet<String>,
}

impl FakeOrchestrator {
    pub fn new(workloads: Vec<Workload>) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().workloads = workloads;
        fake
    }

    pub fn polls_before_idle(mut self, polls: usize) -> Self {
        self.polls_before_idle = polls;
        self
    }

    pub fn failing_update(mut self, name: &str) -> Self {
        self.failing_updates.insert(name.to_string());
        self
    }

    pub fn vanishing(mut self, name: &str) -> Self {
        self.vanishing.insert(name.to_string());
        self
    }

    pub fn stuck(mut self, name: &str) -> Self {
        self.stuck.insert(name.to_string());
        self
    }

    pub fn failing_status(mut self, name: &str) -> Self {
        self.failing_status.insert(name.to_string());
        self
    }

    pub fn updates(&self) -> Vec<(String, String, bool)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn selectors(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().selectors.clone()
    }

    pub fn polls(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .polls
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_workloads(&self, selector: Option<&str>) -> Result<Vec<Workload>, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        state.selectors.push(selector.map(String::from));

        let matches = |w: &Workload| match selector.and_then(|s| s.split_once('=')) {
            Some((key, value)) => w.labels.get(key).map(String::as_str) == Some(value),
            None => true,
        };

        Ok(state.workloads.iter().filter(|w| matches(*w)).cloned().collect())
    }

    async fn get_workload(&self, workload: &Workload) -> Result<Workload, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        *state.polls.entry(workload.name.clone()).or_default() += 1;

        if self.vanishing.contains(&workload.name) {
            state.workloads.retain(|w| w.id != workload.id);
            return Err(OrchestratorError::NotFound(workload.name.clone()));
        }

        if self.failing_status.contains(&workload.name) {
            return Err(OrchestratorError::Api("deployments.apps is forbidden".to_string()));
        }

        let pending = state.pending_polls.entry(workload.id.clone()).or_default();
        let updating = self.stuck.contains(&workload.name) || *pending > 0;
        *pending = pending.saturating_sub(1);

        let mut current = state
            .workloads
            .iter()
            .find(|w| w.id == workload.id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(workload.name.clone()))?;
        current.update_state = if updating {
            UpdateState::Updating
        } else {
            UpdateState::Idle
        };

        Ok(current)
    }

    async fn update_image(
        &self,
        workload: &Workload,
        image: &ImageReference,
        force: bool,
    ) -> Result<(), OrchestratorError> {
        if self.failing_updates.contains(&workload.name) {
            return Err(OrchestratorError::Api("update rejected".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        state
            .updates
            .push((workload.name.clone(), image.to_string(), force));
        state
            .pending_polls
            .insert(workload.id.clone(), self.polls_before_idle);

        if let Some(stored) = state.workloads.iter_mut().find(|w| w.id == workload.id) {
            stored.image = image.clone();
        }

        Ok(())
    }
}

/// Registry answering from a fixed table. Unknown images are lookup errors.
#[derive(Default)]
pub struct FakeRegistry {
    digests: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new(digests: &[(&str, &str)]) -> Self {
        Self {
            digests: digests
                .iter()
                .map(|(image, digest)| (image.to_string(), digest.to_string()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Registry for FakeRegistry {
    async fn latest_digest(&self, image: &str, _namespace: Option<&str>) -> Result<String, RegistryError> {
        self.calls.lock().unwrap().push(image.to_string());
        self.digests
            .get(image)
            .cloned()
            .ok_or_else(|| RegistryError::Lookup {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            })
    }
}

/// Notifier recording every payload it is asked to send
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<NotificationPayload>>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<()> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Recording"
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Wire a reconciler to the fakes with a millisecond poll interval
pub fn reconciler(
    orchestrator: Arc<FakeOrchestrator>,
    registry: Arc<FakeRegistry>,
    config: ReconcilerConfig,
) -> (Reconciler, Arc<Mutex<Vec<NotificationPayload>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let notifications = NotificationManager::with_notifiers(vec![Box::new(RecordingNotifier {
        sent: sent.clone(),
    })]);

    let reconciler = Reconciler::new(
        orchestrator,
        registry,
        notifications,
        WebhookDispatcher::new().unwrap(),
        config,
    )
    .with_poll_interval(Duration::from_millis(1));

    (reconciler, sent)
}
