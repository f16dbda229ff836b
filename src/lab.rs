//! The lab: the explicit context every engine object is built against.
//!
//! A [`Lab`] bundles the identity store, the process registry, the settings
//! and the in-memory identity maps. Nothing in the engine is global; two labs
//! never see each other's state.

use crate::core::error::{EngineError, Result};
use crate::core::experiment::Experiment;
use crate::core::lock;
use crate::core::process::{Process, ProcessRegistry};
use crate::core::queue::Queue;
use crate::store::{MemoryStore, RecordKind, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Tunables of a lab. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabSettings {
    pub queue_max_length: usize,
    pub queue_tick_interval: f64,
    pub queue_settle_delay: f64,
    pub progress_min_delta: f64,
    pub progress_max_value: f64,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            queue_max_length: 10,
            queue_tick_interval: 30.0,
            queue_settle_delay: 0.2,
            progress_min_delta: 1.0,
            progress_max_value: 100.0,
        }
    }
}

impl LabSettings {
    /// Parses a JSON settings document. Missing keys take their default.
    pub fn from_json(document: &str) -> Result<Self> {
        let settings: LabSettings = serde_json::from_str(document)
            .map_err(|err| EngineError::Configuration(format!("invalid lab settings: {}", err)))?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.queue_max_length == 0 {
            return Err(EngineError::Configuration("queue_max_length must be positive".into()));
        }
        if self.queue_tick_interval <= 0.0 {
            return Err(EngineError::Configuration("queue_tick_interval must be positive".into()));
        }
        if self.progress_max_value <= 0.0 {
            return Err(EngineError::Configuration("progress_max_value must be positive".into()));
        }
        for (name, value) in [
            ("queue_settle_delay", self.queue_settle_delay),
            ("progress_min_delta", self.progress_min_delta),
        ] {
            if value < 0.0 {
                return Err(EngineError::Configuration(format!("{} cannot be negative", name)));
            }
        }
        Ok(())
    }

    pub fn with_queue_max_length(mut self, length: usize) -> Self {
        self.queue_max_length = length;
        self
    }

    pub fn with_queue_tick_interval(mut self, seconds: f64) -> Self {
        self.queue_tick_interval = seconds;
        self
    }

    pub fn with_queue_settle_delay(mut self, seconds: f64) -> Self {
        self.queue_settle_delay = seconds;
        self
    }

    pub fn with_progress_min_delta(mut self, seconds: f64) -> Self {
        self.progress_min_delta = seconds;
        self
    }

    pub fn with_progress_max_value(mut self, value: f64) -> Self {
        self.progress_max_value = value;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.queue_tick_interval.max(0.001))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.queue_settle_delay.max(0.0))
    }
}

pub struct Lab {
    store: Arc<dyn Store>,
    registry: ProcessRegistry,
    settings: LabSettings,
    singletons: Mutex<HashMap<String, String>>,
    experiments: Mutex<HashMap<String, Weak<Experiment>>>,
    queue: OnceCell<Arc<Queue>>,
}

impl Lab {
    pub fn new(store: Arc<dyn Store>, registry: ProcessRegistry, settings: LabSettings) -> Arc<Lab> {
        Arc::new(Self {
            store,
            registry,
            settings,
            singletons: Mutex::new(HashMap::new()),
            experiments: Mutex::new(HashMap::new()),
            queue: OnceCell::new(),
        })
    }

    /// A lab over a fresh [`MemoryStore`] with the default registry and settings.
    pub fn in_memory() -> Arc<Lab> {
        Self::new(Arc::new(MemoryStore::new()), ProcessRegistry::default(), LabSettings::default())
    }

    pub fn with_settings(settings: LabSettings) -> Arc<Lab> {
        Self::new(Arc::new(MemoryStore::new()), ProcessRegistry::default(), settings)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &LabSettings {
        &self.settings
    }

    /// The persisted URI shared by every instance of a singleton type.
    pub(crate) async fn singleton_uri(&self, type_name: &str) -> Result<Option<String>> {
        if let Some(uri) = lock(&self.singletons).get(type_name) {
            return Ok(Some(uri.clone()));
        }
        let found = self
            .store
            .list(RecordKind::Process)
            .await?
            .into_iter()
            .find(|record| record.str_field("type") == type_name)
            .map(|record| record.uri);
        if let Some(uri) = &found {
            self.remember_singleton(type_name, uri);
        }
        Ok(found)
    }

    pub(crate) fn remember_singleton(&self, type_name: &str, uri: &str) {
        lock(&self.singletons).insert(type_name.to_string(), uri.to_string());
    }

    pub(crate) fn remember_experiment(&self, experiment: &Arc<Experiment>) {
        lock(&self.experiments).insert(experiment.uri().to_string(), Arc::downgrade(experiment));
    }

    /// The live experiment with this URI, loaded from the store when no
    /// instance is alive.
    pub async fn experiment(self: &Arc<Self>, uri: &str) -> Result<Arc<Experiment>> {
        let alive = lock(&self.experiments).get(uri).and_then(Weak::upgrade);
        match alive {
            Some(experiment) => Ok(experiment),
            None => Experiment::load(self, uri).await,
        }
    }

    /// The lab queue, loaded on first access.
    pub async fn queue(self: &Arc<Self>) -> Result<Arc<Queue>> {
        self.queue
            .get_or_try_init(|| async { Queue::load(self).await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Find-or-create a process of a registered type.
    pub async fn create_process(self: &Arc<Self>, type_name: &str) -> Result<Arc<Process>> {
        self.registry.get_or_create(self, type_name).await
    }
}

impl std::fmt::Debug for Lab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lab").field("settings", &self.settings).finish()
    }
}
