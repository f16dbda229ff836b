//! Run records: one [`Job`] per process instance and run context.
//!
//! A job owns the [`ProgressBar`] that tells whether its process is running
//! or finished, and the provenance of what the process consumed.

pub mod progress_bar;
pub mod snapshot;

pub use progress_bar::{ProgressBar, ProgressMessage};

use crate::core::error::{EngineError, Result};
use crate::core::lock;
use crate::core::process::Process;
use crate::store::{Record, RecordKind, StoreError, new_uri};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, Weak};

/// Where an upstream resource came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub job_uri: String,
    pub process_uri: String,
    pub instance_name: String,
    pub port: String,
}

/// What one input port consumed during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTrace {
    pub port: String,
    pub resource_uri: Option<String>,
    /// Set only when the port is fed by a connector.
    pub upstream: Option<Upstream>,
}

#[derive(Debug)]
struct JobState {
    instance_name: String,
    config_uri: String,
    parent_job_uri: Option<String>,
    experiment_uri: Option<String>,
    source: Option<String>,
    inputs: Vec<InputTrace>,
    progress: ProgressBar,
}

pub struct Job {
    uri: String,
    process: Weak<Process>,
    process_uri: String,
    process_type: String,
    state: Mutex<JobState>,
}

impl Job {
    pub(crate) fn new(process: &Arc<Process>) -> Self {
        let settings = process.lab().settings();
        Self {
            uri: new_uri(),
            process: Arc::downgrade(process),
            process_uri: process.uri().to_string(),
            process_type: process.type_name().to_string(),
            state: Mutex::new(JobState {
                instance_name: process.instance_name(),
                config_uri: process.config_uri(),
                parent_job_uri: None,
                experiment_uri: None,
                source: None,
                inputs: Vec::new(),
                progress: ProgressBar::new(settings.progress_max_value, settings.progress_min_delta),
            }),
        }
    }

    /// Rebuilds the job saved as `record` for a rebuilt `process`.
    ///
    /// The progress bar comes from its own row when there is one, since
    /// accepted updates are written there between job saves.
    pub(crate) async fn load(process: &Arc<Process>, record: &Record) -> Result<Self> {
        let min_delta = process.lab().settings().progress_min_delta;
        let bar_uri = record.str_field("progress_bar_uri");
        let bar_record = match process.lab().store().get_by_uri(RecordKind::ProgressBar, bar_uri).await? {
            Some(bar_record) => bar_record,
            None => Record::new(
                RecordKind::ProgressBar,
                bar_uri.to_string(),
                record.body.get("progress_bar").cloned().unwrap_or_default(),
            ),
        };
        let progress = ProgressBar::from_record(&bar_record, min_delta)?;
        let inputs: Vec<InputTrace> = match record.body.get("inputs") {
            Some(inputs) => serde_json::from_value(inputs.clone()).map_err(StoreError::from)?,
            None => Vec::new(),
        };
        let text = |key: &str| record.body.get(key).and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            uri: record.uri.clone(),
            process: Arc::downgrade(process),
            process_uri: process.uri().to_string(),
            process_type: process.type_name().to_string(),
            state: Mutex::new(JobState {
                instance_name: process.instance_name(),
                config_uri: process.config_uri(),
                parent_job_uri: text("parent_job_uri"),
                experiment_uri: text("experiment_uri"),
                source: text("source"),
                inputs,
                progress,
            }),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn process_uri(&self) -> &str {
        &self.process_uri
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn instance_name(&self) -> String {
        lock(&self.state).instance_name.clone()
    }

    pub fn config_uri(&self) -> String {
        lock(&self.state).config_uri.clone()
    }

    pub fn parent_job_uri(&self) -> Option<String> {
        lock(&self.state).parent_job_uri.clone()
    }

    pub fn experiment_uri(&self) -> Option<String> {
        lock(&self.state).experiment_uri.clone()
    }

    pub(crate) fn set_experiment(&self, experiment_uri: &str) {
        lock(&self.state).experiment_uri = Some(experiment_uri.to_string());
    }

    pub fn inputs(&self) -> Vec<InputTrace> {
        lock(&self.state).inputs.clone()
    }

    /// A copy of the current progress bar.
    pub fn progress_bar(&self) -> ProgressBar {
        lock(&self.state).progress.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).progress.is_running()
    }

    pub fn is_finished(&self) -> bool {
        let state = lock(&self.state);
        state.progress.is_started() && state.progress.is_stopped()
    }

    /// Reports progress and persists the bar when the update is accepted.
    ///
    /// Returns `Ok(false)` for a dropped update, which writes nothing.
    pub async fn update_progress(&self, value: f64, message: Option<&str>) -> Result<bool> {
        let record = {
            let mut state = lock(&self.state);
            if !state.progress.change(value) {
                return Ok(false);
            }
            if let Some(text) = message {
                state.progress.add_message(text);
            }
            state.progress.to_record()?
        };
        if let Some(process) = self.process() {
            process
                .lab()
                .store()
                .save(record)
                .await
                .map_err(|err| EngineError::save_failed(format!("progress of job '{}'", self.uri), err))?;
        }
        Ok(true)
    }

    pub fn add_message(&self, text: &str) {
        lock(&self.state).progress.add_message(text);
    }

    pub(crate) fn start_progress(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.progress.is_started() {
            return Ok(());
        }
        let max_value = state.progress.max_value();
        state.progress.start(max_value)
    }

    pub(crate) fn stop_progress(&self) {
        lock(&self.state).progress.stop();
    }

    /// Refreshes the snapshot of the run context from the process tree.
    ///
    /// The parent job and experiment are inherited from the enclosing
    /// protocol when this job has none yet.
    pub(crate) fn refresh(&self, process: &Arc<Process>) {
        let parent_job = process.parent().map(|parent| parent.job());
        let mut state = lock(&self.state);
        state.instance_name = process.instance_name();
        state.config_uri = process.config_uri();
        if let Some(parent_job) = parent_job {
            state.parent_job_uri = Some(parent_job.uri().to_string());
            if state.experiment_uri.is_none() {
                state.experiment_uri = parent_job.experiment_uri();
            }
        }
    }

    /// Records, for every input port, the consumed resource and the upstream
    /// endpoint when the port is wired to a connector.
    pub(crate) fn track_inputs(&self, process: &Arc<Process>) {
        let mut traces = Vec::new();
        for port in process.input().ports() {
            let upstream = port.incoming().and_then(|link| {
                let source = link.process()?;
                Some(Upstream {
                    job_uri: source.job().uri().to_string(),
                    process_uri: source.uri().to_string(),
                    instance_name: source.instance_name(),
                    port: link.port_name().to_string(),
                })
            });
            traces.push(InputTrace {
                port: port.name().to_string(),
                resource_uri: port.resource().map(|r| r.uri().to_string()),
                upstream,
            });
        }
        lock(&self.state).inputs = traces;
    }

    fn source_snapshot(&self, process: &Process) -> Result<String> {
        if let Some(source) = lock(&self.state).source.clone() {
            return Ok(source);
        }
        let source = snapshot::compress(&process.behaviour().source())?;
        lock(&self.state).source = Some(source.clone());
        Ok(source)
    }

    /// The decompressed source snapshot, once the job has been saved.
    pub fn source(&self) -> Result<Option<Value>> {
        let encoded = lock(&self.state).source.clone();
        match encoded {
            Some(encoded) => Ok(Some(snapshot::decompress(&encoded)?)),
            None => Ok(None),
        }
    }

    /// Saves the process, its config, the progress bar, the produced output
    /// resources and finally the job, in one transaction.
    pub async fn save(&self, process: &Arc<Process>) -> Result<()> {
        let source = self.source_snapshot(process)?;
        let mut records = vec![process.to_record(), process.config_record()];
        records.push(lock(&self.state).progress.to_record()?);
        for resource in process.output().resources().into_values().flatten() {
            records.push(resource.to_record());
        }
        records.push(self.to_record(&source));

        process
            .lab()
            .store()
            .save_all(records)
            .await
            .map_err(|err| EngineError::save_failed(format!("job '{}'", self.uri), err))?;
        process.mark_config_saved();
        Ok(())
    }

    fn to_record(&self, source: &str) -> Record {
        let mut body = self.to_json();
        if let Some(map) = body.as_object_mut() {
            map.insert("source".into(), source.into());
            map.remove("uri");
        }
        Record::new(RecordKind::Job, self.uri.clone(), body)
    }

    pub fn to_json(&self) -> Value {
        let state = lock(&self.state);
        json!({
            "uri": self.uri,
            "process_uri": self.process_uri,
            "process_type": self.process_type,
            "instance_name": state.instance_name,
            "config_uri": state.config_uri,
            "parent_job_uri": state.parent_job_uri,
            "experiment_uri": state.experiment_uri,
            "progress_bar_uri": state.progress.uri(),
            "progress_bar": state.progress.to_json(),
            "inputs": state.inputs,
            "is_running": state.progress.is_running(),
            "is_finished": state.progress.is_started() && state.progress.is_stopped(),
        })
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("uri", &self.uri)
            .field("process_uri", &self.process_uri)
            .field("process_type", &self.process_type)
            .finish()
    }
}
