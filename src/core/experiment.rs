//! Experiments: the top-level run request.
//!
//! The running/finished status of an experiment is never stored; it is
//! derived from the saved jobs each time it is asked for.

use crate::core::activity::{Activity, ActivityType};
use crate::core::error::{EngineError, Result};
use crate::core::job::Job;
use crate::core::lock;
use crate::core::process::{Event, Observable};
use crate::core::protocol::Protocol;
use crate::lab::Lab;
use crate::store::{Record, RecordKind, StoreError, new_uri};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uri: String,
    pub name: String,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            uri: new_uri(),
            name: name.to_string(),
        }
    }

    pub(crate) fn to_record(&self) -> Record {
        Record::new(RecordKind::User, self.uri.clone(), json!({"name": self.name}))
    }

    pub async fn load(lab: &Arc<Lab>, uri: &str) -> Result<Option<User>> {
        Ok(lab
            .store()
            .get_by_uri(RecordKind::User, uri)
            .await?
            .map(|record| User {
                name: record.str_field("name").to_string(),
                uri: record.uri,
            }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub uri: String,
    pub title: String,
}

impl Study {
    pub fn new(title: &str) -> Self {
        Self {
            uri: new_uri(),
            title: title.to_string(),
        }
    }

    pub(crate) fn to_record(&self) -> Record {
        Record::new(RecordKind::Study, self.uri.clone(), json!({"title": self.title}))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Flags {
    score: Option<f64>,
    is_validated: bool,
    is_archived: bool,
    is_deleted: bool,
    has_failed: bool,
    error: Option<String>,
}

pub struct Experiment {
    lab: Arc<Lab>,
    uri: String,
    study: Study,
    created_by: User,
    protocol: Protocol,
    flags: Mutex<Flags>,
    events: Observable<Experiment>,
}

impl Experiment {
    /// Creates an experiment around a root protocol (an empty one by default)
    /// and persists it with the protocol and the root job.
    pub async fn new(
        lab: &Arc<Lab>,
        study: Study,
        created_by: User,
        protocol: Option<Protocol>,
    ) -> Result<Arc<Experiment>> {
        let protocol = match protocol {
            Some(protocol) => protocol,
            None => Protocol::new(lab).await?,
        };
        let experiment = Arc::new(Experiment {
            lab: Arc::clone(lab),
            uri: new_uri(),
            study,
            created_by,
            protocol,
            flags: Mutex::new(Flags::default()),
            events: Observable::new(),
        });

        experiment.protocol.set_experiment(&experiment.uri);
        experiment.protocol.save().await?;
        experiment.protocol.job().save(experiment.protocol.process()).await?;
        experiment.save().await?;
        Activity::record(
            lab,
            ActivityType::Create,
            "experiment",
            &experiment.uri,
            Some(&experiment.created_by.uri),
        )
        .await?;
        lab.remember_experiment(&experiment);
        Ok(experiment)
    }

    /// Rebuilds a persisted experiment and its root protocol.
    ///
    /// The jobs saved for the experiment are reattached to the rebuilt tree,
    /// so a finished experiment stays finished and a later run keeps writing
    /// the same job records.
    pub async fn load(lab: &Arc<Lab>, uri: &str) -> Result<Arc<Experiment>> {
        let record = lab
            .store()
            .get_by_uri(RecordKind::Experiment, uri)
            .await?
            .ok_or_else(|| EngineError::ExperimentState {
                uri: uri.to_string(),
                reason: "not found".into(),
            })?;
        let parse = |key: &str| -> std::result::Result<Value, StoreError> {
            record
                .body
                .get(key)
                .cloned()
                .ok_or_else(|| record.malformed(format!("missing '{}'", key)))
        };
        let study: Study = serde_json::from_value(parse("study")?).map_err(StoreError::from)?;
        let created_by: User = serde_json::from_value(parse("created_by")?).map_err(StoreError::from)?;
        let flags: Flags = serde_json::from_value(parse("flags")?).map_err(StoreError::from)?;

        let protocol_uri = record.str_field("protocol_uri");
        let protocol_record = lab
            .store()
            .get_by_uri(RecordKind::Process, protocol_uri)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound(protocol_uri.to_string()))?;
        let graph = protocol_record
            .body
            .pointer("/data/graph")
            .cloned()
            .ok_or_else(|| record.malformed("root protocol has no graph"))?;
        let protocol = Protocol::from_graph(lab, &graph, false).await?;
        restore_jobs(lab, &protocol, uri).await?;

        let experiment = Arc::new(Experiment {
            lab: Arc::clone(lab),
            uri: uri.to_string(),
            study,
            created_by,
            protocol,
            flags: Mutex::new(flags),
            events: Observable::new(),
        });
        experiment.protocol.set_experiment(&experiment.uri);
        lab.remember_experiment(&experiment);
        Ok(experiment)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    pub fn created_by(&self) -> &User {
        &self.created_by
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn events(&self) -> &Observable<Experiment> {
        &self.events
    }

    pub fn on_start(&self, listener: impl Fn(&Experiment) + Send + Sync + 'static) {
        self.events.on(Event::Start, listener);
    }

    pub fn on_end(&self, listener: impl Fn(&Experiment) + Send + Sync + 'static) {
        self.events.on(Event::End, listener);
    }

    pub fn score(&self) -> Option<f64> {
        lock(&self.flags).score
    }

    pub fn set_score(&self, score: f64) {
        lock(&self.flags).score = Some(score);
    }

    pub fn is_validated(&self) -> bool {
        lock(&self.flags).is_validated
    }

    pub fn is_archived(&self) -> bool {
        lock(&self.flags).is_archived
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.flags).is_deleted
    }

    /// True once a run of this experiment returned an error.
    pub fn has_failed(&self) -> bool {
        lock(&self.flags).has_failed
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.flags).error.clone()
    }

    // ------------------------------------------------------------------
    // Derived status
    // ------------------------------------------------------------------

    async fn job_records(&self) -> Result<Vec<Record>> {
        Ok(self
            .lab
            .store()
            .list(RecordKind::Job)
            .await?
            .into_iter()
            .filter(|job| job.str_field("experiment_uri") == self.uri)
            .collect())
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.job_records().await?.iter().any(|job| flag(job, "is_running")))
    }

    pub async fn is_finished(&self) -> Result<bool> {
        let jobs = self.job_records().await?;
        Ok(!jobs.is_empty() && jobs.iter().all(|job| flag(job, "is_finished")))
    }

    /// How many live experiments of the lab have a running job.
    ///
    /// Failed and deleted experiments are left out: a failed task leaves its
    /// job running forever.
    pub async fn count_of_running_experiments(lab: &Arc<Lab>) -> Result<usize> {
        let running: HashSet<String> = lab
            .store()
            .list(RecordKind::Job)
            .await?
            .iter()
            .filter(|job| flag(job, "is_running"))
            .map(|job| job.str_field("experiment_uri").to_string())
            .filter(|uri| !uri.is_empty())
            .collect();

        let mut count = 0;
        for uri in running {
            let Some(record) = lab.store().get_by_uri(RecordKind::Experiment, &uri).await? else {
                continue;
            };
            let failed = record.body.pointer("/flags/has_failed").and_then(Value::as_bool);
            let deleted = record.body.pointer("/flags/is_deleted").and_then(Value::as_bool);
            if failed != Some(true) && deleted != Some(true) {
                count += 1;
            }
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn check_can_run(&self) -> Result<()> {
        let flags = lock(&self.flags);
        let reason = if flags.is_deleted {
            "it is deleted"
        } else if flags.is_archived {
            "it is archived"
        } else if flags.is_validated {
            "it is validated"
        } else {
            return Ok(());
        };
        Err(EngineError::ExperimentState {
            uri: self.uri.clone(),
            reason: reason.into(),
        })
    }

    /// Runs the root protocol to completion.
    ///
    /// An error leaves the execution tree as it is and marks the experiment
    /// as failed.
    pub async fn run(self: &Arc<Self>, user: &User) -> Result<()> {
        self.check_can_run()?;
        Activity::record(&self.lab, ActivityType::Start, "experiment", &self.uri, Some(&user.uri)).await?;
        self.save().await?;
        log::info!("Experiment '{}' started by '{}'", self.uri, user.name);

        self.events.fire(Event::Start, self).await?;
        if let Err(err) = self.protocol.run().await {
            {
                let mut flags = lock(&self.flags);
                flags.has_failed = true;
                flags.error = Some(err.to_string());
            }
            if let Err(save_err) = self.save().await {
                log::error!("Cannot record the failure of experiment '{}': {}", self.uri, save_err);
            }
            return Err(err);
        }
        self.events.fire(Event::End, self).await?;
        log::info!("Experiment '{}' finished", self.uri);
        Ok(())
    }

    /// Marks a finished experiment as validated.
    pub async fn validate(self: &Arc<Self>, user: &User) -> Result<()> {
        if self.is_validated() {
            return Ok(());
        }
        if !self.is_finished().await? {
            return Err(EngineError::ExperimentState {
                uri: self.uri.clone(),
                reason: "only a finished experiment can be validated".into(),
            });
        }
        lock(&self.flags).is_validated = true;
        self.save().await?;
        Activity::record(&self.lab, ActivityType::Validate, "experiment", &self.uri, Some(&user.uri)).await?;
        Ok(())
    }

    pub async fn archive(self: &Arc<Self>, archive: bool) -> Result<()> {
        if self.is_archived() == archive {
            return Ok(());
        }
        lock(&self.flags).is_archived = archive;
        self.save().await?;
        if archive {
            Activity::record(&self.lab, ActivityType::Archive, "experiment", &self.uri, None).await?;
        }
        Ok(())
    }

    pub async fn delete(self: &Arc<Self>) -> Result<()> {
        if self.is_deleted() {
            return Ok(());
        }
        lock(&self.flags).is_deleted = true;
        self.save().await?;
        Activity::record(&self.lab, ActivityType::Delete, "experiment", &self.uri, None).await?;
        Ok(())
    }

    /// Saves the experiment with its study and creator.
    pub async fn save(&self) -> Result<()> {
        let records = vec![self.study.to_record(), self.created_by.to_record(), self.to_record()];
        self.lab
            .store()
            .save_all(records)
            .await
            .map_err(|err| EngineError::save_failed(format!("experiment '{}'", self.uri), err))
    }

    fn to_record(&self) -> Record {
        let flags = lock(&self.flags).clone();
        Record::new(
            RecordKind::Experiment,
            self.uri.clone(),
            json!({
                "study": self.study,
                "created_by": self.created_by,
                "flags": flags,
                "protocol_uri": self.protocol.uri(),
            }),
        )
    }
}

/// Walks the rebuilt tree from the root job down, matching each child to the
/// saved job with the same parent job and instance name.
async fn restore_jobs(lab: &Arc<Lab>, protocol: &Protocol, experiment_uri: &str) -> Result<()> {
    let records: Vec<Record> = lab
        .store()
        .list(RecordKind::Job)
        .await?
        .into_iter()
        .filter(|job| job.str_field("experiment_uri") == experiment_uri)
        .collect();
    let root = records
        .iter()
        .find(|job| job.str_field("process_uri") == protocol.uri() && job.str_field("parent_job_uri").is_empty());
    let Some(root) = root else {
        log::warn!("Experiment '{}' has no saved root job.", experiment_uri);
        return Ok(());
    };

    let mut pending = vec![(Arc::clone(protocol.process()), root)];
    while let Some((process, record)) = pending.pop() {
        process.restore_job(Job::load(&process, record).await?);
        let Some(composite) = process.as_protocol() else {
            continue;
        };
        for (name, child) in composite.processes() {
            let saved = records
                .iter()
                .find(|job| job.str_field("parent_job_uri") == record.uri && job.str_field("instance_name") == name);
            if let Some(saved) = saved {
                pending.push((child, saved));
            }
        }
    }
    Ok(())
}

fn flag(record: &Record, key: &str) -> bool {
    record.body.get(key).and_then(Value::as_bool).unwrap_or(false)
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("uri", &self.uri)
            .field("study", &self.study.title)
            .field("protocol", &self.protocol.uri())
            .finish()
    }
}
