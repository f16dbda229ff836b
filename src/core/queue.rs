//! The lab-wide single-flight experiment queue.
//!
//! Entries are admitted in FIFO order by a periodic tick. Admission (the
//! "is anything running" check followed by the start) happens under one async
//! mutex, and the experiment started by the queue stays in an in-flight slot
//! until its run settles, so two queued experiments never overlap.

use crate::core::error::{EngineError, Result};
use crate::core::experiment::{Experiment, User};
use crate::core::lock;
use crate::lab::Lab;
use crate::store::{Record, RecordKind, StoreError, new_uri};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

/// URI of the persisted queue record.
pub const QUEUE_URI: &str = "queue";

/// A request to run one experiment on behalf of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(skip)]
    pub uri: String,
    pub user_uri: String,
    pub experiment_uri: String,
}

impl QueueEntry {
    pub fn new(experiment: &Experiment, user: &User) -> Self {
        Self {
            uri: new_uri(),
            user_uri: user.uri.clone(),
            experiment_uri: experiment.uri().to_string(),
        }
    }

    fn to_record(&self) -> Result<Record> {
        let body = serde_json::to_value(self).map_err(StoreError::from)?;
        Ok(Record::new(RecordKind::QueueEntry, self.uri.clone(), body))
    }

    fn from_record(record: Record) -> Result<Self> {
        let mut entry: QueueEntry = serde_json::from_value(record.body).map_err(StoreError::from)?;
        entry.uri = record.uri;
        Ok(entry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueState {
    is_active: bool,
    max_length: usize,
    jobs: Vec<String>,
}

/// The experiment the queue last started.
struct InFlight {
    experiment_uri: String,
    handle: JoinHandle<()>,
}

pub struct Queue {
    lab: Weak<Lab>,
    state: Mutex<QueueState>,
    admission: tokio::sync::Mutex<Option<InFlight>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    /// Loads the persisted queue, or an inactive empty one.
    pub async fn load(lab: &Arc<Lab>) -> Result<Queue> {
        let state = match lab.store().get_by_uri(RecordKind::Queue, QUEUE_URI).await? {
            Some(record) => {
                let jobs: Vec<String> = record
                    .body
                    .pointer("/data/jobs")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(StoreError::from)?
                    .unwrap_or_default();
                QueueState {
                    is_active: record.body.get("is_active").and_then(|v| v.as_bool()).unwrap_or(false),
                    max_length: record
                        .body
                        .get("max_length")
                        .and_then(|v| v.as_u64())
                        .map_or(lab.settings().queue_max_length, |n| n as usize),
                    jobs,
                }
            }
            None => QueueState {
                is_active: false,
                max_length: lab.settings().queue_max_length,
                jobs: Vec::new(),
            },
        };
        Ok(Queue {
            lab: Arc::downgrade(lab),
            state: Mutex::new(state),
            admission: tokio::sync::Mutex::new(None),
            ticker: Mutex::new(None),
        })
    }

    fn lab(&self) -> Result<Arc<Lab>> {
        self.lab
            .upgrade()
            .ok_or_else(|| EngineError::Configuration("the lab of this queue was dropped".into()))
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).is_active
    }

    pub fn max_length(&self) -> usize {
        lock(&self.state).max_length
    }

    pub fn len(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).jobs.is_empty()
    }

    /// URIs of the queued entries, head first.
    pub fn entry_uris(&self) -> Vec<String> {
        lock(&self.state).jobs.clone()
    }

    /// URI of the experiment started by the queue whose run has not settled yet.
    pub async fn in_flight(&self) -> Option<String> {
        self.admission
            .lock()
            .await
            .as_ref()
            .filter(|flight| !flight.handle.is_finished())
            .map(|flight| flight.experiment_uri.clone())
    }

    async fn save(&self) -> Result<()> {
        let lab = self.lab()?;
        let state = lock(&self.state).clone();
        let record = Record::new(
            RecordKind::Queue,
            QUEUE_URI,
            json!({
                "is_active": state.is_active,
                "max_length": state.max_length,
                "data": {"jobs": state.jobs},
            }),
        );
        lab.store()
            .save(record)
            .await
            .map_err(|err| EngineError::save_failed("queue", err))
    }

    /// Every queued entry that still resolves, head first.
    pub async fn entries(&self) -> Result<Vec<QueueEntry>> {
        let lab = self.lab()?;
        let mut entries = Vec::new();
        for uri in self.entry_uris() {
            if let Some(record) = lab.store().get_by_uri(RecordKind::QueueEntry, &uri).await? {
                entries.push(QueueEntry::from_record(record)?);
            }
        }
        Ok(entries)
    }

    /// Queues an entry.
    ///
    /// With `auto_start`, an active queue ticks right away when nothing runs
    /// on the lab, and an inactive queue is activated.
    pub async fn add(self: &Arc<Self>, entry: QueueEntry, auto_start: bool) -> Result<()> {
        let lab = self.lab()?;
        if !self.entry_uris().contains(&entry.uri) {
            if self
                .entries()
                .await?
                .iter()
                .any(|queued| queued.experiment_uri == entry.experiment_uri)
            {
                return Err(EngineError::ExperimentState {
                    uri: entry.experiment_uri.clone(),
                    reason: "it is already queued".into(),
                });
            }
            let max_length = self.max_length();
            if self.len() >= max_length {
                return Err(EngineError::QueueFull(max_length));
            }

            lab.store()
                .save(entry.to_record()?)
                .await
                .map_err(|err| EngineError::save_failed("queue entry", err))?;
            lock(&self.state).jobs.push(entry.uri.clone());
            self.save().await?;
        }

        if auto_start {
            if !self.is_active() {
                self.init().await?;
            } else if Experiment::count_of_running_experiments(&lab).await? == 0 {
                self.tick().await?;
            }
        }
        Ok(())
    }

    /// The earliest queued entry that still resolves.
    ///
    /// Orphaned entries (the entry or its experiment is gone) are dropped on
    /// the way.
    pub async fn next(&self) -> Result<Option<QueueEntry>> {
        let lab = self.lab()?;
        loop {
            let Some(head) = self.entry_uris().into_iter().next() else {
                return Ok(None);
            };
            let entry = match lab.store().get_by_uri(RecordKind::QueueEntry, &head).await? {
                Some(record) => Some(QueueEntry::from_record(record)?),
                None => None,
            };
            if let Some(entry) = entry {
                if lab.store().exists(RecordKind::Experiment, &entry.experiment_uri).await? {
                    return Ok(Some(entry));
                }
            }
            log::warn!("Queue entry '{}' is orphaned, dropping it.", head);
            self.pop(&head).await?;
        }
    }

    async fn pop(&self, entry_uri: &str) -> Result<()> {
        let lab = self.lab()?;
        lock(&self.state).jobs.retain(|uri| uri != entry_uri);
        self.save().await?;
        lab.store().delete(RecordKind::QueueEntry, entry_uri).await?;
        Ok(())
    }

    /// Removes every entry of an experiment. Returns whether one was queued.
    pub async fn remove(&self, experiment_uri: &str) -> Result<bool> {
        let mut removed = false;
        for entry in self.entries().await? {
            if entry.experiment_uri == experiment_uri {
                self.pop(&entry.uri).await?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// One admission step.
    ///
    /// Drops the head when the queue already ran it or when its experiment
    /// can no longer run, waits while it or any other experiment of the lab
    /// runs, and otherwise starts it.
    pub async fn tick(&self) -> Result<()> {
        let mut in_flight = self.admission.lock().await;
        let settled = match in_flight.take() {
            Some(flight) if !flight.handle.is_finished() => {
                log::debug!("Queue busy: experiment '{}' is in flight.", flight.experiment_uri);
                *in_flight = Some(flight);
                return Ok(());
            }
            Some(flight) => Some(flight.experiment_uri),
            None => None,
        };

        let Some(entry) = self.next().await? else {
            return Ok(());
        };
        if settled.as_deref() == Some(entry.experiment_uri.as_str()) {
            log::debug!("Experiment '{}' ran, leaving the queue.", entry.experiment_uri);
            return self.pop(&entry.uri).await;
        }
        let lab = self.lab()?;
        let experiment = lab.experiment(&entry.experiment_uri).await?;

        if experiment.is_finished().await? {
            log::debug!("Experiment '{}' finished, leaving the queue.", experiment.uri());
            return self.pop(&entry.uri).await;
        }
        if experiment.has_failed() || experiment.check_can_run().is_err() {
            log::warn!("Experiment '{}' cannot run anymore, leaving the queue.", experiment.uri());
            return self.pop(&entry.uri).await;
        }
        if experiment.is_running().await? {
            log::debug!("Experiment '{}' is already running.", experiment.uri());
            return Ok(());
        }
        if Experiment::count_of_running_experiments(&lab).await? > 0 {
            log::debug!("Queue busy: another experiment runs on the lab.");
            return Ok(());
        }

        let user = match User::load(&lab, &entry.user_uri).await? {
            Some(user) => user,
            None => experiment.created_by().clone(),
        };
        let experiment_uri = experiment.uri().to_string();
        log::info!("Queue starts experiment '{}'.", experiment_uri);
        let handle = tokio::spawn(async move {
            if let Err(err) = experiment.run(&user).await {
                log::error!("Queued experiment '{}' failed: {}", experiment.uri(), err);
            }
        });
        *in_flight = Some(InFlight { experiment_uri, handle });
        drop(in_flight);

        tokio::time::sleep(lab.settings().settle_delay()).await;
        Ok(())
    }

    /// Activates the queue and starts the periodic tick.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let lab = self.lab()?;
        lock(&self.state).is_active = true;
        self.save().await?;

        let mut ticker = lock(&self.ticker);
        if ticker.is_none() {
            let queue = Arc::downgrade(self);
            let period = lab.settings().tick_interval();
            *ticker = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let Some(queue) = queue.upgrade() else {
                        break;
                    };
                    if let Err(err) = queue.tick().await {
                        log::error!("Queue tick failed: {}", err);
                    }
                }
            }));
        }
        Ok(())
    }

    /// Deactivates the queue and stops ticking. Queued entries stay.
    pub async fn deinit(&self) -> Result<()> {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
        lock(&self.state).is_active = false;
        self.save().await
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Queue")
            .field("is_active", &state.is_active)
            .field("max_length", &state.max_length)
            .field("jobs", &state.jobs)
            .finish()
    }
}
