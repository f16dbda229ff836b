use crate::core::error::{EngineError, Result};
use crate::store::{Record, RecordKind, StoreError, new_uri};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How many messages a bar keeps before dropping the oldest.
pub const MAX_MESSAGES: usize = 64;

fn now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub time: f64,
    pub value: f64,
    pub text: String,
}

/// Bounded monotonic progress of one job.
///
/// `start_time == 0` means not started; `value >= max_value` means stopped.
/// Timestamps are Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressBar {
    #[serde(skip)]
    uri: String,
    value: f64,
    max_value: f64,
    start_time: f64,
    current_time: f64,
    elapsed_time: f64,
    remaining_time: f64,
    average_speed: f64,
    messages: VecDeque<ProgressMessage>,
    #[serde(skip)]
    min_delta: f64,
    #[serde(skip)]
    last_update: f64,
}

impl ProgressBar {
    pub fn new(max_value: f64, min_delta: f64) -> Self {
        Self {
            uri: new_uri(),
            value: 0.0,
            max_value,
            start_time: 0.0,
            current_time: 0.0,
            elapsed_time: 0.0,
            remaining_time: 0.0,
            average_speed: 0.0,
            messages: VecDeque::new(),
            min_delta,
            last_update: 0.0,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_time
    }

    pub fn remaining_time(&self) -> f64 {
        self.remaining_time
    }

    pub fn average_speed(&self) -> f64 {
        self.average_speed
    }

    pub fn messages(&self) -> impl Iterator<Item = &ProgressMessage> {
        self.messages.iter()
    }

    pub fn is_started(&self) -> bool {
        self.start_time > 0.0
    }

    pub fn is_stopped(&self) -> bool {
        self.value >= self.max_value
    }

    pub fn is_running(&self) -> bool {
        self.is_started() && !self.is_stopped()
    }

    pub fn start(&mut self, max_value: f64) -> Result<()> {
        self.start_at(max_value, now())
    }

    fn start_at(&mut self, max_value: f64, at: f64) -> Result<()> {
        if self.is_started() {
            return Err(EngineError::Configuration(
                "the progress bar has already started".into(),
            ));
        }
        if max_value <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "invalid max value {} for a progress bar",
                max_value
            )));
        }
        self.max_value = max_value;
        self.value = 0.0;
        self.start_time = at;
        self.current_time = at;
        self.last_update = at;
        Ok(())
    }

    /// Moves the bar. Returns `false` when the update was dropped.
    ///
    /// Updates before [`ProgressBar::start`] are ignored. Values are clamped
    /// to `[0, max_value]`. Updates closer than the
    /// minimum delta to the previous one are dropped unless they reach the
    /// maximum, and so are updates that would move the bar backwards.
    pub fn change(&mut self, value: f64) -> bool {
        self.change_at(value, now())
    }

    fn change_at(&mut self, value: f64, at: f64) -> bool {
        if !self.is_started() {
            log::debug!("Progress update to {} ignored: the bar has not started", value);
            return false;
        }
        let value = value.clamp(0.0, self.max_value);
        if value < self.value {
            log::debug!("Progress update to {} ignored: the bar is at {}", value, self.value);
            return false;
        }
        if value < self.max_value && at - self.last_update < self.min_delta {
            log::debug!("Progress update to {} throttled", value);
            return false;
        }

        self.value = value;
        self.current_time = at;
        self.last_update = at;
        self.elapsed_time = at - self.start_time;
        if self.elapsed_time > 0.0 {
            self.average_speed = self.value / self.elapsed_time;
        }
        self.remaining_time = if self.average_speed > 0.0 {
            (self.max_value - self.value) / self.average_speed
        } else {
            0.0
        };
        if self.value >= self.max_value {
            self.stop_at(at);
        }
        true
    }

    pub fn stop(&mut self) {
        self.stop_at(now());
    }

    fn stop_at(&mut self, at: f64) {
        if !self.is_started() {
            self.start_time = at;
        }
        self.value = self.max_value;
        self.current_time = at;
        self.elapsed_time = at - self.start_time;
        self.remaining_time = 0.0;
        if self.elapsed_time > 0.0 {
            self.average_speed = self.value / self.elapsed_time;
        }
    }

    pub fn add_message(&mut self, text: impl Into<String>) {
        if self.messages.len() == MAX_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back(ProgressMessage {
            time: now(),
            value: self.value,
            text: text.into(),
        });
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = body.as_object_mut() {
            map.insert("uri".into(), self.uri.clone().into());
            map.insert("is_started".into(), self.is_started().into());
            map.insert("is_stopped".into(), self.is_stopped().into());
        }
        body
    }

    pub(crate) fn to_record(&self) -> Result<Record> {
        let body = serde_json::to_value(self).map_err(StoreError::from)?;
        Ok(Record::new(RecordKind::ProgressBar, self.uri.clone(), body))
    }

    pub(crate) fn from_record(record: &Record, min_delta: f64) -> std::result::Result<Self, StoreError> {
        let mut bar: ProgressBar = serde_json::from_value(record.body.clone())?;
        bar.uri = record.uri.clone();
        bar.min_delta = min_delta;
        bar.last_update = bar.current_time;
        Ok(bar)
    }
}
