//! Audit trail of user-facing actions.

use crate::core::error::{EngineError, Result};
use crate::lab::Lab;
use crate::store::{Record, RecordKind, new_uri};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    Create,
    Start,
    Validate,
    Archive,
    Delete,
}

/// A single entry of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    #[serde(skip)]
    pub uri: String,
    pub activity_type: ActivityType,
    pub object_type: String,
    pub object_uri: String,
    pub user_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(
        activity_type: ActivityType,
        object_type: &str,
        object_uri: &str,
        user_uri: Option<&str>,
    ) -> Self {
        Self {
            uri: new_uri(),
            activity_type,
            object_type: object_type.to_string(),
            object_uri: object_uri.to_string(),
            user_uri: user_uri.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    /// Creates and persists an activity.
    pub async fn record(
        lab: &Arc<Lab>,
        activity_type: ActivityType,
        object_type: &str,
        object_uri: &str,
        user_uri: Option<&str>,
    ) -> Result<Activity> {
        let activity = Self::new(activity_type, object_type, object_uri, user_uri);
        let body = serde_json::to_value(&activity).map_err(crate::store::StoreError::from)?;
        lab.store()
            .save(Record::new(RecordKind::Activity, activity.uri.clone(), body))
            .await
            .map_err(|err| EngineError::save_failed("activity", err))?;
        Ok(activity)
    }

    /// Every activity recorded about an object, oldest first.
    pub async fn list_for(lab: &Arc<Lab>, object_uri: &str) -> Result<Vec<Activity>> {
        let mut activities = Vec::new();
        for record in lab.store().list(RecordKind::Activity).await? {
            if record.str_field("object_uri") != object_uri {
                continue;
            }
            let mut activity: Activity = serde_json::from_value(record.body.clone())
                .map_err(crate::store::StoreError::from)?;
            activity.uri = record.uri;
            activities.push(activity);
        }
        Ok(activities)
    }
}
