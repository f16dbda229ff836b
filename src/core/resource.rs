use crate::core::error::Result;
use crate::core::lock;
use crate::lab::Lab;
use crate::store::{Record, RecordKind, StoreError, new_uri};
use serde_json::{Value, json};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A node of the resource type lattice.
///
/// Types are declared as statics and chained to their parent, so a port that
/// accepts `Robot` also accepts every type derived from it.
pub struct ResourceType {
    name: &'static str,
    parent: Option<&'static ResourceType>,
}

impl ResourceType {
    pub const fn base(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub const fn derived(name: &'static str, parent: &'static ResourceType) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static ResourceType> {
        self.parent
    }

    /// True when `self` is `other` or one of its descendants.
    pub fn is_a(&self, other: &ResourceType) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t.name == other.name {
                return true;
            }
            current = t.parent;
        }
        false
    }
}

impl PartialEq for ResourceType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ResourceType {}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The root of every resource type.
pub static RESOURCE: ResourceType = ResourceType::base("Resource");

/// A versioned piece of data produced or consumed by processes.
///
/// The payload is fixed at creation; tasks produce new resources instead of
/// mutating the ones they received.
pub struct Resource {
    uri: String,
    kind: &'static ResourceType,
    data: Value,
    job_uri: Mutex<Option<String>>,
    experiment_uri: Mutex<Option<String>>,
}

impl Resource {
    pub fn new(kind: &'static ResourceType, data: Value) -> Self {
        Self::with_uri(new_uri(), kind, data)
    }

    pub(crate) fn with_uri(uri: String, kind: &'static ResourceType, data: Value) -> Self {
        Self {
            uri,
            kind,
            data,
            job_uri: Mutex::new(None),
            experiment_uri: Mutex::new(None),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn kind(&self) -> &'static ResourceType {
        self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    /// The job that produced this resource, once it has been saved.
    pub fn job_uri(&self) -> Option<String> {
        lock(&self.job_uri).clone()
    }

    pub fn experiment_uri(&self) -> Option<String> {
        lock(&self.experiment_uri).clone()
    }

    /// Binds the resource to its producing job. The first binding wins.
    pub(crate) fn bind(&self, job_uri: &str, experiment_uri: Option<&str>) {
        let mut job = lock(&self.job_uri);
        if job.is_none() {
            *job = Some(job_uri.to_string());
            *lock(&self.experiment_uri) = experiment_uri.map(str::to_string);
        }
    }

    pub(crate) fn to_record(&self) -> Record {
        Record::new(
            RecordKind::Resource,
            self.uri.clone(),
            json!({
                "type": self.kind.name(),
                "data": self.data,
                "job_uri": self.job_uri(),
                "experiment_uri": self.experiment_uri(),
            }),
        )
    }

    pub(crate) fn from_record(
        record: &Record,
        resolve: impl Fn(&str) -> Option<&'static ResourceType>,
    ) -> std::result::Result<Self, StoreError> {
        let type_name = record.str_field("type");
        let kind = resolve(type_name)
            .ok_or_else(|| record.malformed(format!("unknown resource type '{}'", type_name)))?;
        let resource = Self::with_uri(
            record.uri.clone(),
            kind,
            record.body.get("data").cloned().unwrap_or(Value::Null),
        );
        *lock(&resource.job_uri) = record
            .body
            .get("job_uri")
            .and_then(Value::as_str)
            .map(str::to_string);
        *lock(&resource.experiment_uri) = record
            .body
            .get("experiment_uri")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(resource)
    }

    /// Loads a persisted resource, resolving its type through the lab registry.
    pub async fn load(lab: &Arc<Lab>, uri: &str) -> Result<Option<Resource>> {
        let Some(record) = lab.store().get_by_uri(RecordKind::Resource, uri).await? else {
            return Ok(None);
        };
        let resource = Self::from_record(&record, |name| lab.registry().resource_type(name))?;
        Ok(Some(resource))
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("uri", &self.uri)
            .field("kind", &self.kind)
            .field("data", &self.data)
            .finish()
    }
}
