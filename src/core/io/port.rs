use crate::core::error::{EngineError, Result};
use crate::core::lock;
use crate::core::process::Process;
use crate::core::resource::{Resource, ResourceType};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Which side of a process a port lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Input,
    Output,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Input => "input",
            Side::Output => "output",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The declared contract of a port: accepted resource types and whether the
/// port must be filled for its process to be ready.
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    types: Vec<&'static ResourceType>,
    optional: bool,
}

impl PortSpec {
    pub fn new(kind: &'static ResourceType) -> Self {
        Self {
            types: vec![kind],
            optional: false,
        }
    }

    pub fn any_of(types: &[&'static ResourceType]) -> Self {
        Self {
            types: types.to_vec(),
            optional: false,
        }
    }

    /// Marks the port as optional: it never blocks readiness.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn types(&self) -> &[&'static ResourceType] {
        &self.types
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn accepts(&self, kind: &ResourceType) -> bool {
        self.types.iter().any(|accepted| kind.is_a(accepted))
    }

    /// True when every type `other` may carry is accepted here.
    pub fn accepts_all(&self, other: &PortSpec) -> bool {
        other.types.iter().all(|kind| self.accepts(kind))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "types": self.types.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "optional": self.optional,
        })
    }
}

/// Port specs keyed by port name.
pub type PortSpecs = BTreeMap<String, PortSpec>;

/// Builds a port spec map from `(name, spec)` pairs.
pub fn port_specs<I, K>(items: I) -> PortSpecs
where
    I: IntoIterator<Item = (K, PortSpec)>,
    K: Into<String>,
{
    items.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// A weak pointer to a port on another process.
#[derive(Clone)]
pub struct PortRef {
    process: Weak<Process>,
    port: String,
}

impl PortRef {
    pub(crate) fn new(process: &Arc<Process>, port: impl Into<String>) -> Self {
        Self {
            process: Arc::downgrade(process),
            port: port.into(),
        }
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn port_name(&self) -> &str {
        &self.port
    }
}

impl fmt::Debug for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self
            .process()
            .map(|p| p.instance_name())
            .unwrap_or_else(|| "<dropped>".to_string());
        write!(f, "{}.{}", owner, self.port)
    }
}

/// A single-slot, type-constrained resource holder.
///
/// Input ports accept at most one incoming link; output ports may feed many
/// input ports.
pub struct Port {
    name: String,
    side: Side,
    spec: PortSpec,
    resource: Mutex<Option<Arc<Resource>>>,
    links: Mutex<Vec<PortRef>>,
}

impl Port {
    pub(crate) fn new(name: impl Into<String>, side: Side, spec: PortSpec) -> Self {
        Self {
            name: name.into(),
            side,
            spec,
            resource: Mutex::new(None),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn is_optional(&self) -> bool {
        self.spec.optional
    }

    pub fn resource(&self) -> Option<Arc<Resource>> {
        lock(&self.resource).clone()
    }

    /// Stores a resource, checking it against the accepted types.
    pub fn set_resource(&self, resource: Option<Arc<Resource>>) -> Result<()> {
        if let Some(r) = &resource {
            if !self.spec.accepts(r.kind()) {
                return Err(EngineError::TypeMismatch {
                    port: self.name.clone(),
                    found: r.kind().name().to_string(),
                    expected: self
                        .spec
                        .types
                        .iter()
                        .map(|t| t.name())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        *lock(&self.resource) = resource;
        Ok(())
    }

    pub fn is_filled(&self) -> bool {
        lock(&self.resource).is_some()
    }

    /// True when the port holds a resource or does not need one.
    pub fn is_ready(&self) -> bool {
        self.spec.optional || self.is_filled()
    }

    pub fn is_connected(&self) -> bool {
        !lock(&self.links).is_empty()
    }

    pub fn links(&self) -> Vec<PortRef> {
        lock(&self.links).clone()
    }

    /// The upstream port feeding an input port, if any.
    pub fn incoming(&self) -> Option<PortRef> {
        match self.side {
            Side::Input => lock(&self.links).first().cloned(),
            Side::Output => None,
        }
    }

    pub(crate) fn add_link(&self, target: PortRef) -> Result<()> {
        let mut links = lock(&self.links);
        if self.side == Side::Input && !links.is_empty() {
            return Err(EngineError::Configuration(format!(
                "input port '{}' is already connected",
                self.name
            )));
        }
        links.push(target);
        Ok(())
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("side", &self.side)
            .field("spec", &self.spec)
            .field("resource", &self.resource().map(|r| r.uri().to_string()))
            .finish()
    }
}
