use super::port::{PortRef, PortSpec};
use crate::core::error::{EngineError, Result};
use crate::core::process::Process;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;

fn endpoint(process: &Process, port: &str) -> Value {
    json!({"node": process.instance_name(), "port": port})
}

fn type_names(spec: &PortSpec) -> String {
    spec.types()
        .iter()
        .map(|t| t.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A directed edge from an output port to an input port.
#[derive(Clone)]
pub struct Connector {
    source: Arc<Process>,
    source_port: String,
    target: Arc<Process>,
    target_port: String,
}

impl Connector {
    /// Checks both endpoints and their type compatibility.
    ///
    /// Every type the source port may emit must be accepted by the target.
    pub fn new(
        source: &Arc<Process>,
        source_port: &str,
        target: &Arc<Process>,
        target_port: &str,
    ) -> Result<Self> {
        if Arc::ptr_eq(source, target) {
            return Err(EngineError::Configuration(format!(
                "cannot connect '{}' to itself",
                source.instance_name()
            )));
        }
        let out_port = source.out_port(source_port)?;
        let in_port = target.in_port(target_port)?;
        if !in_port.spec().accepts_all(out_port.spec()) {
            return Err(EngineError::TypeMismatch {
                port: format!("{}.{}", target.instance_name(), target_port),
                found: type_names(out_port.spec()),
                expected: type_names(in_port.spec()),
            });
        }
        Ok(Self {
            source: Arc::clone(source),
            source_port: source_port.to_string(),
            target: Arc::clone(target),
            target_port: target_port.to_string(),
        })
    }

    pub fn source(&self) -> &Arc<Process> {
        &self.source
    }

    pub fn source_port(&self) -> &str {
        &self.source_port
    }

    pub fn target(&self) -> &Arc<Process> {
        &self.target
    }

    pub fn target_port(&self) -> &str {
        &self.target_port
    }

    pub fn is_same(&self, other: &Connector) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
            && Arc::ptr_eq(&self.target, &other.target)
            && self.source_port == other.source_port
            && self.target_port == other.target_port
    }

    /// Records the edge on both ports.
    pub(crate) fn link(&self) -> Result<()> {
        let out_port = self.source.out_port(&self.source_port)?;
        let in_port = self.target.in_port(&self.target_port)?;
        in_port.add_link(PortRef::new(&self.source, &self.source_port))?;
        out_port.add_link(PortRef::new(&self.target, &self.target_port))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "from": endpoint(&self.source, &self.source_port),
            "to": endpoint(&self.target, &self.target_port),
        })
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source.instance_name(),
            self.source_port,
            self.target.instance_name(),
            self.target_port
        )
    }
}

/// Exposes a child input port as an input port of the enclosing protocol.
#[derive(Clone)]
pub struct Interface {
    name: String,
    target: Arc<Process>,
    target_port: String,
}

impl Interface {
    pub fn new(name: &str, target: &Arc<Process>, target_port: &str) -> Result<Self> {
        target.in_port(target_port)?;
        Ok(Self {
            name: name.to_string(),
            target: Arc::clone(target),
            target_port: target_port.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Arc<Process> {
        &self.target
    }

    pub fn target_port(&self) -> &str {
        &self.target_port
    }

    /// The spec the protocol-level port must carry.
    pub fn spec(&self) -> Result<PortSpec> {
        Ok(self.target.in_port(&self.target_port)?.spec().clone())
    }

    pub fn to_json(&self) -> Value {
        json!({"to": endpoint(&self.target, &self.target_port)})
    }
}

/// Exposes a child output port as an output port of the enclosing protocol.
#[derive(Clone)]
pub struct Outerface {
    name: String,
    source: Arc<Process>,
    source_port: String,
}

impl Outerface {
    pub fn new(name: &str, source: &Arc<Process>, source_port: &str) -> Result<Self> {
        source.out_port(source_port)?;
        Ok(Self {
            name: name.to_string(),
            source: Arc::clone(source),
            source_port: source_port.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Arc<Process> {
        &self.source
    }

    pub fn source_port(&self) -> &str {
        &self.source_port
    }

    pub fn spec(&self) -> Result<PortSpec> {
        Ok(self.source.out_port(&self.source_port)?.spec().clone())
    }

    pub fn to_json(&self) -> Value {
        json!({"from": endpoint(&self.source, &self.source_port)})
    }
}
