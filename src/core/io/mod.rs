//! Ports and the edges between them.
//!
//! - [`Port`] is a single typed slot.
//! - [`Input`] and [`Output`] are the named port sets of one process.
//! - [`Connector`] wires an output port to an input port inside a protocol.
//! - [`Interface`] and [`Outerface`] expose a child port as a protocol port.

pub mod connector;
pub mod port;

pub use connector::{Connector, Interface, Outerface};
pub use port::{Port, PortRef, PortSpec, PortSpecs, Side, port_specs};

use crate::core::error::{EngineError, Result};
use crate::core::process::Process;
use crate::core::resource::Resource;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// A named set of ports on one side of a process.
pub struct PortMap {
    side: Side,
    ports: RwLock<BTreeMap<String, Arc<Port>>>,
}

impl PortMap {
    fn new(side: Side) -> Self {
        Self {
            side,
            ports: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Port>>> {
        self.ports.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Registers a new port. Fails if the name is taken.
    pub fn create_port(&self, name: &str, spec: PortSpec) -> Result<Arc<Port>> {
        let mut ports = self.ports.write().unwrap_or_else(|e| e.into_inner());
        if ports.contains_key(name) {
            return Err(EngineError::Configuration(format!(
                "{} port '{}' is already defined",
                self.side, name
            )));
        }
        let port = Arc::new(Port::new(name, self.side, spec));
        ports.insert(name.to_string(), Arc::clone(&port));
        Ok(port)
    }

    pub fn port(&self, name: &str) -> Option<Arc<Port>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn resource(&self, name: &str) -> Option<Arc<Resource>> {
        self.port(name).and_then(|p| p.resource())
    }

    /// Port name to held resource, for every port.
    pub fn resources(&self) -> BTreeMap<String, Option<Arc<Resource>>> {
        self.read()
            .iter()
            .map(|(name, port)| (name.clone(), port.resource()))
            .collect()
    }

    /// True when every mandatory port holds a resource.
    pub fn is_ready(&self) -> bool {
        self.read().values().all(|p| p.is_ready())
    }

    pub fn specs_json(&self) -> Value {
        let specs: Map<String, Value> = self
            .read()
            .iter()
            .map(|(name, port)| (name.clone(), port.spec().to_json()))
            .collect();
        Value::Object(specs)
    }
}

/// The input ports of a process.
pub struct Input(PortMap);

impl Input {
    pub fn new() -> Self {
        Input(PortMap::new(Side::Input))
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for Input {
    type Target = PortMap;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The output ports of a process.
pub struct Output(PortMap);

impl Output {
    pub fn new() -> Self {
        Output(PortMap::new(Side::Output))
    }

    /// Copies every held resource into the input ports linked downstream.
    ///
    /// Ports that already hold the same resource are left untouched, so
    /// propagating twice is a no-op.
    pub fn propagate(&self) -> Result<()> {
        for port in self.ports() {
            let Some(resource) = port.resource() else {
                continue;
            };
            for link in port.links() {
                let Some(target) = link.process() else {
                    continue;
                };
                let in_port = target.in_port(link.port_name())?;
                if in_port
                    .resource()
                    .is_some_and(|current| Arc::ptr_eq(&current, &resource))
                {
                    continue;
                }
                in_port.set_resource(Some(Arc::clone(&resource)))?;
            }
        }
        Ok(())
    }

    /// The distinct processes fed by any output port, in port order.
    pub fn next_processes(&self) -> Vec<Arc<Process>> {
        let mut next: Vec<Arc<Process>> = Vec::new();
        for port in self.ports() {
            for process in port.links().iter().filter_map(PortRef::process) {
                if !next.iter().any(|p| Arc::ptr_eq(p, &process)) {
                    next.push(process);
                }
            }
        }
        next
    }

    /// True when no output port feeds anything.
    pub fn is_sink(&self) -> bool {
        self.ports().iter().all(|p| !p.is_connected())
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for Output {
    type Target = PortMap;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resource::{RESOURCE, ResourceType};
    use serde_json::json;

    static SAMPLE: ResourceType = ResourceType::derived("Sample", &RESOURCE);

    #[test]
    fn test_create_port_rejects_duplicates() {
        let input = Input::new();
        input.create_port("a", PortSpec::new(&SAMPLE)).unwrap();
        assert!(matches!(
            input.create_port("a", PortSpec::new(&SAMPLE)),
            Err(EngineError::Configuration(_))
        ));
        assert_eq!(input.names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_readiness_ignores_optional_ports() {
        let input = Input::new();
        input.create_port("a", PortSpec::new(&SAMPLE)).unwrap();
        input
            .create_port("b", PortSpec::new(&SAMPLE).optional())
            .unwrap();
        assert!(!input.is_ready());

        input
            .port("a")
            .unwrap()
            .set_resource(Some(Arc::new(Resource::new(&SAMPLE, json!(1)))))
            .unwrap();
        assert!(input.is_ready());
        assert!(input.resources()["b"].is_none());
    }

    #[test]
    fn test_empty_sets_are_ready() {
        assert!(Input::new().is_ready());
        assert!(Output::new().is_ready());
        assert!(Output::new().is_sink());
    }
}
