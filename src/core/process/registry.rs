use super::{Process, ProcessLogic};
use crate::core::error::{EngineError, Result};
use crate::core::protocol::ProtocolLogic;
use crate::core::resource::{RESOURCE, ResourceType};
use crate::lab::Lab;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a fresh behaviour for a process type.
pub type ProcessFactory = fn() -> Box<dyn ProcessLogic>;

fn make<L: ProcessLogic + Default>() -> Box<dyn ProcessLogic> {
    Box::new(L::default())
}

/// Bootstrap-time table of the process and resource types a lab can rebuild
/// from persisted graphs.
pub struct ProcessRegistry {
    processes: HashMap<&'static str, ProcessFactory>,
    resources: HashMap<&'static str, &'static ResourceType>,
}

impl ProcessRegistry {
    /// A registry that knows protocols and the base resource type.
    pub fn new() -> Self {
        let mut registry = Self {
            processes: HashMap::new(),
            resources: HashMap::new(),
        };
        registry.register::<ProtocolLogic>();
        registry.register_resource(&RESOURCE);
        registry
    }

    pub fn register<L: ProcessLogic + Default>(&mut self) -> &mut Self {
        let type_name = L::default().type_name();
        self.register_factory(type_name, make::<L>)
    }

    pub fn register_factory(&mut self, type_name: &'static str, factory: ProcessFactory) -> &mut Self {
        if self.processes.insert(type_name, factory).is_some() {
            log::warn!("Process type '{}' was already registered, overwriting it.", type_name);
        }
        self
    }

    pub fn register_resource(&mut self, kind: &'static ResourceType) -> &mut Self {
        self.resources.insert(kind.name(), kind);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.processes.contains_key(type_name)
    }

    pub fn factory(&self, type_name: &str) -> Result<ProcessFactory> {
        self.processes
            .get(type_name)
            .copied()
            .ok_or_else(|| EngineError::UnknownProcessType(type_name.to_string()))
    }

    pub fn resource_type(&self, name: &str) -> Option<&'static ResourceType> {
        self.resources.get(name).copied()
    }

    /// Find-or-create: singleton types reuse the persisted row of their type.
    pub async fn get_or_create(&self, lab: &Arc<Lab>, type_name: &str) -> Result<Arc<Process>> {
        let factory = self.factory(type_name)?;
        Process::create_boxed(lab, factory()).await
    }
}

impl Default for ProcessRegistry {
    /// The base registry plus the robot bricks when the `robot` feature is on.
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "robot")]
        crate::robot::register(&mut registry);
        registry
    }
}
