//! Composite processes.
//!
//! A [`Protocol`] is a [`Process`] whose behaviour is a [`ProtocolLogic`]:
//! a name-keyed set of children, the connectors wiring them, and the
//! interfaces/outerfaces that expose child ports as the protocol's own.

pub mod flow;
pub mod graph;
pub mod validation;

pub use validation::{ValidationIssue, ValidationResult};

use crate::core::activity::{Activity, ActivityType};
use crate::core::error::{EngineError, Result};
use crate::core::io::{Connector, Interface, Outerface};
use crate::core::lock;
use crate::core::process::{Event, Process, ProcessLogic};
use crate::lab::Lab;
use crate::store::{Record, RecordKind};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The type key of every protocol.
pub const PROTOCOL_TYPE: &str = "Protocol";

#[derive(Default)]
struct Graph {
    processes: BTreeMap<String, Arc<Process>>,
    connectors: Vec<Connector>,
    interfaces: BTreeMap<String, Interface>,
    outerfaces: BTreeMap<String, Outerface>,
    layout: BTreeMap<String, [f64; 2]>,
}

impl Graph {
    fn contains(&self, process: &Process) -> bool {
        self.processes
            .values()
            .any(|p| std::ptr::eq(Arc::as_ptr(p), process))
    }

    fn name_of(&self, process: &Process) -> Option<&str> {
        self.processes
            .iter()
            .find(|(_, p)| std::ptr::eq(Arc::as_ptr(p), process))
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Default)]
struct Meta {
    title: Option<String>,
    description: String,
}

/// The behaviour of a protocol: its graph and the fan-out task.
#[derive(Default)]
pub struct ProtocolLogic {
    graph: Mutex<Graph>,
    meta: Mutex<Meta>,
    is_validated: AtomicBool,
    is_saved: AtomicBool,
}

impl ProtocolLogic {
    pub fn children(&self) -> Vec<Arc<Process>> {
        lock(&self.graph).processes.values().cloned().collect()
    }

    pub fn all_children_finished(&self) -> bool {
        self.children().iter().all(|p| p.is_finished())
    }

    pub fn is_interfaced_with(&self, process: &Process) -> bool {
        lock(&self.graph)
            .interfaces
            .values()
            .any(|i| std::ptr::eq(Arc::as_ptr(i.target()), process))
    }

    pub fn is_outerfaced_with(&self, process: &Process) -> bool {
        lock(&self.graph)
            .outerfaces
            .values()
            .any(|o| std::ptr::eq(Arc::as_ptr(o.source()), process))
    }

    /// Pushes the protocol's own input resources onto the interfaced ports.
    pub(crate) fn set_inputs(&self, protocol: &Process) -> Result<()> {
        let interfaces: Vec<Interface> = lock(&self.graph).interfaces.values().cloned().collect();
        for interface in interfaces {
            if let Some(resource) = protocol.input().resource(interface.name()) {
                interface
                    .target()
                    .in_port(interface.target_port())?
                    .set_resource(Some(resource))?;
            }
        }
        Ok(())
    }

    /// Pulls the outerfaced child outputs onto the protocol's own ports.
    pub(crate) fn set_outputs(&self, protocol: &Process) -> Result<()> {
        let outerfaces: Vec<Outerface> = lock(&self.graph).outerfaces.values().cloned().collect();
        for outerface in outerfaces {
            if let Some(resource) = outerface.source().output_resource(outerface.source_port()) {
                protocol
                    .out_port(outerface.name())?
                    .set_resource(Some(resource))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessLogic for ProtocolLogic {
    fn type_name(&self) -> &'static str {
        PROTOCOL_TYPE
    }

    fn title(&self) -> String {
        lock(&self.meta)
            .title
            .clone()
            .unwrap_or_else(|| PROTOCOL_TYPE.to_string())
    }

    fn description(&self) -> String {
        lock(&self.meta).description.clone()
    }

    fn is_singleton(&self) -> bool {
        false
    }

    /// Runs every child that is ready or fed through an interface, all at
    /// once. Finished children are skipped, so a re-entered protocol resumes
    /// rather than restarts.
    async fn task(&self, _process: &Arc<Process>) -> Result<()> {
        let sources: Vec<Arc<Process>> = self
            .children()
            .into_iter()
            .filter(|child| child.is_ready() || self.is_interfaced_with(child))
            .collect();
        let results = join_all(sources.iter().map(|child| child.run())).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

/// A process handle known to carry a [`ProtocolLogic`].
#[derive(Clone)]
pub struct Protocol(Arc<Process>);

/// The Derefs give direct access to the underlying process.
impl std::ops::Deref for Protocol {
    type Target = Arc<Process>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Protocol {
    /// Creates and persists an empty protocol.
    pub async fn new(lab: &Arc<Lab>) -> Result<Protocol> {
        Ok(Protocol(Process::create(lab, ProtocolLogic::default()).await?))
    }

    /// Rebuilds an empty protocol shell that keeps a persisted URI.
    pub(crate) async fn reuse(lab: &Arc<Lab>, uri: &str) -> Result<Protocol> {
        let record = lab
            .store()
            .get_by_uri(RecordKind::Process, uri)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound(uri.to_string()))?;
        if record.str_field("type") != PROTOCOL_TYPE {
            return Err(EngineError::Graph(format!(
                "process '{}' is a '{}', not a protocol",
                uri,
                record.str_field("type")
            )));
        }
        Ok(Protocol(Process::build(
            lab,
            uri.to_string(),
            Box::new(ProtocolLogic::default()),
        )?))
    }

    pub(crate) fn wrap(process: Arc<Process>) -> Protocol {
        Protocol(process)
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.0
    }

    pub fn into_process(self) -> Arc<Process> {
        self.0
    }

    fn logic(&self) -> &ProtocolLogic {
        match self.0.protocol_logic() {
            Some(logic) => logic,
            // Protocol handles are only built around protocol logic.
            None => unreachable!("protocol handle without protocol logic"),
        }
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub fn set_title(&self, title: &str) {
        lock(&self.logic().meta).title = Some(title.to_string());
    }

    pub fn set_description(&self, description: &str) {
        lock(&self.logic().meta).description = description.to_string();
    }

    /// Sets the editor position of a child.
    pub fn set_position(&self, name: &str, x: f64, y: f64) -> Result<()> {
        let mut graph = lock(&self.logic().graph);
        if !graph.processes.contains_key(name) {
            return Err(EngineError::ProcessNotFound(name.to_string()));
        }
        if let Some(previous) = graph.layout.insert(name.to_string(), [x, y]) {
            log::warn!(
                "Position of '{}' overwritten ({:?} -> {:?})",
                name,
                previous,
                [x, y]
            );
        }
        Ok(())
    }

    pub fn position(&self, name: &str) -> [f64; 2] {
        lock(&self.logic().graph)
            .layout
            .get(name)
            .copied()
            .unwrap_or([0.0, 0.0])
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    pub fn is_validated(&self) -> bool {
        self.logic().is_validated.load(Ordering::SeqCst)
    }

    fn check_unlocked(&self) -> Result<()> {
        if self.0.is_running() || self.0.is_finished() || self.is_validated() {
            return Err(EngineError::ProtocolLocked(self.0.title()));
        }
        Ok(())
    }

    /// Adds a child under `name`.
    pub fn add_process(&self, name: &str, process: &Arc<Process>) -> Result<()> {
        self.check_unlocked()?;
        if Arc::ptr_eq(process, &self.0) {
            return Err(EngineError::Configuration(
                "a protocol cannot contain itself".into(),
            ));
        }
        if let Some(parent) = process.parent() {
            if !Arc::ptr_eq(&parent, &self.0) {
                return Err(EngineError::Configuration(format!(
                    "process '{}' already belongs to protocol '{}'",
                    process.instance_name(),
                    parent.title()
                )));
            }
        }
        {
            let mut graph = lock(&self.logic().graph);
            if graph.processes.contains_key(name) {
                return Err(EngineError::Configuration(format!(
                    "a process named '{}' already exists",
                    name
                )));
            }
            if let Some(existing) = graph.name_of(process) {
                return Err(EngineError::Configuration(format!(
                    "process is already registered as '{}'",
                    existing
                )));
            }
            process.set_instance_name(name);
            process.set_parent(&self.0);
            graph.processes.insert(name.to_string(), Arc::clone(process));
        }
        self.watch(process);
        Ok(())
    }

    /// Re-checks the completion of this protocol whenever a sink or
    /// outerfaced child ends. The filter is evaluated when the event fires.
    fn watch(&self, child: &Arc<Process>) {
        let parent = Arc::downgrade(&self.0);
        child.events().on_async(Event::End, move |child: Arc<Process>| {
            let parent = parent.clone();
            async move {
                let Some(parent) = parent.upgrade() else {
                    return Ok(());
                };
                let signals = child.is_sink()
                    || parent
                        .protocol_logic()
                        .is_some_and(|logic| logic.is_outerfaced_with(&child));
                if !signals {
                    return Ok(());
                }
                parent.run_after_task().await
            }
        });
    }

    pub fn add_connector(&self, connector: Connector) -> Result<()> {
        self.check_unlocked()?;
        let mut graph = lock(&self.logic().graph);
        for end in [connector.source(), connector.target()] {
            if !graph.contains(end) {
                return Err(EngineError::ProcessNotFound(end.instance_name()));
            }
        }
        if graph.connectors.iter().any(|c| c.is_same(&connector)) {
            return Err(EngineError::Configuration(format!(
                "connector {:?} already exists",
                connector
            )));
        }
        let interfaced = graph.interfaces.values().any(|i| {
            Arc::ptr_eq(i.target(), connector.target()) && i.target_port() == connector.target_port()
        });
        if interfaced {
            return Err(EngineError::Configuration(format!(
                "port '{}' of '{}' is fed by an interface",
                connector.target_port(),
                connector.target().instance_name()
            )));
        }
        connector.link()?;
        graph.connectors.push(connector);
        Ok(())
    }

    /// Wires `source.source_port` to `target.target_port`.
    pub fn connect(
        &self,
        source: &Arc<Process>,
        source_port: &str,
        target: &Arc<Process>,
        target_port: &str,
    ) -> Result<()> {
        self.add_connector(Connector::new(source, source_port, target, target_port)?)
    }

    /// Exposes `target.port` as the input port `name` of this protocol.
    pub fn set_interface(&self, name: &str, target: &Arc<Process>, port: &str) -> Result<()> {
        self.check_unlocked()?;
        let mut graph = lock(&self.logic().graph);
        if !graph.contains(target) {
            return Err(EngineError::ProcessNotFound(target.instance_name()));
        }
        if graph.interfaces.contains_key(name) {
            return Err(EngineError::Configuration(format!(
                "interface '{}' is already defined",
                name
            )));
        }
        let interface = Interface::new(name, target, port)?;
        if target.in_port(port)?.is_connected() {
            return Err(EngineError::Configuration(format!(
                "port '{}' of '{}' is already fed by a connector",
                port,
                target.instance_name()
            )));
        }
        self.0.input().create_port(name, interface.spec()?)?;
        graph.interfaces.insert(name.to_string(), interface);
        Ok(())
    }

    /// Exposes `source.port` as the output port `name` of this protocol.
    pub fn set_outerface(&self, name: &str, source: &Arc<Process>, port: &str) -> Result<()> {
        self.check_unlocked()?;
        let mut graph = lock(&self.logic().graph);
        if !graph.contains(source) {
            return Err(EngineError::ProcessNotFound(source.instance_name()));
        }
        if graph.outerfaces.contains_key(name) {
            return Err(EngineError::Configuration(format!(
                "outerface '{}' is already defined",
                name
            )));
        }
        let outerface = Outerface::new(name, source, port)?;
        self.0.output().create_port(name, outerface.spec()?)?;
        graph.outerfaces.insert(name.to_string(), outerface);
        Ok(())
    }

    pub fn get_process(&self, name: &str) -> Result<Arc<Process>> {
        lock(&self.logic().graph)
            .processes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ProcessNotFound(name.to_string()))
    }

    pub fn processes(&self) -> BTreeMap<String, Arc<Process>> {
        lock(&self.logic().graph).processes.clone()
    }

    pub fn connectors(&self) -> Vec<Connector> {
        lock(&self.logic().graph).connectors.clone()
    }

    pub fn interfaces(&self) -> Vec<Interface> {
        lock(&self.logic().graph).interfaces.values().cloned().collect()
    }

    pub fn outerfaces(&self) -> Vec<Outerface> {
        lock(&self.logic().graph).outerfaces.values().cloned().collect()
    }

    pub fn is_child(&self, process: &Process) -> bool {
        lock(&self.logic().graph).contains(process)
    }

    pub fn is_interfaced_with(&self, process: &Process) -> bool {
        self.logic().is_interfaced_with(process)
    }

    pub fn is_outerfaced_with(&self, process: &Process) -> bool {
        self.logic().is_outerfaced_with(process)
    }

    pub fn all_children_finished(&self) -> bool {
        self.logic().all_children_finished()
    }

    /// Locks the structure once the graph validates without errors.
    pub fn mark_validated(&self) -> Result<()> {
        let result = self.validate();
        result.log_summary();
        if !result.is_safe() {
            return Err(EngineError::Graph(result.errors().join("; ")));
        }
        self.logic().is_validated.store(true, Ordering::SeqCst);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn collect_records(&self, records: &mut Vec<Record>) {
        for child in self.logic().children() {
            match child.as_protocol() {
                Some(sub) => sub.collect_records(records),
                None => {
                    records.push(child.to_record());
                    records.push(child.config_record());
                }
            }
        }
        records.push(self.0.to_record());
        records.push(self.0.config_record());
    }

    fn mark_configs_saved(&self) {
        for child in self.logic().children() {
            match child.as_protocol() {
                Some(sub) => sub.mark_configs_saved(),
                None => child.mark_config_saved(),
            }
        }
        self.0.mark_config_saved();
    }

    /// Saves every descendant and the protocol graph in one transaction.
    ///
    /// The first successful save records a CREATE activity.
    pub async fn save(&self) -> Result<()> {
        let mut records = Vec::new();
        self.collect_records(&mut records);
        self.0
            .lab()
            .store()
            .save_all(records)
            .await
            .map_err(|err| EngineError::save_failed(format!("protocol '{}'", self.0.uri()), err))?;
        self.mark_configs_saved();

        if !self.logic().is_saved.swap(true, Ordering::SeqCst) {
            Activity::record(self.0.lab(), ActivityType::Create, "protocol", self.0.uri(), None).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Protocol").field(&self.0).finish()
    }
}
