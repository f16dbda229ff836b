//! The execution unit of the engine.
//!
//! A [`Process`] is always handled through an `Arc`: ports of other processes
//! point back to it weakly, and its run future must be `'static` so that
//! fan-out can launch every downstream run at once.

pub mod events;
pub mod logic;
pub mod registry;

pub use events::{Event, Observable};
pub use logic::ProcessLogic;
pub use registry::{ProcessFactory, ProcessRegistry};

use crate::core::config::Config;
use crate::core::error::{EngineError, Result};
use crate::core::io::{Input, Output, Port, Side};
use crate::core::job::Job;
use crate::core::lock;
use crate::core::protocol::{Protocol, ProtocolLogic};
use crate::core::resource::Resource;
use crate::lab::Lab;
use crate::store::{Record, RecordKind, new_uri};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Default, Clone, Copy)]
struct RunState {
    is_running: bool,
    is_finished: bool,
}

pub struct Process {
    lab: Arc<Lab>,
    uri: String,
    instance_name: Mutex<String>,
    input: Input,
    output: Output,
    config: Mutex<Config>,
    state: Mutex<RunState>,
    job: Mutex<Option<Arc<Job>>>,
    parent: Mutex<Weak<Process>>,
    events: Observable<Process>,
    behaviour: Box<dyn ProcessLogic>,
}

impl Process {
    pub(crate) fn build(lab: &Arc<Lab>, uri: String, behaviour: Box<dyn ProcessLogic>) -> Result<Arc<Self>> {
        let input = Input::new();
        for (name, spec) in behaviour.input_specs() {
            input.create_port(&name, spec)?;
        }
        let output = Output::new();
        for (name, spec) in behaviour.output_specs() {
            output.create_port(&name, spec)?;
        }
        let config = Config::new(behaviour.config_specs())?;

        Ok(Arc::new(Self {
            lab: Arc::clone(lab),
            uri,
            instance_name: Mutex::new(behaviour.type_name().to_string()),
            input,
            output,
            config: Mutex::new(config),
            state: Mutex::new(RunState::default()),
            job: Mutex::new(None),
            parent: Mutex::new(Weak::new()),
            events: Observable::new(),
            behaviour,
        }))
    }

    /// Creates a process with the given behaviour.
    ///
    /// Singleton types reuse the persisted row of their type; the first
    /// instance of a type is persisted on construction.
    pub async fn create<L: ProcessLogic>(lab: &Arc<Lab>, logic: L) -> Result<Arc<Self>> {
        Self::create_boxed(lab, Box::new(logic)).await
    }

    pub(crate) async fn create_boxed(lab: &Arc<Lab>, behaviour: Box<dyn ProcessLogic>) -> Result<Arc<Self>> {
        let type_name = behaviour.type_name();
        if behaviour.is_singleton() {
            if let Some(uri) = lab.singleton_uri(type_name).await? {
                return Self::build(lab, uri, behaviour);
            }
        }

        let process = Self::build(lab, new_uri(), behaviour)?;
        process.save().await?;
        if process.behaviour.is_singleton() {
            lab.remember_singleton(type_name, process.uri());
        }
        Ok(process)
    }

    /// Rebuilds an in-memory instance of a persisted process.
    pub async fn load(lab: &Arc<Lab>, uri: &str) -> Result<Arc<Self>> {
        let record = lab
            .store()
            .get_by_uri(RecordKind::Process, uri)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound(uri.to_string()))?;
        let factory = lab.registry().factory(record.str_field("type"))?;
        Self::build(lab, uri.to_string(), factory())
    }

    pub async fn save(&self) -> Result<()> {
        self.lab
            .store()
            .save(self.to_record())
            .await
            .map_err(|err| EngineError::save_failed(format!("process '{}'", self.uri), err))
    }

    // ------------------------------------------------------------------
    // Identity and structure
    // ------------------------------------------------------------------

    pub fn lab(&self) -> &Arc<Lab> {
        &self.lab
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn type_name(&self) -> &'static str {
        self.behaviour.type_name()
    }

    pub fn title(&self) -> String {
        self.behaviour.title()
    }

    pub fn description(&self) -> String {
        self.behaviour.description()
    }

    pub fn behaviour(&self) -> &dyn ProcessLogic {
        self.behaviour.as_ref()
    }

    /// The name of this instance inside its parent protocol.
    pub fn instance_name(&self) -> String {
        lock(&self.instance_name).clone()
    }

    pub(crate) fn set_instance_name(&self, name: &str) {
        *lock(&self.instance_name) = name.to_string();
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        lock(&self.parent).upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Process>) {
        *lock(&self.parent) = Arc::downgrade(parent);
    }

    pub fn events(&self) -> &Observable<Process> {
        &self.events
    }

    pub fn input(&self) -> &Input {
        &self.input
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn in_port(&self, name: &str) -> Result<Arc<Port>> {
        self.input.port(name).ok_or_else(|| self.port_not_found(Side::Input, name))
    }

    pub fn out_port(&self, name: &str) -> Result<Arc<Port>> {
        self.output.port(name).ok_or_else(|| self.port_not_found(Side::Output, name))
    }

    fn port_not_found(&self, side: Side, name: &str) -> EngineError {
        EngineError::PortNotFound {
            process: self.instance_name(),
            side: side.as_str(),
            port: name.to_string(),
        }
    }

    /// Feeds an input port by hand. Rejected while the process runs.
    pub fn set_input(&self, name: &str, resource: Arc<Resource>) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::Configuration(format!(
                "cannot set input '{}' of '{}' while it is running",
                name,
                self.instance_name()
            )));
        }
        self.in_port(name)?.set_resource(Some(resource))
    }

    /// The resource held by an input port, for task bodies.
    pub fn input_resource(&self, name: &str) -> Result<Arc<Resource>> {
        self.in_port(name)?.resource().ok_or_else(|| {
            EngineError::task(self.instance_name(), format!("input '{}' is empty", name))
        })
    }

    pub fn output_resource(&self, name: &str) -> Option<Arc<Resource>> {
        self.output.resource(name)
    }

    pub fn set_output(&self, name: &str, resource: Resource) -> Result<()> {
        self.out_port(name)?.set_resource(Some(Arc::new(resource)))
    }

    /// The processes directly fed by this one.
    pub fn next_processes(&self) -> Vec<Arc<Process>> {
        self.output.next_processes()
    }

    /// True when no output port feeds anything.
    pub fn is_sink(&self) -> bool {
        self.output.is_sink()
    }

    /// The composite view of this process, when it is a protocol.
    pub fn as_protocol(self: &Arc<Self>) -> Option<Protocol> {
        self.protocol_logic().map(|_| Protocol::wrap(Arc::clone(self)))
    }

    pub(crate) fn protocol_logic(&self) -> Option<&ProtocolLogic> {
        self.behaviour().as_any().downcast_ref::<ProtocolLogic>()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn get_param(&self, name: &str) -> Result<Value> {
        lock(&self.config).get_param(name)
    }

    pub fn get_f64(&self, name: &str) -> Result<f64> {
        let value = self.get_param(name)?;
        value.as_f64().ok_or_else(|| EngineError::InvalidParameter {
            name: name.to_string(),
            reason: format!("{} is not a number", value),
        })
    }

    pub fn get_str(&self, name: &str) -> Result<String> {
        let value = self.get_param(name)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::InvalidParameter {
                name: name.to_string(),
                reason: format!("{} is not a string", value),
            })
    }

    pub fn set_param(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        lock(&self.config).set_param(name, value)
    }

    pub fn set_params(&self, params: &Map<String, Value>) -> Result<()> {
        lock(&self.config).set_params(params)
    }

    /// Params merged with their defaults.
    pub fn params(&self) -> Map<String, Value> {
        lock(&self.config).params()
    }

    pub fn config_uri(&self) -> String {
        lock(&self.config).uri().to_string()
    }

    pub fn config_json(&self, bare: bool) -> Value {
        lock(&self.config).to_json(bare)
    }

    pub(crate) fn config_record(&self) -> Record {
        lock(&self.config).to_record()
    }

    pub(crate) fn mark_config_saved(&self) {
        lock(&self.config).mark_saved();
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_running
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.state).is_finished
    }

    /// Not started, not finished, and every mandatory input filled.
    pub fn is_ready(&self) -> bool {
        let state = *lock(&self.state);
        !state.is_running && !state.is_finished && self.input.is_ready()
    }

    /// The current job, created on first access.
    pub fn job(self: &Arc<Self>) -> Arc<Job> {
        let mut slot = lock(&self.job);
        Arc::clone(slot.get_or_insert_with(|| Arc::new(Job::new(self))))
    }

    /// Reattaches a persisted job. A finished job marks the process finished.
    pub(crate) fn restore_job(&self, job: Job) {
        if job.is_finished() {
            lock(&self.state).is_finished = true;
        }
        *lock(&self.job) = Some(Arc::new(job));
    }

    /// Reports task progress on the current job. See [`Job::update_progress`].
    pub async fn update_progress(self: &Arc<Self>, value: f64, message: &str) -> Result<bool> {
        self.job().update_progress(value, Some(message)).await
    }

    /// Binds this process (and, for protocols, every descendant) to an experiment.
    pub(crate) fn set_experiment(self: &Arc<Self>, experiment_uri: &str) {
        self.job().set_experiment(experiment_uri);
        if let Some(protocol) = self.protocol_logic() {
            for child in protocol.children() {
                child.set_experiment(experiment_uri);
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs the process if it is ready.
    ///
    /// The task body runs at most once per job: the claim on the running
    /// flag is taken atomically, so concurrent triggers are no-ops.
    pub fn run(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        async move { this.run_inner().await }.boxed()
    }

    async fn run_inner(self: Arc<Self>) -> Result<()> {
        if !self.is_ready() || !self.behaviour.check_before_task(&self) {
            return Ok(());
        }
        if !self.run_before_task().await? {
            return Ok(());
        }
        self.behaviour.task(&self).await?;
        self.run_after_task().await
    }

    /// Claims the run, starts the progress bar, saves the job and fires the
    /// start event. Returns `false` when the process was already claimed.
    async fn run_before_task(self: &Arc<Self>) -> Result<bool> {
        if let Some(protocol) = self.protocol_logic() {
            if self.is_running() || self.is_finished() {
                return Ok(false);
            }
            protocol.set_inputs(self)?;
            let job = self.job();
            job.refresh(self);
            if job.experiment_uri().is_none() {
                return Err(EngineError::MissingExperiment(self.instance_name()));
            }
        }

        {
            let mut state = lock(&self.state);
            if state.is_running || state.is_finished {
                return Ok(false);
            }
            state.is_running = true;
        }

        let job = self.job();
        job.refresh(self);
        job.track_inputs(self);
        job.start_progress()?;
        log::info!(
            "Process '{}' ({}) started, job '{}'",
            self.instance_name(),
            self.type_name(),
            job.uri()
        );
        job.save(self).await?;
        self.events.fire(Event::Start, self).await?;
        Ok(true)
    }

    /// Finishes the run: saves the job and outputs, fires the end event, then
    /// propagates to the next processes when every output is ready.
    ///
    /// Protocols finish only once all their children finished; any earlier
    /// call is a no-op, and so is every call after the first finish.
    pub(crate) fn run_after_task(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        async move { this.finish().await }.boxed()
    }

    async fn finish(self: Arc<Self>) -> Result<()> {
        if let Some(protocol) = self.protocol_logic() {
            if !protocol.all_children_finished() {
                return Ok(());
            }
        }
        {
            let mut state = lock(&self.state);
            if !state.is_running || state.is_finished {
                return Ok(());
            }
            state.is_running = false;
            state.is_finished = true;
        }
        if let Some(protocol) = self.protocol_logic() {
            protocol.set_outputs(&self)?;
        }

        let job = self.job();
        job.stop_progress();
        let experiment_uri = job.experiment_uri();
        for resource in self.output.resources().into_values().flatten() {
            resource.bind(job.uri(), experiment_uri.as_deref());
        }
        job.save(&self).await?;
        log::info!(
            "Process '{}' ({}) finished, job '{}'",
            self.instance_name(),
            self.type_name(),
            job.uri()
        );
        self.events.fire(Event::End, &self).await?;

        if self.output.is_ready() {
            self.run_next_processes().await?;
        }
        Ok(())
    }

    /// Propagates outputs, then launches every next process and waits for all
    /// of them. The first error is returned once every branch settled.
    async fn run_next_processes(&self) -> Result<()> {
        self.output.propagate()?;
        let next = self.next_processes();
        let results = join_all(next.iter().map(|process| process.run())).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    fn data(&self, bare: bool) -> Value {
        match self.protocol_logic() {
            Some(protocol) => json!({"graph": protocol.dumps(self, bare)}),
            None => json!({}),
        }
    }

    /// The node representation used in graph dumps.
    pub fn to_json(&self, bare: bool) -> Value {
        json!({
            "uri": if bare { "" } else { self.uri.as_str() },
            "type": self.type_name(),
            "title": self.title(),
            "data": self.data(bare),
            "config": self.config_json(bare),
        })
    }

    pub(crate) fn to_record(&self) -> Record {
        Record::new(
            RecordKind::Process,
            self.uri.clone(),
            json!({
                "type": self.type_name(),
                "title": self.title(),
                "description": self.description(),
                "input_specs": self.input.specs_json(),
                "output_specs": self.output.specs_json(),
                "data": self.data(false),
            }),
        )
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *lock(&self.state);
        f.debug_struct("Process")
            .field("uri", &self.uri)
            .field("type", &self.type_name())
            .field("instance_name", &self.instance_name())
            .field("is_running", &state.is_running)
            .field("is_finished", &state.is_finished)
            .finish()
    }
}
