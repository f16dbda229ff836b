//! # Alembic
//!
//! A dataflow engine for scientific protocols: typed processes wired into
//! nested protocols, provenance-tracking jobs, and a single-flight experiment
//! queue, in Rust.
//!
//! ## Features
//!
//! - **Typed Ports**: Resources flow through ports checked against a resource type lattice
//! - **Composable Protocols**: A protocol is a process, so graphs nest as deep as you need
//! - **Provenance by Default**: Every run leaves a job recording its inputs, config and code snapshot
//! - **Single-Flight Queue**: Experiments are admitted one at a time per lab
//! - **Pick-and-choose Philosophy**: The demo robot bricks are feature-gated (`robot`, on by default).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use alembic::prelude::*;
//!
//! #[derive(Default)]
//! struct Hello;
//!
//! #[async_trait]
//! impl ProcessLogic for Hello {
//!     fn type_name(&self) -> &'static str {
//!         "Hello"
//!     }
//!
//!     fn output_specs(&self) -> PortSpecs {
//!         port_specs([("greeting", PortSpec::new(&RESOURCE))])
//!     }
//!
//!     async fn task(&self, process: &Arc<Process>) -> Result<()> {
//!         process.set_output("greeting", Resource::new(&RESOURCE, JsonValue::from("hello")))
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let lab = Lab::in_memory();
//! let protocol = Protocol::new(&lab).await?;
//! protocol.add_process("hello", &Process::create(&lab, Hello).await?)?;
//!
//! let experiment = Experiment::new(&lab, Study::new("Demo"), User::new("ada"), Some(protocol)).await?;
//! experiment.run(experiment.created_by()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`store`]: The identity store contract and the in-memory store
//! - [`lab`]: The context object every engine call is made against
//! - [`robot`]: Demo process types (feature `robot`)
//! - [`prelude`]: Commonly used types and traits (import with `use alembic::prelude::*`)
//! - [`build_prelude`]: Only what is needed to declare process types

// ============================================================================
// Core Module
// ============================================================================

mod core;

pub mod lab;
pub mod store;

// ============================================================================
// Public Re-exports - Granular Imports
// ============================================================================

// Core types
pub use self::core::AsAny;
pub use self::core::error::{EngineError, Result};
pub use self::core::resource::{RESOURCE, Resource, ResourceType};

// Ports and wiring
pub use self::core::io::{
    Connector, Input, Interface, Outerface, Output, Port, PortMap, PortRef, PortSpec, PortSpecs,
    Side, port_specs,
};

// Configuration
pub use self::core::config::{Config, ConfigSpecs, ParamSpec, ParamType, config_specs};

// Processes and protocols
pub use self::core::process::{
    Event, Observable, Process, ProcessFactory, ProcessLogic, ProcessRegistry,
};
pub use self::core::protocol::{
    PROTOCOL_TYPE, Protocol, ProtocolLogic, ValidationIssue, ValidationResult,
};

// Runs
pub use self::core::activity::{Activity, ActivityType};
pub use self::core::experiment::{Experiment, Study, User};
pub use self::core::job::{InputTrace, Job, ProgressBar, ProgressMessage, Upstream};
pub use self::core::queue::{QUEUE_URI, Queue, QueueEntry};

// Context and persistence
pub use lab::{Lab, LabSettings};
pub use store::{MemoryStore, Record, RecordKind, Store, StoreError};

// ============================================================================
// Prelude Modules - Convenient Bulk Imports
// ============================================================================

/// The main prelude: imports everything you need to build and run protocols.
///
/// # Example
/// ```rust
/// use alembic::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        // Core
        EngineError,
        JsonValue,
        RESOURCE,
        Resource,
        ResourceType,
        Result,
        // Ports
        Connector,
        PortSpec,
        PortSpecs,
        port_specs,
        // Config
        ConfigSpecs,
        ParamSpec,
        ParamType,
        config_specs,
        // Processes
        Event,
        Process,
        ProcessLogic,
        ProcessRegistry,
        Protocol,
        ValidationResult,
        // Runs
        Experiment,
        Job,
        Queue,
        QueueEntry,
        Study,
        User,
        // Context
        Lab,
        LabSettings,
        MemoryStore,
        Store,
    };
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}

/// Prelude for crates that only declare process types.
///
/// # Example
/// ```rust
/// use alembic::build_prelude::*;
/// ```
pub mod build_prelude {
    pub use super::{
        ConfigSpecs, EngineError, JsonValue, ParamSpec, ParamType, PortSpec, PortSpecs, Process,
        ProcessLogic, RESOURCE, Resource, ResourceType, Result, config_specs, port_specs,
    };
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}

// ============================================================================
// Robot Feature
// ============================================================================

#[cfg(feature = "robot")]
pub mod robot;

#[cfg(feature = "robot")]
pub use robot::{
    Add, AddOnCreate, Create, Eat, Fly, MEGA_ROBOT, Move, ROBOT, ROBOT_ADD_ON, RobotState, Wait,
};

// ============================================================================
// Re-export commonly used external types for convenience
// ============================================================================

pub use serde_json::Value as JsonValue;

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
