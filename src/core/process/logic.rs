use super::Process;
use crate::core::AsAny;
use crate::core::config::ConfigSpecs;
use crate::core::error::Result;
use crate::core::io::PortSpecs;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Defines the behaviour of a process type.
///
/// Implementors declare their ports and parameters, and provide the `task`
/// body. The engine handles readiness, job bookkeeping, persistence and
/// propagation around it.
///
/// ```rust,no_run
/// use alembic::prelude::*;
///
/// #[derive(Default)]
/// struct Double;
///
/// #[async_trait]
/// impl ProcessLogic for Double {
///     fn type_name(&self) -> &'static str {
///         "Double"
///     }
///
///     async fn task(&self, process: &Arc<Process>) -> Result<()> {
///         let _params = process.params();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ProcessLogic: AsAny + Send + Sync + 'static {
    /// Stable key used in graph dumps and by the [`ProcessRegistry`](super::ProcessRegistry).
    fn type_name(&self) -> &'static str;

    fn title(&self) -> String {
        self.type_name().to_string()
    }

    fn description(&self) -> String {
        String::new()
    }

    fn input_specs(&self) -> PortSpecs {
        PortSpecs::new()
    }

    fn output_specs(&self) -> PortSpecs {
        PortSpecs::new()
    }

    fn config_specs(&self) -> ConfigSpecs {
        ConfigSpecs::new()
    }

    /// Whether every instance of this type shares one persisted row.
    fn is_singleton(&self) -> bool {
        true
    }

    /// The provenance snapshot stored (compressed) on every job.
    ///
    /// Defaults to the declared contract of the type.
    fn source(&self) -> Value {
        let ports = |specs: PortSpecs| -> Value {
            Value::Object(
                specs
                    .into_iter()
                    .map(|(name, spec)| (name, spec.to_json()))
                    .collect::<Map<String, Value>>(),
            )
        };
        json!({
            "type": self.type_name(),
            "title": self.title(),
            "description": self.description(),
            "input_specs": ports(self.input_specs()),
            "output_specs": ports(self.output_specs()),
            "config_specs": self.config_specs(),
        })
    }

    /// Last-moment veto: returning `false` skips the run without error.
    fn check_before_task(&self, _process: &Process) -> bool {
        true
    }

    async fn task(&self, _process: &Arc<Process>) -> Result<()> {
        Ok(())
    }

}
