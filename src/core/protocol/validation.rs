use super::Protocol;
use std::sync::Arc;

/// An issue found while validating a protocol graph.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    /// A hard error: a mandatory input port is neither filled nor fed.
    Error(String),
    /// A warning: an output is produced but never consumed.
    Warning(String),
}

/// The result of a validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.issues.push(ValidationIssue::Error(msg.into()));
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.issues.push(ValidationIssue::Warning(msg.into()));
    }

    pub fn is_safe(&self) -> bool {
        !self.issues.iter().any(|i| matches!(i, ValidationIssue::Error(_)))
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| matches!(i, ValidationIssue::Warning(_)))
    }

    pub fn errors(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter_map(|i| match i {
                ValidationIssue::Error(msg) => Some(msg.clone()),
                ValidationIssue::Warning(_) => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter_map(|i| match i {
                ValidationIssue::Warning(msg) => Some(msg.clone()),
                ValidationIssue::Error(_) => None,
            })
            .collect()
    }

    pub fn log_summary(&self) {
        if self.is_safe() && !self.has_warnings() {
            log::info!("Protocol validation passed: every mandatory input is fed.");
            return;
        }
        for issue in &self.issues {
            match issue {
                ValidationIssue::Error(msg) => log::error!("{}", msg),
                ValidationIssue::Warning(msg) => log::warn!("{}", msg),
            }
        }
    }
}

impl Protocol {
    /// Checks the data-flow contract of the graph, recursively.
    ///
    /// The protocol's own interface ports are assumed fed by the caller.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        self.validate_into("", &mut result);
        result
    }

    fn validate_into(&self, prefix: &str, result: &mut ValidationResult) {
        let interfaces = self.interfaces();
        let outerfaces = self.outerfaces();

        for (name, child) in self.processes() {
            let path = format!("{}{}", prefix, name);

            for port in child.input().ports() {
                let interfaced = interfaces
                    .iter()
                    .any(|i| Arc::ptr_eq(i.target(), &child) && i.target_port() == port.name());
                let fed = port.incoming().is_some() || port.is_filled() || interfaced;
                if !port.is_optional() && !fed {
                    result.add_error(format!(
                        "Process '{}' requires input '{}' which nothing feeds.",
                        path,
                        port.name()
                    ));
                }
            }

            for port in child.output().ports() {
                let outerfaced = outerfaces
                    .iter()
                    .any(|o| Arc::ptr_eq(o.source(), &child) && o.source_port() == port.name());
                if !port.is_connected() && !outerfaced {
                    result.add_warning(format!(
                        "Output '{}' of process '{}' is never consumed.",
                        port.name(),
                        path
                    ));
                }
            }

            if let Some(sub) = child.as_protocol() {
                sub.validate_into(&format!("{}.", path), result);
            }
        }
    }
}
