//! Process configuration: parameter specs and validated parameter values.

use crate::core::error::{EngineError, Result};
use crate::store::{Record, RecordKind, StoreError, new_uri};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};
use std::collections::BTreeMap;

/// The primitive types a parameter can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Dict,
}

/// Declaration of one configuration parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ParamSpec {
    pub fn new(param_type: ParamType) -> Self {
        Self {
            param_type,
            default: None,
            allowed_values: Vec::new(),
            min: None,
            max: None,
            description: None,
            unit: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_allowed_values<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.allowed_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Validates (and coerces) a value against this spec.
    ///
    /// `null` falls back to the default. Strings are deserialised as JSON when
    /// the declared type is not a string, so `"3"` is a valid `int`.
    pub fn validate(&self, name: &str, value: Value) -> Result<Value> {
        let value = if value.is_null() {
            match &self.default {
                Some(default) => default.clone(),
                None => return Ok(Value::Null),
            }
        } else {
            value
        };

        let invalid = |reason: String| EngineError::InvalidParameter {
            name: name.to_string(),
            reason,
        };

        let value = match self.coerce(&value) {
            Some(v) => v,
            None => match (&value, self.param_type) {
                (Value::String(text), t) if t != ParamType::Str => {
                    let parsed: Value = serde_json::from_str(text).map_err(|err| {
                        invalid(format!("cannot deserialize '{}': {}", text, err))
                    })?;
                    self.coerce(&parsed).ok_or_else(|| {
                        invalid(format!("deserialized value {} is not a {:?}", parsed, t))
                    })?
                }
                _ => {
                    return Err(invalid(format!(
                        "{} is not a valid {:?}",
                        value, self.param_type
                    )));
                }
            },
        };

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(invalid(format!("{} is lower than {}", n, min)));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(invalid(format!("{} is greater than {}", n, max)));
                }
            }
        }

        if !self.allowed_values.is_empty() && !self.allowed_values.iter().any(|a| same_value(a, &value)) {
            return Err(invalid(format!(
                "{} is not allowed (allowed values: {})",
                value,
                Value::Array(self.allowed_values.clone())
            )));
        }

        Ok(value)
    }

    fn coerce(&self, value: &Value) -> Option<Value> {
        match self.param_type {
            ParamType::Bool => value.as_bool().map(Value::Bool),
            ParamType::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
                Value::Number(n) => {
                    let f = n.as_f64()?;
                    (f.fract() == 0.0 && f.is_finite()).then(|| json!(f as i64))
                }
                _ => None,
            },
            ParamType::Float => match value {
                Value::Number(n) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
                _ => None,
            },
            ParamType::Str => value.as_str().map(|s| Value::String(s.to_string())),
            ParamType::List => value.is_array().then(|| value.clone()),
            ParamType::Dict => value.is_object().then(|| value.clone()),
        }
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Parameter specs keyed by name.
pub type ConfigSpecs = BTreeMap<String, ParamSpec>;

/// Builds a spec map from `(name, spec)` pairs.
pub fn config_specs<I, K>(items: I) -> ConfigSpecs
where
    I: IntoIterator<Item = (K, ParamSpec)>,
    K: Into<String>,
{
    items.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// The `{specs, params}` record of one process.
#[derive(Debug, Clone)]
pub struct Config {
    uri: String,
    specs: ConfigSpecs,
    params: Map<String, Value>,
    is_saved: bool,
}

impl Config {
    /// Creates a config, validating every declared default.
    pub fn new(specs: ConfigSpecs) -> Result<Self> {
        let mut checked = ConfigSpecs::new();
        for (name, mut spec) in specs {
            if let Some(default) = spec.default.take() {
                let default = spec.validate(&name, default).map_err(|err| {
                    EngineError::Configuration(format!("invalid default value: {}", err))
                })?;
                spec.default = Some(default);
            }
            checked.insert(name, spec);
        }
        Ok(Self {
            uri: new_uri(),
            specs: checked,
            params: Map::new(),
            is_saved: false,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn specs(&self) -> &ConfigSpecs {
        &self.specs
    }

    pub fn is_saved(&self) -> bool {
        self.is_saved
    }

    /// Replaces the specs (and clears params). Only allowed before the first save.
    pub fn set_specs(&mut self, specs: ConfigSpecs) -> Result<()> {
        if self.is_saved {
            return Err(EngineError::Configuration(
                "cannot alter the specs of a saved config".into(),
            ));
        }
        let fresh = Config::new(specs)?;
        self.specs = fresh.specs;
        self.params.clear();
        Ok(())
    }

    pub fn param_exists(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn get_param(&self, name: &str) -> Result<Value> {
        let spec = self.spec(name)?;
        Ok(self
            .params
            .get(name)
            .cloned()
            .or_else(|| spec.default.clone())
            .unwrap_or(Value::Null))
    }

    pub fn set_param(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = self.spec(name)?.validate(name, value.into())?;
        self.params.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_params(&mut self, params: &Map<String, Value>) -> Result<()> {
        for (name, value) in params {
            self.set_param(name, value.clone())?;
        }
        Ok(())
    }

    /// Explicit params merged over the declared defaults.
    pub fn params(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for (name, spec) in &self.specs {
            if let Some(default) = &spec.default {
                merged.insert(name.clone(), default.clone());
            }
        }
        for (name, value) in &self.params {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Explicitly set params only.
    pub fn raw_params(&self) -> &Map<String, Value> {
        &self.params
    }

    fn spec(&self, name: &str) -> Result<&ParamSpec> {
        self.specs.get(name).ok_or_else(|| EngineError::InvalidParameter {
            name: name.to_string(),
            reason: "parameter does not exist".into(),
        })
    }

    pub(crate) fn mark_saved(&mut self) {
        self.is_saved = true;
    }

    pub fn to_json(&self, bare: bool) -> Value {
        json!({
            "uri": if bare { "" } else { self.uri.as_str() },
            "data": {
                "specs": self.specs,
                "params": self.params,
            }
        })
    }

    pub(crate) fn to_record(&self) -> Record {
        Record::new(RecordKind::Config, self.uri.clone(), self.to_json(false)["data"].clone())
    }

    pub(crate) fn from_record(record: &Record) -> std::result::Result<Self, StoreError> {
        let specs: ConfigSpecs = serde_json::from_value(
            record.body.get("specs").cloned().unwrap_or_else(|| json!({})),
        )?;
        let params = record
            .body
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            uri: record.uri.clone(),
            specs,
            params,
            is_saved: true,
        })
    }
}
