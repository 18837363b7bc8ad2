use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One named sub-procedure in a structured registry record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryProcedure {
    #[serde(default)]
    pub performed: bool,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl RegistryProcedure {
    pub fn performed() -> Self {
        Self { performed: true, details: Map::new() }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.details.get(key), Some(Value::Bool(true)))
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.details
            .get(key)
            .and_then(Value::as_str)
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
    }

    pub fn count(&self, key: &str) -> Option<usize> {
        self.details.get(key).and_then(Value::as_u64).map(|count| count as usize)
    }

    /// Distinct uppercase entries of a string-list detail (lobes, stations).
    pub fn distinct(&self, key: &str) -> BTreeSet<String> {
        self.details
            .get(key)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(|item| item.trim().to_ascii_uppercase())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

/// Structured procedure registry: sub-procedure name to its record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryRecord {
    pub procedures: BTreeMap<String, RegistryProcedure>,
}

impl RegistryRecord {
    pub fn with(mut self, name: &str, procedure: RegistryProcedure) -> Self {
        self.procedures.insert(name.to_string(), procedure);
        self
    }

    pub fn performed(&self, name: &str) -> Option<&RegistryProcedure> {
        self.procedures.get(name).filter(|procedure| procedure.performed)
    }
}
