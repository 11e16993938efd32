//! Infrastructure state snapshots and their persisted form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Version written into every serialized state envelope.
pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    Managed,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub mode: ResourceMode,
    #[serde(rename = "type")]
    pub ty: String,
    pub name: String,
    pub attributes: Map<String, Value>,
}

impl ResourceInstance {
    pub fn address(&self) -> String {
        match self.mode {
            ResourceMode::Managed => format!("{}.{}", self.ty, self.name),
            ResourceMode::Data => format!("data.{}.{}", self.ty, self.name),
        }
    }
}

/// Snapshot of the infrastructure a module manages.
///
/// Resources are keyed by address (`type.name` or `data.type.name`).
/// `module_outputs` holds values of nested module calls. They are transient and
/// are not written to the persisted form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub resources: BTreeMap<String, ResourceInstance>,
    pub outputs: BTreeMap<String, Value>,
    #[serde(skip)]
    pub module_outputs: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to serialize state")]
    Write(#[source] serde_json::Error),
    #[error("failed to deserialize state")]
    Read(#[source] serde_json::Error),
    #[error("unsupported state format version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    state: &'a State,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    state: State,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// No resources and no outputs of any kind.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.outputs.is_empty() && self.module_outputs.is_empty()
    }

    pub fn has_managed_resources(&self) -> bool {
        self.resources
            .values()
            .any(|instance| instance.mode == ResourceMode::Managed)
    }

    pub fn managed(&self) -> impl Iterator<Item = &ResourceInstance> {
        self.resources
            .values()
            .filter(|instance| instance.mode == ResourceMode::Managed)
    }

    /// A copy holding only managed resource instances.
    pub fn managed_only(&self) -> State {
        State {
            resources: self
                .resources
                .iter()
                .filter(|(_, instance)| instance.mode == ResourceMode::Managed)
                .map(|(addr, instance)| (addr.clone(), instance.clone()))
                .collect(),
            outputs: BTreeMap::new(),
            module_outputs: BTreeMap::new(),
        }
    }

    /// Root outputs as an object, the value a later run sees as `run.<name>`.
    pub fn outputs_object(&self) -> Value {
        Value::Object(
            self.outputs
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }

    /// Instances of `mode` grouped as `{ type: { name: attributes } }`.
    pub fn resources_object(&self, mode: ResourceMode) -> Value {
        let mut by_type: Map<String, Value> = Map::new();
        for instance in self.resources.values().filter(|inst| inst.mode == mode) {
            let entry = by_type
                .entry(instance.ty.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(names) = entry {
                names.insert(
                    instance.name.clone(),
                    Value::Object(instance.attributes.clone()),
                );
            }
        }
        Value::Object(by_type)
    }
}

pub fn write_state(state: &State) -> Result<String, StateError> {
    serde_json::to_string_pretty(&EnvelopeRef {
        version: STATE_FORMAT_VERSION,
        state,
    })
    .map_err(StateError::Write)
}

pub fn read_state(raw: &str) -> Result<State, StateError> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(StateError::Read)?;
    if envelope.version != STATE_FORMAT_VERSION {
        return Err(StateError::Version {
            found: envelope.version,
            expected: STATE_FORMAT_VERSION,
        });
    }
    Ok(envelope.state)
}

/// Serialize then deserialize, reproducing what persistence drops.
pub fn normalize(state: &State) -> Result<State, StateError> {
    read_state(&write_state(state)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(mode: ResourceMode, ty: &str, name: &str) -> ResourceInstance {
        ResourceInstance {
            mode,
            ty: ty.to_string(),
            name: name.to_string(),
            attributes: Map::from_iter([("id".to_string(), json!(format!("{ty}-{name}")))]),
        }
    }

    fn sample() -> State {
        let mut state = State::new();
        for inst in [
            instance(ResourceMode::Managed, "sim_bucket", "main"),
            instance(ResourceMode::Data, "sim_zone", "current"),
        ] {
            state.resources.insert(inst.address(), inst);
        }
        state.outputs.insert("bucket".to_string(), json!("main"));
        state
            .module_outputs
            .insert("child".to_string(), BTreeMap::from([("x".to_string(), json!(1))]));
        state
    }

    #[test]
    fn normalization_keeps_resources_and_prunes_nested_outputs() {
        let state = sample();
        let normalized = normalize(&state).expect("normalize");
        assert_eq!(normalized.resources, state.resources);
        assert_eq!(normalized.outputs, state.outputs);
        assert!(normalized.module_outputs.is_empty());
    }

    #[test]
    fn managed_only_drops_data_sources_and_outputs() {
        let managed = sample().managed_only();
        assert_eq!(
            managed.resources.keys().collect::<Vec<_>>(),
            vec!["sim_bucket.main"]
        );
        assert!(managed.outputs.is_empty());
        assert!(managed.has_managed_resources());
    }

    #[test]
    fn empty_state_reports_empty() {
        let state = State::new();
        assert!(state.is_empty());
        assert!(!state.has_managed_resources());
        assert!(!sample().is_empty());
    }

    #[test]
    fn rejects_unknown_versions() {
        let raw = r#"{"version": 9, "state": {"resources": {}, "outputs": {}}}"#;
        let err = read_state(raw).expect_err("version mismatch");
        assert!(matches!(err, StateError::Version { found: 9, .. }));
    }

    #[test]
    fn resources_object_groups_by_type() {
        let value = sample().resources_object(ResourceMode::Managed);
        assert_eq!(value, json!({"sim_bucket": {"main": {"id": "sim_bucket-main"}}}));
    }
}
