//! Kind string → intent factory / input parser.
//!
//! The registry is built once at startup (see [`Registry::with_builtin_steps`])
//! and handed to the engine by reference. Intents are registered either as
//! [`Exposure::Public`] (flow roots a client may start) or
//! [`Exposure::Internal`] (steps that only exist inside a flow). Asking for an
//! internal kind from client JSON fails exactly like asking for an unknown one,
//! so a client cannot jump into the middle of a flow.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use thiserror::Error;

use super::intent::Intent;
use super::node::{Input, InputPayload};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("invalid data for `{kind}`: {message}")]
    InvalidData { kind: String, message: String },
    #[error("kind already registered: {0}")]
    DuplicateKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    Public,
    Internal,
}

/// Serialized reference to an intent: the root of every stored workflow and
/// every step of a flow definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentSpec {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl IntentSpec {
    #[must_use]
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
        }
    }
}

pub type IntentFactory = fn(&Value) -> Result<Box<dyn Intent>, RegistryError>;
type InputParser = fn(Value) -> Result<(Value, Value), RegistryError>;

struct IntentEntry {
    exposure: Exposure,
    factory: IntentFactory,
}

#[derive(Default)]
pub struct Registry {
    intents: HashMap<String, IntentEntry>,
    inputs: HashMap<String, InputParser>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut intents: Vec<&String> = self.intents.keys().collect();
        intents.sort();
        let mut inputs: Vec<&String> = self.inputs.keys().collect();
        inputs.sort();
        f.debug_struct("Registry")
            .field("intents", &intents)
            .field("inputs", &inputs)
            .finish()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every step shipped in [`super::steps`].
    ///
    /// # Errors
    /// Returns an error if two built-in kinds collide.
    pub fn with_builtin_steps() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        super::steps::register(&mut registry)?;
        Ok(registry)
    }

    /// # Errors
    /// Returns [`RegistryError::DuplicateKind`] if `kind` is taken.
    pub fn register_intent(
        &mut self,
        kind: &str,
        exposure: Exposure,
        factory: IntentFactory,
    ) -> Result<(), RegistryError> {
        if self.intents.contains_key(kind) {
            return Err(RegistryError::DuplicateKind(kind.to_string()));
        }
        self.intents
            .insert(kind.to_string(), IntentEntry { exposure, factory });
        Ok(())
    }

    /// # Errors
    /// Returns [`RegistryError::DuplicateKind`] if `T::KIND` is taken.
    pub fn register_input<T: InputPayload>(&mut self) -> Result<(), RegistryError> {
        if self.inputs.contains_key(T::KIND) {
            return Err(RegistryError::DuplicateKind(T::KIND.to_string()));
        }
        self.inputs.insert(T::KIND.to_string(), parse_input::<T>);
        Ok(())
    }

    /// Instantiate any registered intent. Used for stored specs and nested steps.
    ///
    /// # Errors
    /// Returns an error for unknown kinds or invalid data.
    pub fn instantiate_intent(&self, spec: &IntentSpec) -> Result<Box<dyn Intent>, RegistryError> {
        let entry = self
            .intents
            .get(&spec.kind)
            .ok_or_else(|| RegistryError::UnknownKind(spec.kind.clone()))?;
        (entry.factory)(&spec.data)
    }

    /// Instantiate an intent requested by a client.
    ///
    /// # Errors
    /// Internal kinds are reported as [`RegistryError::UnknownKind`].
    pub fn instantiate_public_intent(
        &self,
        spec: &IntentSpec,
    ) -> Result<Box<dyn Intent>, RegistryError> {
        match self.intents.get(&spec.kind) {
            Some(entry) if entry.exposure == Exposure::Public => (entry.factory)(&spec.data),
            _ => Err(RegistryError::UnknownKind(spec.kind.clone())),
        }
    }

    /// Parse client JSON `{kind, data}` into a validated [`Input`].
    ///
    /// # Errors
    /// Returns an error for unknown kinds or data failing the kind's decoding.
    pub fn instantiate_input(&self, raw: &Value) -> Result<Input, RegistryError> {
        let kind = raw
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| RegistryError::InvalidData {
                kind: String::new(),
                message: "missing `kind`".to_string(),
            })?;
        let parser = self
            .inputs
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))?;
        let data = match raw.get("data") {
            None | Some(Value::Null) => json!({}),
            Some(data) => data.clone(),
        };
        let (data, recorded) = parser(data)?;
        Ok(Input::new(kind.to_string(), data, recorded))
    }

    #[must_use]
    pub fn is_public(&self, kind: &str) -> bool {
        self.intents
            .get(kind)
            .is_some_and(|entry| entry.exposure == Exposure::Public)
    }
}

fn parse_input<T: InputPayload>(data: Value) -> Result<(Value, Value), RegistryError> {
    let invalid = |message: String| RegistryError::InvalidData {
        kind: T::KIND.to_string(),
        message,
    };
    let payload: T = serde_json::from_value(data).map_err(|err| invalid(err.to_string()))?;
    payload.validate().map_err(invalid)?;
    let normalized = serde_json::to_value(&payload).map_err(|err| invalid(err.to_string()))?;
    Ok((normalized, payload.redacted()))
}

/// Decode intent parameters, mapping failures to [`RegistryError::InvalidData`].
///
/// # Errors
/// Returns an error if `data` does not match `T`.
pub fn decode_params<T: serde::de::DeserializeOwned + Default>(
    kind: &str,
    data: &Value,
) -> Result<T, RegistryError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data.clone()).map_err(|err| RegistryError::InvalidData {
        kind: kind.to_string(),
        message: err.to_string(),
    })
}
