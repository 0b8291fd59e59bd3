//! Schema-less message envelope exchanged with the chat server.
//!
//! An [`Envelope`] is an ordered JSON object. Routing uses its type key, which is
//! either the `type` field or the legacy `module` + `action` pair joined as
//! `"module.action"`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

pub const TYPE_FIELD: &str = "type";
pub const MODULE_FIELD: &str = "module";
pub const ACTION_FIELD: &str = "action";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Starts an envelope routed by `type_key`.
    pub fn typed(type_key: impl Into<String>) -> Self {
        Self::new().with(TYPE_FIELD, type_key.into())
    }

    /// Starts an envelope carrying both `type` and `action`.
    pub fn request(type_key: impl Into<String>, action: impl Into<String>) -> Self {
        Self::typed(type_key).with(ACTION_FIELD, action.into())
    }

    /// Returns a copy of the envelope with `key` set to `value`, replacing any
    /// previous value while keeping the field's original position.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&Value, EnvelopeError> {
        self.0
            .get(key)
            .ok_or_else(|| EnvelopeError::MissingField(key.to_string()))
    }

    pub fn str_field(&self, key: &str) -> Result<&str, EnvelopeError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| EnvelopeError::wrong_type(key, "string"))
    }

    pub fn i64_field(&self, key: &str) -> Result<i64, EnvelopeError> {
        self.require(key)?
            .as_i64()
            .ok_or_else(|| EnvelopeError::wrong_type(key, "integer"))
    }

    pub fn bool_field(&self, key: &str) -> Result<bool, EnvelopeError> {
        self.require(key)?
            .as_bool()
            .ok_or_else(|| EnvelopeError::wrong_type(key, "boolean"))
    }

    pub fn array_field(&self, key: &str) -> Result<&Vec<Value>, EnvelopeError> {
        self.require(key)?
            .as_array()
            .ok_or_else(|| EnvelopeError::wrong_type(key, "array"))
    }

    pub fn object_field(&self, key: &str) -> Result<&Map<String, Value>, EnvelopeError> {
        self.require(key)?
            .as_object()
            .ok_or_else(|| EnvelopeError::wrong_type(key, "object"))
    }

    /// Like [`Envelope::str_field`] but treats an absent field as `None`.
    pub fn opt_str(&self, key: &str) -> Result<Option<&str>, EnvelopeError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| EnvelopeError::wrong_type(key, "string")),
        }
    }

    /// Deserializes a single field into a typed value.
    pub fn field_as<T>(&self, key: &str) -> Result<T, EnvelopeError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = self.require(key)?.clone();
        serde_json::from_value(value).map_err(|source| EnvelopeError::Field {
            field: key.to_string(),
            source,
        })
    }

    /// Deserializes the whole envelope into a typed payload.
    pub fn decode_as<T>(&self) -> Result<T, EnvelopeError>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(EnvelopeError::Payload)
    }

    /// Derives the routing key.
    ///
    /// `type` wins when it is a string. Otherwise both `module` and `action` must be
    /// present and be strings.
    pub fn type_key(&self) -> Result<String, EnvelopeError> {
        if let Some(Value::String(type_key)) = self.0.get(TYPE_FIELD) {
            return Ok(type_key.clone());
        }
        if self.contains(MODULE_FIELD) && self.contains(ACTION_FIELD) {
            let module = self.str_field(MODULE_FIELD)?;
            let action = self.str_field(ACTION_FIELD)?;
            return Ok(format!("{module}.{action}"));
        }
        Err(EnvelopeError::MissingType)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(&self.0).map_err(EnvelopeError::Encode)
    }

    /// Decodes one text frame. Anything other than a JSON object is rejected.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        match serde_json::from_str::<Value>(text).map_err(EnvelopeError::Decode)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EnvelopeError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        match serde_json::from_slice::<Value>(bytes).map_err(EnvelopeError::Decode)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EnvelopeError::NotAnObject(json_kind(&other))),
        }
    }
}

impl From<Map<String, Value>> for Envelope {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

impl From<Envelope> for Value {
    fn from(value: Envelope) -> Self {
        Value::Object(value.0)
    }
}

impl TryFrom<Value> for Envelope {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EnvelopeError::NotAnObject(json_kind(&other))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[path = "tests/envelope_tests.rs"]
mod tests;
