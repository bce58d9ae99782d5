#![forbid(unsafe_code)]

//! Registered entity schemas: a small JSON-Schema subset checked on every state write.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl JsonType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub json_type: Option<JsonType>,
    #[serde(default)]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(rename = "x-lix-key")]
    pub key: String,
    #[serde(rename = "x-lix-version")]
    pub version: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", default = "default_true")]
    pub additional_properties: bool,
}

impl SchemaDefinition {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: true,
        }
    }

    pub fn property(mut self, name: impl Into<String>, json_type: JsonType) -> Self {
        self.properties.insert(
            name.into(),
            PropertySchema {
                json_type: Some(json_type),
                nullable: false,
            },
        );
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn closed(mut self) -> Self {
        self.additional_properties = false;
        self
    }

    pub fn from_json(value: &Value) -> Result<Self, SchemaError> {
        let definition: Self = serde_json::from_value(value.clone())
            .map_err(|err| SchemaError::InvalidDefinition(err.to_string()))?;
        definition.check_definition()?;
        Ok(definition)
    }

    fn check_definition(&self) -> Result<(), SchemaError> {
        if self.key.trim().is_empty() {
            return Err(SchemaError::InvalidDefinition(
                "x-lix-key must not be empty".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(SchemaError::InvalidDefinition(
                "x-lix-version must not be empty".to_string(),
            ));
        }
        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !self.additional_properties && !self.properties.contains_key(*name))
        {
            return Err(SchemaError::InvalidDefinition(format!(
                "required property {missing} is not declared"
            )));
        }
        Ok(())
    }

    /// Checks a snapshot value against this definition. Snapshots are always JSON objects.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        self.check_definition()?;
        let Some(object) = value.as_object() else {
            return Err(SchemaError::NotAnObject);
        };
        for name in &self.required {
            if !object.contains_key(name) {
                return Err(SchemaError::MissingProperty(name.clone()));
            }
        }
        for (name, field) in object {
            let Some(property) = self.properties.get(name) else {
                if self.additional_properties {
                    continue;
                }
                return Err(SchemaError::UnexpectedProperty(name.clone()));
            };
            if field.is_null() {
                if property.nullable {
                    continue;
                }
                return Err(SchemaError::NullNotAllowed(name.clone()));
            }
            match property.json_type {
                Some(expected) if !expected.matches(field) => {
                    return Err(SchemaError::TypeMismatch {
                        property: name.clone(),
                        expected,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaError {
    InvalidDefinition(String),
    NotAnObject,
    MissingProperty(String),
    UnexpectedProperty(String),
    NullNotAllowed(String),
    TypeMismatch { property: String, expected: JsonType },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDefinition(reason) => write!(f, "invalid schema definition: {reason}"),
            Self::NotAnObject => f.write_str("snapshot must be a JSON object"),
            Self::MissingProperty(name) => write!(f, "missing required property {name}"),
            Self::UnexpectedProperty(name) => write!(f, "property {name} is not allowed"),
            Self::NullNotAllowed(name) => write!(f, "property {name} must not be null"),
            Self::TypeMismatch { property, expected } => {
                write!(f, "property {property} must be of type {}", expected.as_str())
            }
        }
    }
}

impl std::error::Error for SchemaError {}
