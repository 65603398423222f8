// src/core/catalog/defs.rs

//! Definition payloads for the three catalog kinds, as decoded from child
//! `*/list` responses and stored in per-server caches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool definition as a child advertises it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the call arguments. Must be an object schema to be
    /// admitted into a snapshot.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(
        default,
        rename = "outputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_schema: Option<Value>,
}

/// A prompt definition as a child advertises it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromptDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// A resource definition as a child advertises it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceDef {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// True when a JSON Schema value describes an object: its `type` is
/// `"object"` or a type array containing `"object"`.
pub fn schema_is_object(schema: &Value) -> bool {
    let Some(obj) = schema.as_object() else {
        return false;
    };
    match obj.get("type") {
        Some(Value::String(t)) => t == "object",
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some("object")),
        // Schemas without an explicit type are rejected; the router cannot
        // validate arguments against them.
        _ => false,
    }
}

impl ToolDef {
    /// Whether this definition may enter a snapshot: non-empty name, object
    /// input schema, and (if present) an object output schema.
    pub fn is_admissible(&self) -> bool {
        if self.name.is_empty() || !schema_is_object(&self.input_schema) {
            return false;
        }
        match &self.output_schema {
            Some(schema) => schema_is_object(schema),
            None => true,
        }
    }
}
