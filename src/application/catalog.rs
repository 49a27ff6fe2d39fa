//! Tool catalog adapter: MCP tool descriptors to OpenAI function specs.

use crate::domain::types::ToolDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// One entry of the function-calling catalog sent to the model, serialized
/// as `{"type":"function","function":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    #[serde(rename = "type")]
    pub spec_type: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: ParameterObject,
}

/// JSON-schema-shaped `parameters` object built from a descriptor's input
/// schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterObject {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: BTreeMap<String, ParameterSpec>,
    pub required: Vec<String>,
}

/// A single parameter schema, validated into a tagged kind at adapt time so
/// malformed descriptors fail here instead of travelling untyped through the
/// resolution loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterKind {
    String {
        #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
        allowed: Option<Vec<String>>,
    },
    Number,
    Integer,
    Boolean,
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Box<ParameterSpec>>,
    },
    Object {
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        properties: BTreeMap<String, ParameterSpec>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        required: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("tool '{tool}' property '{property}' has an unsupported schema: {source}")]
    InvalidSchema {
        tool: String,
        property: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convert the advertised tool descriptors into the function-calling catalog.
///
/// Pure and deterministic: output preserves descriptor order and length, and
/// re-adapting the same descriptors yields structurally identical specs.
pub fn adapt(descriptors: &[ToolDescriptor]) -> Result<Vec<FunctionSpec>, CatalogError> {
    descriptors.iter().map(adapt_one).collect()
}

fn adapt_one(descriptor: &ToolDescriptor) -> Result<FunctionSpec, CatalogError> {
    let mut properties = BTreeMap::new();
    for (property, schema) in &descriptor.input_schema.properties {
        let spec: ParameterSpec =
            serde_json::from_value(schema.clone()).map_err(|source| CatalogError::InvalidSchema {
                tool: descriptor.name.clone(),
                property: property.clone(),
                source,
            })?;
        properties.insert(property.clone(), spec);
    }

    debug!(
        tool = descriptor.name.as_str(),
        parameters = properties.len(),
        "Adapted tool descriptor to function spec"
    );

    Ok(FunctionSpec {
        spec_type: "function".to_string(),
        function: FunctionDef {
            name: descriptor.name.clone(),
            description: descriptor.description.clone().unwrap_or_default(),
            parameters: ParameterObject {
                schema_type: "object".to_string(),
                properties,
                required: descriptor.input_schema.required.clone(),
            },
        },
    })
}
