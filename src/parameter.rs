//! Parameter values and pipeline-node configuration.
//!
//! Protocol parameters, entity properties, and pipeline-node configuration
//! maps all carry the same small set of scalar value types. The persistor
//! writes each variant as a natively-typed HDF5 attribute, so the set is
//! deliberately closed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A scalar parameter or property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// The configuration of one hardware-pipeline node, as a named bag of
/// scalar settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfiguration {
    pub name: String,
    pub parameters: BTreeMap<String, PropertyValue>,
}

impl NodeConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// A contiguous interval of a stimulus or response during which the
/// pipeline-node configuration was constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpan {
    pub duration: Duration,
    pub nodes: Vec<NodeConfiguration>,
}

impl ConfigurationSpan {
    pub fn new(duration: Duration, nodes: Vec<NodeConfiguration>) -> Self {
        Self { duration, nodes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_value_conversions() {
        assert_eq!(PropertyValue::from(true), PropertyValue::Bool(true));
        assert_eq!(PropertyValue::from(3i64), PropertyValue::Int(3));
        assert_eq!(PropertyValue::from(0.5), PropertyValue::Float(0.5));
        assert_eq!(
            PropertyValue::from("gain"),
            PropertyValue::Text("gain".to_string())
        );
    }

    #[test]
    fn test_node_configuration_builder() {
        let node = NodeConfiguration::new("amplifier")
            .with_parameter("gain", 20i64)
            .with_parameter("mode", "voltage-clamp");
        assert_eq!(node.name, "amplifier");
        assert_eq!(node.parameters.len(), 2);
        assert_eq!(
            node.parameters["mode"],
            PropertyValue::Text("voltage-clamp".to_string())
        );
    }
}
