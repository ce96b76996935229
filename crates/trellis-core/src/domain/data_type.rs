//! Polymorphic data-type descriptors for process variables
//!
//! A declared variable carries one of these descriptors. The Object variant
//! stands in for a host class; the Enum variant resolves its label→value
//! table lazily through the pluggable type registry and caches it per
//! loader context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::runtime::{TypeConversionRegistry, TypeRegistry};

/// The generic "unknown" type name; output coercion skips it
pub const UNKNOWN_TYPE_NAME: &str = "any";

const BUILTIN_TYPE_NAMES: &[&str] = &[
    UNKNOWN_TYPE_NAME,
    "string",
    "integer",
    "long",
    "float",
    "double",
    "boolean",
    "object",
    "array",
    "collection",
];

/// Data-type descriptor of a declared process variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    /// A host object type, declared by name
    Object(ObjectType),

    /// An enumeration, declared by name
    Enum(EnumType),
}

impl DataType {
    /// The generic "unknown" object type
    pub fn any() -> Self {
        DataType::Object(ObjectType::new(UNKNOWN_TYPE_NAME))
    }

    /// An object type with the given declared name
    pub fn object(class_name: impl Into<String>) -> Self {
        DataType::Object(ObjectType::new(class_name))
    }

    /// An enum type with the given declared name
    pub fn enumeration(type_name: impl Into<String>) -> Self {
        DataType::Enum(EnumType::new(type_name))
    }

    /// The declared type name
    pub fn declared_type_name(&self) -> &str {
        match self {
            DataType::Object(object) => object.declared_type_name(),
            DataType::Enum(en) => en.declared_type_name(),
        }
    }

    /// Check whether a runtime value is assignable to this type
    pub fn validate(&self, value: &Value, types: &dyn TypeRegistry) -> Result<bool, EngineError> {
        match self {
            DataType::Object(object) => object.validate(value, types),
            DataType::Enum(en) => en.validate(value, types),
        }
    }

    /// Parse a string into a value of this type
    pub fn parse(
        &self,
        text: &str,
        conversions: &dyn TypeConversionRegistry,
        types: &dyn TypeRegistry,
    ) -> Result<Value, EngineError> {
        match self {
            DataType::Object(object) => object.parse(text, conversions, types),
            DataType::Enum(en) => en.parse(text, types),
        }
    }

    /// Serialize a value of this type to its string form
    pub fn serialize(&self, value: &Value) -> String {
        write_value(value)
    }
}

fn write_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Representation of an object datatype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    /// Fully-qualified declared type name
    pub class_name: String,

    /// Optional loader context the name resolves under
    pub loader: Option<String>,
}

impl ObjectType {
    /// Create an object type with no loader context
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            loader: None,
        }
    }

    /// Attach a loader context
    pub fn with_loader(mut self, loader: impl Into<String>) -> Self {
        self.loader = Some(loader.into());
        self
    }

    /// Whether this is the generic "unknown" type
    pub fn is_unknown(&self) -> bool {
        self.class_name == UNKNOWN_TYPE_NAME
    }

    /// The declared type name
    pub fn declared_type_name(&self) -> &str {
        &self.class_name
    }

    /// Check runtime assignability of a JSON value
    pub fn validate(&self, value: &Value, types: &dyn TypeRegistry) -> Result<bool, EngineError> {
        if value.is_null() {
            return Ok(true);
        }
        match self.class_name.as_str() {
            UNKNOWN_TYPE_NAME => Ok(true),
            "string" => Ok(value.is_string()),
            "integer" | "long" => Ok(value.is_i64() || value.is_u64()),
            "float" | "double" => Ok(value.is_number()),
            "boolean" => Ok(value.is_boolean()),
            "object" => Ok(value.is_object()),
            "array" | "collection" => Ok(value.is_array()),
            name => {
                if types.is_object_type(name) {
                    Ok(value.is_object())
                } else {
                    Err(EngineError::TypeResolution(name.to_string()))
                }
            }
        }
    }

    /// Parse a string through the converter registered for this type name
    pub fn parse(
        &self,
        text: &str,
        conversions: &dyn TypeConversionRegistry,
        types: &dyn TypeRegistry,
    ) -> Result<Value, EngineError> {
        if !BUILTIN_TYPE_NAMES.contains(&self.class_name.as_str())
            && !types.is_object_type(&self.class_name)
        {
            return Err(EngineError::TypeResolution(self.class_name.clone()));
        }
        conversions.transform(Value::String(text.to_string()), &self.class_name)
    }
}

/// Representation of an enum datatype.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnumType {
    /// Declared enum type name
    pub type_name: String,

    #[serde(skip)]
    cache: Mutex<HashMap<Option<String>, Arc<Vec<(String, Value)>>>>,
}

impl EnumType {
    /// Create an enum type descriptor
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The declared type name
    pub fn declared_type_name(&self) -> &str {
        &self.type_name
    }

    /// The ordered label→value table, resolved once per loader context and
    /// cached afterwards. The absent-loader entry is the process-wide cache.
    pub fn value_table(
        &self,
        loader: Option<&str>,
        types: &dyn TypeRegistry,
    ) -> Result<Arc<Vec<(String, Value)>>, EngineError> {
        let mut cache = self.cache.lock().expect("enum cache poisoned");
        let key = loader.map(str::to_string);
        if let Some(table) = cache.get(&key) {
            return Ok(table.clone());
        }
        let values = types
            .enum_values(&self.type_name, loader)
            .ok_or_else(|| EngineError::TypeResolution(self.type_name.clone()))?;
        let table = Arc::new(values);
        cache.insert(key, table.clone());
        Ok(table)
    }

    /// Check that the value is a member of the enum
    pub fn validate(&self, value: &Value, types: &dyn TypeRegistry) -> Result<bool, EngineError> {
        if value.is_null() {
            return Ok(true);
        }
        let table = self.value_table(None, types)?;
        Ok(table.iter().any(|(_, candidate)| candidate == value))
    }

    /// Look a label up in the value table; unknown labels read as null
    pub fn parse(&self, label: &str, types: &dyn TypeRegistry) -> Result<Value, EngineError> {
        let table = self.value_table(None, types)?;
        Ok(table
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Null))
    }
}

// The cache is per-descriptor scratch state; a clone starts cold.
impl Clone for EnumType {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl PartialEq for EnumType {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name
    }
}
