//! Lexically-nested process variable scopes
//!
//! Scopes form a tree: the process root scope at the top, one child scope
//! per loop iteration below it. Lookup walks upward; writes land in the
//! scope that declares (or already holds) the variable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::data_type::DataType;

/// Value object: variable scope instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub String);

impl ScopeId {
    fn generate() -> Self {
        ScopeId(Uuid::new_v4().to_string())
    }
}

/// A declared process variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    /// Variable name
    pub name: String,

    /// Declared data type
    pub data_type: DataType,
}

impl VariableDef {
    /// Declare a variable with an explicit data type
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// Declare a variable of the generic "unknown" type
    pub fn untyped(name: impl Into<String>) -> Self {
        Self::new(name, DataType::any())
    }
}

/// One live scope: declared variables plus the current values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableScopeInstance {
    /// Unique identifier
    pub id: ScopeId,

    /// Enclosing scope, if any
    pub parent: Option<ScopeId>,

    /// Variables declared in this scope
    pub declared: Vec<VariableDef>,

    /// Current variable values
    pub values: HashMap<String, Value>,
}

impl VariableScopeInstance {
    /// Declared type of a variable in this scope, if declared here
    pub fn declared_type(&self, name: &str) -> Option<&DataType> {
        self.declared
            .iter()
            .find(|def| def.name == name)
            .map(|def| &def.data_type)
    }

    fn holds(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.declared_type(name).is_some()
    }
}

/// The scope tree of one process instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSet {
    scopes: HashMap<ScopeId, VariableScopeInstance>,
}

impl ScopeSet {
    /// Create an empty scope tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new scope under `parent` with the given declarations
    pub fn new_scope(&mut self, parent: Option<ScopeId>, declared: Vec<VariableDef>) -> ScopeId {
        let id = ScopeId::generate();
        self.scopes.insert(
            id.clone(),
            VariableScopeInstance {
                id: id.clone(),
                parent,
                declared,
                values: HashMap::new(),
            },
        );
        id
    }

    /// Get a scope by id
    pub fn get(&self, id: &ScopeId) -> Option<&VariableScopeInstance> {
        self.scopes.get(id)
    }

    /// Find the nearest enclosing scope that declares or holds `name`
    pub fn resolve_declaring(&self, from: &ScopeId, name: &str) -> Option<ScopeId> {
        let mut current = Some(from.clone());
        while let Some(id) = current {
            let scope = self.scopes.get(&id)?;
            if scope.holds(name) {
                return Some(id);
            }
            current = scope.parent.clone();
        }
        None
    }

    /// Read a variable, walking up through enclosing scopes
    pub fn lookup(&self, from: &ScopeId, name: &str) -> Option<&Value> {
        let mut current = Some(from.clone());
        while let Some(id) = current {
            let scope = self.scopes.get(&id)?;
            if let Some(value) = scope.values.get(name) {
                return Some(value);
            }
            if scope.declared_type(name).is_some() {
                // Declared but not yet set
                return None;
            }
            current = scope.parent.clone();
        }
        None
    }

    /// Declared type of `name` as seen from a scope, walking upward
    pub fn declared_type(&self, from: &ScopeId, name: &str) -> Option<&DataType> {
        let mut current = Some(from.clone());
        while let Some(id) = current {
            let scope = self.scopes.get(&id)?;
            if let Some(data_type) = scope.declared_type(name) {
                return Some(data_type);
            }
            current = scope.parent.clone();
        }
        None
    }

    /// Write a variable into its declaring scope; returns false when no
    /// enclosing scope knows the name
    pub fn set_variable(&mut self, from: &ScopeId, name: &str, value: Value) -> bool {
        match self.resolve_declaring(from, name) {
            Some(owner) => {
                if let Some(scope) = self.scopes.get_mut(&owner) {
                    scope.values.insert(name.to_string(), value);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Write a variable directly into one scope, regardless of declarations
    pub fn set_local(&mut self, scope: &ScopeId, name: &str, value: Value) {
        if let Some(instance) = self.scopes.get_mut(scope) {
            instance.values.insert(name.to_string(), value);
        }
    }

    /// All variables visible from a scope, inner shadowing outer
    pub fn visible_context(&self, from: &ScopeId) -> Map<String, Value> {
        // Collect the chain leaf-to-root, then apply root-to-leaf so inner
        // values win
        let mut chain = Vec::new();
        let mut current = Some(from.clone());
        while let Some(id) = current {
            match self.scopes.get(&id) {
                Some(scope) => {
                    current = scope.parent.clone();
                    chain.push(scope);
                }
                None => break,
            }
        }

        let mut context = Map::new();
        for scope in chain.into_iter().rev() {
            for (name, value) in &scope.values {
                context.insert(name.clone(), value.clone());
            }
        }
        context
    }
}
