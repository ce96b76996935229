//! Exception scopes: handler tables keyed by error type name
//!
//! A scope maps the taxonomy name of an error (`"ConfigurationError"`,
//! `"DecisionEvaluationError"`, …) to the node that handles it. Scopes sit
//! on containers; resolution walks the containment hierarchy outward from
//! the failing node instance, then retries with the error's root cause.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::definition::NodeId;

/// Handler table of one exception scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionScope {
    /// Handler node per exception type name
    pub handlers: HashMap<String, NodeId>,
}

impl ExceptionScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler node for an exception type name
    pub fn with_handler(mut self, type_name: impl Into<String>, handler: NodeId) -> Self {
        self.handlers.insert(type_name.into(), handler);
        self
    }

    /// The handler registered for a type name, if any
    pub fn handler_for(&self, type_name: &str) -> Option<&NodeId> {
        self.handlers.get(type_name)
    }

    /// Whether the scope has no handlers at all
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
