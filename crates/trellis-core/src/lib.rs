//!
//! Trellis Core - Core process execution engine for the Trellis Platform
//!
//! This crate defines the node-instance execution state machine at the heart
//! of the engine: process instances advance node to node on completion
//! events and external signals, delegating rule and decision work to
//! pluggable collaborators. Suspension is always a control return, never a
//! blocked thread; callers serialize access so one worker owns a process
//! instance at a time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - core application logic
pub mod application;

/// Collaborator contracts and the execution context
pub mod runtime;

/// Error types
pub mod error;

// Re-export key types
pub use error::EngineError;

// Re-export main API types for easy use
pub use application::engine_service::{
    LoggingEventHandler, NoopEventHandler, ProcessEngineService, ProcessEventHandler,
};
pub use domain::definition::{
    Assignment, Connection, DataAssociation, ForEachDescriptor, ForEachNode, NodeDefinition,
    NodeId, NodeKind, ProcessDefinition, ProcessId, RuleTaskNode, RuleType, ScriptNode,
    Transformation, WaitNode, CONNECTION_DEFAULT,
};
pub use domain::data_type::{DataType, EnumType, ObjectType, UNKNOWN_TYPE_NAME};
pub use domain::events::ProcessEvent;
pub use domain::node_instance::{
    Container, NodeInstance, NodeInstanceId, NodeInstanceKind, NodeInstanceState,
};
pub use domain::process_instance::{
    ProcessInstance, ProcessInstanceId, ProcessSnapshot, ProcessState,
};
pub use domain::variable_scope::{ScopeId, VariableDef, VariableScopeInstance};
pub use runtime::{
    DecisionEvaluator, DecisionOutcome, ExecutionContext, ExpressionEvaluator, FactHandle,
    JmespathEvaluator, JsonTypeConversionRegistry, RuleScheduler, RuleSession, RuleUnitRunner,
    TransformationRegistry, TypeConversionRegistry, TypeRegistry, DEFAULT_FIRE_LIMIT,
};
