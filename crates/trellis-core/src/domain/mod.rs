//! Domain layer - the process execution model and its state machines

/// Data-association evaluation
pub mod bindings;

/// Polymorphic data-type descriptors
pub mod data_type;

/// Static process-definition model
pub mod definition;

/// Domain events
pub mod events;

/// Exception scopes
pub mod exception_scope;

/// Fan-out/fan-in loop node runtime
pub mod for_each;

/// Runtime node instances
pub mod node_instance;

/// The process-instance aggregate
pub mod process_instance;

/// Rule-task node runtime
pub mod rule_task;

/// Variable scopes
pub mod variable_scope;
