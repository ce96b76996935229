use chrono::{DateTime, Utc};
use std::fmt::Debug;

use super::definition::NodeId;
use super::node_instance::NodeInstanceId;
use super::process_instance::ProcessInstanceId;

/// Domain event trait for all events raised by a process instance
pub trait ProcessEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the process instance ID this event is associated with
    fn process_instance_id(&self) -> &ProcessInstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Event: process instance started
#[derive(Debug)]
pub struct ProcessInstanceStarted {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The identifier of the process definition
    pub definition_id: String,

    /// The timestamp when the process instance started
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent for ProcessInstanceStarted {
    fn event_type(&self) -> &'static str {
        "process_instance.started"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: process instance completed
#[derive(Debug)]
pub struct ProcessInstanceCompleted {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The timestamp when the process instance completed
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent for ProcessInstanceCompleted {
    fn event_type(&self) -> &'static str {
        "process_instance.completed"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: process instance aborted
#[derive(Debug)]
pub struct ProcessInstanceAborted {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// Why the instance aborted
    pub error: String,

    /// The timestamp when the process instance aborted
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent for ProcessInstanceAborted {
    fn event_type(&self) -> &'static str {
        "process_instance.aborted"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: node instance triggered
#[derive(Debug)]
pub struct NodeInstanceTriggered {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The node instance that was triggered
    pub node_instance_id: NodeInstanceId,

    /// The node definition it activates
    pub node_id: NodeId,

    /// The timestamp when the node instance was triggered
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent for NodeInstanceTriggered {
    fn event_type(&self) -> &'static str {
        "node_instance.triggered"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: node instance completed
#[derive(Debug)]
pub struct NodeInstanceCompleted {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The node instance that completed
    pub node_instance_id: NodeInstanceId,

    /// The node definition it activated
    pub node_id: NodeId,

    /// The timestamp when the node instance completed
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent for NodeInstanceCompleted {
    fn event_type(&self) -> &'static str {
        "node_instance.completed"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: node instance cancelled
#[derive(Debug)]
pub struct NodeInstanceCancelled {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The node instance that was cancelled
    pub node_instance_id: NodeInstanceId,

    /// The node definition it activated
    pub node_id: NodeId,

    /// The timestamp when the node instance was cancelled
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent for NodeInstanceCancelled {
    fn event_type(&self) -> &'static str {
        "node_instance.cancelled"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
