//! Runtime node instances
//!
//! A `NodeInstance` is one live activation of a static node definition. It
//! lives in the owning process instance's arena, belongs to exactly one
//! container, and carries the kind-specific runtime state that must survive
//! checkpoint/restore.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::NodeId;
use super::variable_scope::ScopeId;
use crate::runtime::FactHandle;

/// Value object: node instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstanceId(pub String);

impl NodeInstanceId {
    pub(crate) fn generate() -> Self {
        NodeInstanceId(Uuid::new_v4().to_string())
    }
}

/// Node instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeInstanceState {
    /// Created but not yet entered
    Pending,

    /// Entered; either executing inline or suspended on a signal
    Active,

    /// Exited normally
    Completed,

    /// Exited by cancellation
    Cancelled,
}

/// The container a node instance belongs to; exactly one at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    /// Directly owned by the process instance
    Process,

    /// Owned by a container node instance (a loop child body)
    Node(NodeInstanceId),
}

/// One runtime activation of a node definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Unique identifier
    pub id: NodeInstanceId,

    /// The node definition this activates (lookup only, never owned)
    pub node_id: NodeId,

    /// Owning container
    pub container: Container,

    /// Nearest enclosing variable scope
    pub scope: ScopeId,

    /// Lifecycle state
    pub state: NodeInstanceState,

    /// Kind-specific runtime state
    pub kind: NodeInstanceKind,
}

impl NodeInstance {
    /// Create a pending instance of a node definition
    pub fn new(node_id: NodeId, container: Container, scope: ScopeId, kind: NodeInstanceKind) -> Self {
        Self {
            id: NodeInstanceId::generate(),
            node_id,
            container,
            scope,
            state: NodeInstanceState::Pending,
            kind,
        }
    }

    /// Whether the instance may still transition
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            NodeInstanceState::Pending | NodeInstanceState::Active
        )
    }
}

/// Kind-specific runtime state of a node instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeInstanceKind {
    /// Start, end and script nodes carry no extra state
    Simple,

    /// A wait node listening on a signal
    Wait {
        /// The signal name the instance listens on
        event: String,
    },

    /// A rule task
    RuleTask(RuleTaskState),

    /// A fan-out/fan-in loop
    ForEach(ForEachState),
}

/// Runtime state of a rule-task instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTaskState {
    /// The resolved rule-flow group, in RuleFlowGroup mode
    pub rule_flow_group: Option<String>,

    /// Qualified binding-name → fact handle; populated only between fact
    /// insertion and retraction in RuleFlowGroup mode
    pub fact_handles: HashMap<String, FactHandle>,
}

/// Runtime state of a loop instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForEachState {
    /// Child sub-process instances, index-addressed in input order
    pub children: Vec<ChildSlot>,

    /// Per-child outputs, aligned to input order
    pub accumulator: Vec<Option<Value>>,
}

impl ForEachState {
    /// How many children have completed
    pub fn completed_count(&self) -> usize {
        self.children
            .iter()
            .filter(|c| c.status == ChildStatus::Completed)
            .count()
    }

    /// Whether every child reached a terminal status
    pub fn all_settled(&self) -> bool {
        self.children
            .iter()
            .all(|c| matches!(c.status, ChildStatus::Completed | ChildStatus::Cancelled))
    }

    /// Whether every child has been started
    pub fn all_started(&self) -> bool {
        self.children
            .iter()
            .all(|c| c.status != ChildStatus::NotStarted)
    }

    /// The slot owning a body instance, if any
    pub fn slot_of_body(&self, body: &NodeInstanceId) -> Option<usize> {
        self.children
            .iter()
            .position(|c| c.body.as_ref() == Some(body))
    }
}

/// One spawned child of a loop instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSlot {
    /// Fixed position of the bound collection element
    pub index: usize,

    /// The child's composite variable scope
    pub scope: ScopeId,

    /// The live body node instance, once started
    pub body: Option<NodeInstanceId>,

    /// Child lifecycle status
    pub status: ChildStatus,
}

/// Lifecycle status of one loop child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildStatus {
    /// Instantiated but not started (sequential mode)
    NotStarted,

    /// Body instance is live
    Running,

    /// Body completed and the output was accumulated
    Completed,

    /// Cancelled before completion
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_is_pending() {
        let mut scope_ids = crate::domain::variable_scope::ScopeSet::new();
        let scope = scope_ids.new_scope(None, vec![]);
        let instance = NodeInstance::new(
            NodeId::new("task"),
            Container::Process,
            scope,
            NodeInstanceKind::Simple,
        );

        assert_eq!(instance.state, NodeInstanceState::Pending);
        assert!(instance.is_live());
        assert!(!instance.id.0.is_empty());
    }

    #[test]
    fn test_terminal_states_are_not_live() {
        let mut scope_ids = crate::domain::variable_scope::ScopeSet::new();
        let scope = scope_ids.new_scope(None, vec![]);
        let mut instance = NodeInstance::new(
            NodeId::new("task"),
            Container::Process,
            scope,
            NodeInstanceKind::Simple,
        );

        instance.state = NodeInstanceState::Completed;
        assert!(!instance.is_live());
        instance.state = NodeInstanceState::Cancelled;
        assert!(!instance.is_live());
    }

    #[test]
    fn test_for_each_state_counters() {
        let mut scope_ids = crate::domain::variable_scope::ScopeSet::new();
        let scope = scope_ids.new_scope(None, vec![]);
        let body = NodeInstanceId::generate();
        let state = ForEachState {
            children: vec![
                ChildSlot {
                    index: 0,
                    scope: scope.clone(),
                    body: Some(body.clone()),
                    status: ChildStatus::Completed,
                },
                ChildSlot {
                    index: 1,
                    scope: scope.clone(),
                    body: None,
                    status: ChildStatus::Running,
                },
                ChildSlot {
                    index: 2,
                    scope,
                    body: None,
                    status: ChildStatus::NotStarted,
                },
            ],
            accumulator: vec![None, None, None],
        };

        assert_eq!(state.completed_count(), 1);
        assert!(!state.all_settled());
        assert!(!state.all_started());
        assert_eq!(state.slot_of_body(&body), Some(0));
    }

    #[test]
    fn test_rule_task_state_round_trips() {
        let mut state = RuleTaskState {
            rule_flow_group: Some("approvals".to_string()),
            fact_handles: HashMap::new(),
        };
        state
            .fact_handles
            .insert("approvals_p1_order".to_string(), FactHandle(7));

        let serialized = serde_json::to_string(&state).unwrap();
        let restored: RuleTaskState = serde_json::from_str(&serialized).unwrap();
        assert_eq!(restored.rule_flow_group.as_deref(), Some("approvals"));
        assert_eq!(
            restored.fact_handles.get("approvals_p1_order"),
            Some(&FactHandle(7))
        );
    }
}
