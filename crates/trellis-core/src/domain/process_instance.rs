//! The process-instance aggregate
//!
//! A `ProcessInstance` owns the live node-instance arena, the scope tree,
//! and the signal-bus listener table. All state transitions go through it:
//! node instances are triggered, completed and cancelled by id, and
//! suspension is always a control return followed by a later `signal`.
//!
//! State transitions are not internally synchronized; callers serialize
//! access so one worker owns an instance at a time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bindings;
use super::definition::{
    NodeId, NodeKind, ProcessDefinition, ProcessId, CONNECTION_DEFAULT,
};
use super::events::{
    NodeInstanceCancelled, NodeInstanceCompleted, NodeInstanceTriggered, ProcessEvent,
    ProcessInstanceAborted, ProcessInstanceCompleted, ProcessInstanceStarted,
};
use super::node_instance::{
    Container, NodeInstance, NodeInstanceId, NodeInstanceKind, NodeInstanceState, RuleTaskState,
};
use super::variable_scope::{ScopeId, ScopeSet};
use crate::error::EngineError;
use crate::runtime::ExecutionContext;

/// Value object: process instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessInstanceId(pub String);

/// Process instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Running or suspended on signals
    Active,

    /// Terminated normally
    Completed,

    /// Terminated by an unhandled error or an explicit abort
    Aborted,
}

/// Aggregate: one live execution of a process definition
pub struct ProcessInstance {
    /// Unique identifier
    pub id: ProcessInstanceId,

    /// Current lifecycle state
    pub state: ProcessState,

    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) context: Arc<ExecutionContext>,
    pub(crate) nodes: HashMap<NodeInstanceId, NodeInstance>,
    pub(crate) scopes: ScopeSet,
    pub(crate) root_scope: ScopeId,
    pub(crate) listeners: HashMap<String, Vec<NodeInstanceId>>,
    started: bool,
    abort_error: Option<EngineError>,
    events: Vec<Box<dyn ProcessEvent>>,
}

impl std::fmt::Debug for ProcessInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInstance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("nodes", &self.nodes)
            .field("scopes", &self.scopes)
            .field("root_scope", &self.root_scope)
            .field("listeners", &self.listeners)
            .field("started", &self.started)
            .field("abort_error", &self.abort_error)
            .field("events", &self.events)
            .finish()
    }
}

/// Serializable snapshot of a process instance for checkpoint/restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    /// Instance identifier
    pub id: ProcessInstanceId,

    /// Definition the instance runs
    pub definition_id: ProcessId,

    /// Lifecycle state
    pub state: ProcessState,

    /// Whether `start` already ran
    pub started: bool,

    /// The live node instances
    pub nodes: Vec<NodeInstance>,

    /// The scope tree
    pub scopes: ScopeSet,

    /// The root scope id
    pub root_scope: ScopeId,

    /// The signal-bus listener table
    pub listeners: HashMap<String, Vec<NodeInstanceId>>,
}

impl ProcessInstance {
    /// Create a new instance of a definition with the given root-scope
    /// inputs. The execution context carries every collaborator the
    /// instance may call.
    pub fn new(
        definition: Arc<ProcessDefinition>,
        context: Arc<ExecutionContext>,
        inputs: Map<String, Value>,
    ) -> Self {
        let mut scopes = ScopeSet::new();
        let root_scope = scopes.new_scope(None, definition.variables.clone());
        for (name, value) in inputs {
            scopes.set_local(&root_scope, &name, value);
        }

        Self {
            id: ProcessInstanceId(Uuid::new_v4().to_string()),
            state: ProcessState::Active,
            definition,
            context,
            nodes: HashMap::new(),
            scopes,
            root_scope,
            listeners: HashMap::new(),
            started: false,
            abort_error: None,
            events: Vec::new(),
        }
    }

    /// Start the instance by triggering every start node
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::Configuration(format!(
                "Process instance {} was already started",
                self.id.0
            )));
        }
        self.started = true;

        self.record_event(Box::new(ProcessInstanceStarted {
            process_instance_id: self.id.clone(),
            definition_id: self.definition.id.0.clone(),
            timestamp: Utc::now(),
        }));

        let starts: Vec<NodeId> = self
            .definition
            .start_nodes()
            .iter()
            .map(|n| n.id.clone())
            .collect();
        if starts.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Process definition {} has no start node",
                self.definition.id.0
            )));
        }

        let root = self.root_scope.clone();
        for node_id in starts {
            self.trigger_node(&node_id, Container::Process, root.clone(), CONNECTION_DEFAULT)?;
        }
        Ok(())
    }

    /// Deliver a signal to every node instance listening on `event_type`
    pub fn signal(&mut self, event_type: &str, payload: Value) -> Result<(), EngineError> {
        if self.state != ProcessState::Active {
            warn!(
                process_instance_id = %self.id.0,
                event_type,
                "Ignoring signal for inactive process instance"
            );
            return Ok(());
        }

        let ids = self
            .listeners
            .get(event_type)
            .cloned()
            .unwrap_or_default();
        for id in ids {
            // A signal can arrive after the listener was cancelled; the
            // state tag check makes that a no-op instead of a race
            let live = self
                .nodes
                .get(&id)
                .map(|n| n.state == NodeInstanceState::Active)
                .unwrap_or(false);
            if !live {
                warn!(
                    node_instance_id = %id.0,
                    event_type,
                    "Dropping signal for node instance no longer active"
                );
                self.remove_listener(event_type, &id);
                continue;
            }

            let is_wait = matches!(self.nodes[&id].kind, NodeInstanceKind::Wait { .. });
            if is_wait {
                self.resume_wait_node(&id, event_type, &payload)?;
            } else if matches!(self.nodes[&id].kind, NodeInstanceKind::RuleTask(_)) {
                self.on_rule_task_signal(&id, event_type)?;
            }
        }
        Ok(())
    }

    /// Abort the instance, cancelling every live node instance
    pub fn abort(&mut self) {
        if self.state != ProcessState::Active {
            return;
        }
        self.state = ProcessState::Aborted;
        self.record_event(Box::new(ProcessInstanceAborted {
            process_instance_id: self.id.clone(),
            error: "aborted by host".to_string(),
            timestamp: Utc::now(),
        }));
        self.cancel_all_live();
    }

    /// The error that aborted this instance, if any
    pub fn abort_error(&self) -> Option<&EngineError> {
        self.abort_error.as_ref()
    }

    /// Read a variable from the root scope
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.scopes.lookup(&self.root_scope, name)
    }

    /// The root scope id
    pub fn root_scope(&self) -> &ScopeId {
        &self.root_scope
    }

    /// Number of live node instances
    pub fn live_node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The live node instances
    pub fn live_nodes(&self) -> impl Iterator<Item = &NodeInstance> {
        self.nodes.values()
    }

    /// Whether any listener is registered for an event type
    pub fn has_listener(&self, event_type: &str) -> bool {
        self.listeners
            .get(event_type)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    /// Event types with at least one registered listener
    pub fn listener_events(&self) -> Vec<&str> {
        self.listeners
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(event, _)| event.as_str())
            .collect()
    }

    /// Register a node instance as listener on an event type
    pub fn add_listener(&mut self, event_type: &str, id: &NodeInstanceId) {
        let ids = self.listeners.entry(event_type.to_string()).or_default();
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }

    /// Deregister a node instance from an event type
    pub fn remove_listener(&mut self, event_type: &str, id: &NodeInstanceId) {
        if let Some(ids) = self.listeners.get_mut(event_type) {
            ids.retain(|candidate| candidate != id);
            if ids.is_empty() {
                self.listeners.remove(event_type);
            }
        }
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn ProcessEvent>) {
        self.events.push(event);
    }

    /// Get and clear all recorded events
    pub fn take_events(&mut self) -> Vec<Box<dyn ProcessEvent>> {
        std::mem::take(&mut self.events)
    }

    /// Produce a serializable snapshot of the live state
    pub fn checkpoint(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.id.clone(),
            definition_id: self.definition.id.clone(),
            state: self.state,
            started: self.started,
            nodes: self.nodes.values().cloned().collect(),
            scopes: self.scopes.clone(),
            root_scope: self.root_scope.clone(),
            listeners: self.listeners.clone(),
        }
    }

    /// Rebuild a live instance from a snapshot.
    ///
    /// Fact handles are re-acquired against the rule session: every
    /// persisted handle must still identify a live fact, otherwise the
    /// restore fails instead of fabricating state.
    pub fn restore(
        definition: Arc<ProcessDefinition>,
        context: Arc<ExecutionContext>,
        snapshot: ProcessSnapshot,
    ) -> Result<Self, EngineError> {
        if definition.id != snapshot.definition_id {
            return Err(EngineError::Configuration(format!(
                "Snapshot of process {} cannot restore against definition {}",
                snapshot.definition_id.0, definition.id.0
            )));
        }

        let mut nodes = HashMap::new();
        for node in snapshot.nodes {
            if let NodeInstanceKind::RuleTask(RuleTaskState { fact_handles, .. }) = &node.kind {
                for (key, handle) in fact_handles {
                    if context.rule_session.get_object(handle).is_none() {
                        return Err(EngineError::Configuration(format!(
                            "Fact for binding {} is no longer in the rule session",
                            key
                        )));
                    }
                }
            }
            nodes.insert(node.id.clone(), node);
        }

        Ok(Self {
            id: snapshot.id,
            state: snapshot.state,
            definition,
            context,
            nodes,
            scopes: snapshot.scopes,
            root_scope: snapshot.root_scope,
            listeners: snapshot.listeners,
            started: snapshot.started,
            abort_error: None,
            events: Vec::new(),
        })
    }

    // --- internal plumbing ---------------------------------------------

    /// Create and enter a node instance. The entry either completes the
    /// instance inline or leaves it suspended on a signal; errors are
    /// routed through the exception scopes.
    pub(crate) fn trigger_node(
        &mut self,
        node_id: &NodeId,
        container: Container,
        scope: ScopeId,
        connection_type: &str,
    ) -> Result<NodeInstanceId, EngineError> {
        let id = self.create_node_instance(node_id, container, scope)?;
        self.activate_node(&id, connection_type)?;
        Ok(id)
    }

    /// First phase of a trigger: put a pending instance into the arena.
    /// Containers record the new id before `activate_node` runs, so an
    /// inline completion always finds its owner.
    pub(crate) fn create_node_instance(
        &mut self,
        node_id: &NodeId,
        container: Container,
        scope: ScopeId,
    ) -> Result<NodeInstanceId, EngineError> {
        let node_def = self.definition.node(node_id).ok_or_else(|| {
            EngineError::Configuration(format!("Unknown node definition: {}", node_id.0))
        })?;
        let kind = match &node_def.kind {
            NodeKind::Wait(wait) => NodeInstanceKind::Wait {
                event: wait.event.clone(),
            },
            NodeKind::RuleTask(_) => NodeInstanceKind::RuleTask(RuleTaskState::default()),
            NodeKind::ForEach(_) => {
                NodeInstanceKind::ForEach(super::node_instance::ForEachState::default())
            }
            _ => NodeInstanceKind::Simple,
        };

        let instance = NodeInstance::new(node_id.clone(), container, scope, kind);
        let id = instance.id.clone();
        debug!(
            process_instance_id = %self.id.0,
            node_instance_id = %id.0,
            node_id = %node_id.0,
            "Triggering node instance"
        );
        self.nodes.insert(id.clone(), instance);
        self.record_event(Box::new(NodeInstanceTriggered {
            process_instance_id: self.id.clone(),
            node_instance_id: id.clone(),
            node_id: node_id.clone(),
            timestamp: Utc::now(),
        }));
        Ok(id)
    }

    /// Second phase of a trigger: enter the instance, routing any failure
    /// through the exception scopes.
    pub(crate) fn activate_node(
        &mut self,
        id: &NodeInstanceId,
        connection_type: &str,
    ) -> Result<(), EngineError> {
        if let Err(error) = self.enter_node(id, connection_type) {
            self.handle_error(id, error)?;
        }
        Ok(())
    }

    /// Whether a node instance is still present and active; the resumption
    /// points check this instead of trusting container membership
    pub(crate) fn node_is_active(&self, id: &NodeInstanceId) -> bool {
        self.nodes
            .get(id)
            .map(|n| n.state == NodeInstanceState::Active)
            .unwrap_or(false)
    }

    fn enter_node(
        &mut self,
        id: &NodeInstanceId,
        connection_type: &str,
    ) -> Result<(), EngineError> {
        let (node_id, scope) = {
            let instance = &self.nodes[id];
            (instance.node_id.clone(), instance.scope.clone())
        };
        let node_def = self
            .definition
            .node(&node_id)
            .ok_or_else(|| {
                EngineError::Configuration(format!("Unknown node definition: {}", node_id.0))
            })?
            .clone();

        if !node_def.accepts_incoming(connection_type) {
            return Err(EngineError::Configuration(format!(
                "A {} node only accepts {} incoming connections, got {}",
                node_def.name, CONNECTION_DEFAULT, connection_type
            )));
        }

        if let Some(instance) = self.nodes.get_mut(id) {
            instance.state = NodeInstanceState::Active;
        }

        match node_def.kind {
            NodeKind::Start => self.complete_node(id, CONNECTION_DEFAULT),
            NodeKind::End => {
                self.complete_node(id, CONNECTION_DEFAULT)?;
                self.complete_process()
            }
            NodeKind::Script(script) => {
                let context = bindings::scope_context(&self.scopes, &scope);
                let value = self.context.expressions.eval(&script.expression, &context)?;
                if let Some(target) = &script.target {
                    if !self.scopes.set_variable(&scope, target, value.clone()) {
                        self.scopes.set_local(&scope, target, value);
                    }
                }
                self.complete_node(id, CONNECTION_DEFAULT)
            }
            NodeKind::Wait(wait) => {
                let ctx = Arc::clone(&self.context);
                let resolved = bindings::resolve_parameter(
                    &self.scopes,
                    &scope,
                    &ctx,
                    &Value::String(wait.event.clone()),
                );
                let event = resolved.as_str().unwrap_or(&wait.event).to_string();
                if let Some(instance) = self.nodes.get_mut(id) {
                    instance.kind = NodeInstanceKind::Wait {
                        event: event.clone(),
                    };
                }
                self.add_listener(&event, id);
                debug!(
                    node_instance_id = %id.0,
                    event = %event,
                    "Node instance suspended on signal"
                );
                Ok(())
            }
            NodeKind::RuleTask(_) => self.trigger_rule_task(id),
            NodeKind::ForEach(_) => self.trigger_for_each(id),
        }
    }

    fn resume_wait_node(
        &mut self,
        id: &NodeInstanceId,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), EngineError> {
        let (node_id, scope) = {
            let instance = &self.nodes[id];
            (instance.node_id.clone(), instance.scope.clone())
        };
        self.remove_listener(event_type, id);

        let target = match self.definition.node(&node_id).map(|n| &n.kind) {
            Some(NodeKind::Wait(wait)) => wait.target.clone(),
            _ => None,
        };
        if let Some(target) = target {
            if !self
                .scopes
                .set_variable(&scope, &target, payload.clone())
            {
                self.scopes.set_local(&scope, &target, payload.clone());
            }
        }
        self.complete_node(id, CONNECTION_DEFAULT)
    }

    /// Exit path of the state machine: remove the instance from its
    /// container, then propagate along every outgoing connection tagged
    /// with `connection_type`.
    ///
    /// The instance must still be present and active; a completion landing
    /// after an external cancellation is a logged no-op, which is what
    /// prevents double-propagation races.
    pub(crate) fn complete_node(
        &mut self,
        id: &NodeInstanceId,
        connection_type: &str,
    ) -> Result<(), EngineError> {
        if !self.node_is_active(id) {
            warn!(
                node_instance_id = %id.0,
                "Ignoring completion for node instance no longer in its container"
            );
            return Ok(());
        }

        let Some(instance) = self.nodes.remove(id) else {
            return Ok(());
        };
        self.drop_listeners_of(id);
        self.record_event(Box::new(NodeInstanceCompleted {
            process_instance_id: self.id.clone(),
            node_instance_id: id.clone(),
            node_id: instance.node_id.clone(),
            timestamp: Utc::now(),
        }));
        debug!(
            process_instance_id = %self.id.0,
            node_instance_id = %id.0,
            node_id = %instance.node_id.0,
            "Node instance completed"
        );

        match instance.container {
            Container::Process => {
                let definition = Arc::clone(&self.definition);
                let targets: Vec<NodeId> = definition
                    .outgoing(&instance.node_id, connection_type)
                    .iter()
                    .map(|c| c.to.clone())
                    .collect();
                for target in targets {
                    if self.state != ProcessState::Active {
                        break;
                    }
                    self.trigger_node(
                        &target,
                        Container::Process,
                        instance.scope.clone(),
                        connection_type,
                    )?;
                }
                Ok(())
            }
            Container::Node(parent) => self.on_child_body_completed(&parent, id),
        }
    }

    /// Cancel a node instance; idempotent, and a no-op for instances
    /// already removed from their container.
    pub(crate) fn cancel_node(&mut self, id: &NodeInstanceId) -> Result<(), EngineError> {
        let live = self.nodes.get(id).map(NodeInstance::is_live).unwrap_or(false);
        if !live {
            return Ok(());
        }

        enum Teardown {
            Listener(String),
            RuleTask,
            ForEach,
            None,
        }
        let teardown = match &self.nodes[id].kind {
            NodeInstanceKind::Wait { event } => Teardown::Listener(event.clone()),
            NodeInstanceKind::RuleTask(_) => Teardown::RuleTask,
            NodeInstanceKind::ForEach(_) => Teardown::ForEach,
            NodeInstanceKind::Simple => Teardown::None,
        };
        match teardown {
            Teardown::Listener(event) => self.remove_listener(&event, id),
            Teardown::RuleTask => self.cancel_rule_task(id)?,
            Teardown::ForEach => self.cancel_for_each_children(id)?,
            Teardown::None => {}
        }

        if let Some(instance) = self.nodes.remove(id) {
            self.drop_listeners_of(id);
            self.record_event(Box::new(NodeInstanceCancelled {
                process_instance_id: self.id.clone(),
                node_instance_id: id.clone(),
                node_id: instance.node_id,
                timestamp: Utc::now(),
            }));
        }
        Ok(())
    }

    pub(crate) fn complete_process(&mut self) -> Result<(), EngineError> {
        if self.state != ProcessState::Active {
            return Ok(());
        }
        self.state = ProcessState::Completed;
        self.record_event(Box::new(ProcessInstanceCompleted {
            process_instance_id: self.id.clone(),
            timestamp: Utc::now(),
        }));
        self.cancel_all_live();
        Ok(())
    }

    fn cancel_all_live(&mut self) {
        let ids: Vec<NodeInstanceId> = self.nodes.keys().cloned().collect();
        for id in ids {
            if let Err(error) = self.cancel_node(&id) {
                warn!(node_instance_id = %id.0, error = %error, "Cancellation failed during teardown");
            }
        }
        self.listeners.clear();
    }

    fn drop_listeners_of(&mut self, id: &NodeInstanceId) {
        self.listeners.retain(|_, ids| {
            ids.retain(|candidate| candidate != id);
            !ids.is_empty()
        });
    }

    /// Route an error through the exception scopes: nearest enclosing scope
    /// matching the thrown type name, else the root cause's type name, else
    /// fatal.
    pub(crate) fn handle_error(
        &mut self,
        id: &NodeInstanceId,
        error: EngineError,
    ) -> Result<(), EngineError> {
        if let Some((handler, scope)) = self.resolve_handler(id, error.type_name()) {
            return self.invoke_handler(id, &handler, scope, &error);
        }

        let root = error.root_cause().clone();
        if root.type_name() != error.type_name() {
            if let Some((handler, scope)) = self.resolve_handler(id, root.type_name()) {
                return self.invoke_handler(id, &handler, scope, &root);
            }
        }

        let fatal = EngineError::RuntimeExecution {
            node_instance_id: id.0.clone(),
            process_instance_id: self.id.0.clone(),
            message: format!("Unable to execute node: {}", error),
            source: Some(Box::new(error)),
        };
        self.state = ProcessState::Aborted;
        self.record_event(Box::new(ProcessInstanceAborted {
            process_instance_id: self.id.clone(),
            error: fatal.to_string(),
            timestamp: Utc::now(),
        }));
        self.cancel_all_live();
        self.abort_error = Some(fatal.clone());
        Err(fatal)
    }

    /// Walk the containment hierarchy outward looking for a handler
    fn resolve_handler(
        &self,
        id: &NodeInstanceId,
        type_name: &str,
    ) -> Option<(NodeId, ScopeId)> {
        let mut current = self.nodes.get(id);
        while let Some(instance) = current {
            match &instance.container {
                Container::Node(parent_id) => {
                    let Some(parent) = self.nodes.get(parent_id) else {
                        break;
                    };
                    if let Some(NodeKind::ForEach(for_each)) =
                        self.definition.node(&parent.node_id).map(|n| &n.kind)
                    {
                        if let Some(handler) = for_each.exception_scope.handler_for(type_name) {
                            return Some((handler.clone(), parent.scope.clone()));
                        }
                    }
                    current = Some(parent);
                }
                Container::Process => {
                    return self
                        .definition
                        .exception_scope
                        .handler_for(type_name)
                        .map(|handler| (handler.clone(), self.root_scope.clone()));
                }
            }
        }
        self.definition
            .exception_scope
            .handler_for(type_name)
            .map(|handler| (handler.clone(), self.root_scope.clone()))
    }

    fn invoke_handler(
        &mut self,
        faulted: &NodeInstanceId,
        handler: &NodeId,
        scope: ScopeId,
        error: &EngineError,
    ) -> Result<(), EngineError> {
        debug!(
            node_instance_id = %faulted.0,
            handler = %handler.0,
            error_type = error.type_name(),
            "Routing error to exception handler"
        );
        self.cancel_node(faulted)?;
        self.scopes.set_local(
            &scope,
            "error",
            serde_json::json!({
                "type": error.type_name(),
                "message": error.to_string(),
            }),
        );
        self.trigger_node(handler, Container::Process, scope, CONNECTION_DEFAULT)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::NodeDefinition;
    use crate::domain::exception_scope::ExceptionScope;
    use crate::domain::variable_scope::VariableDef;
    use crate::runtime::memory::MemoryCollaborators;
    use serde_json::json;

    fn start_script_end() -> ProcessDefinition {
        let start = NodeId::new("start");
        let calc = NodeId::new("calc");
        let end = NodeId::new("end");
        ProcessDefinition::new("p", "p")
            .with_variable(VariableDef::untyped("total"))
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::script("calc", "a", Some("total")))
            .with_node(NodeDefinition::end("end"))
            .connect(&start, &calc)
            .connect(&calc, &end)
    }

    #[test]
    fn test_inline_process_runs_to_completion() {
        let collaborators = MemoryCollaborators::new();
        let mut inputs = Map::new();
        inputs.insert("a".to_string(), json!(21));

        let mut instance = ProcessInstance::new(
            Arc::new(start_script_end()),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(instance.variable("total"), Some(&json!(21)));
        assert_eq!(instance.live_node_count(), 0);
    }

    #[test]
    fn test_start_twice_is_a_configuration_error() {
        let collaborators = MemoryCollaborators::new();
        let mut instance = ProcessInstance::new(
            Arc::new(start_script_end()),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();
        let err = instance.start().unwrap_err();
        assert_eq!(err.type_name(), "ConfigurationError");
    }

    #[test]
    fn test_wait_node_suspends_and_resumes() {
        let start = NodeId::new("start");
        let hold = NodeId::new("hold");
        let end = NodeId::new("end");
        let definition = ProcessDefinition::new("p", "p")
            .with_variable(VariableDef::untyped("answer"))
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::wait("hold", "approval", Some("answer")))
            .with_node(NodeDefinition::end("end"))
            .connect(&start, &hold)
            .connect(&hold, &end);

        let collaborators = MemoryCollaborators::new();
        let mut instance =
            ProcessInstance::new(Arc::new(definition), collaborators.context(), Map::new());
        instance.start().unwrap();

        // Suspended: control returned without completing
        assert_eq!(instance.state, ProcessState::Active);
        assert!(instance.has_listener("approval"));
        assert_eq!(instance.live_node_count(), 1);

        instance.signal("approval", json!("granted")).unwrap();
        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(instance.variable("answer"), Some(&json!("granted")));
        assert!(!instance.has_listener("approval"));
    }

    #[test]
    fn test_signal_after_completion_is_ignored() {
        let collaborators = MemoryCollaborators::new();
        let mut instance = ProcessInstance::new(
            Arc::new(start_script_end()),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();
        assert_eq!(instance.state, ProcessState::Completed);

        instance.signal("whatever", json!(null)).unwrap();
        assert_eq!(instance.state, ProcessState::Completed);
    }

    #[test]
    fn test_abort_cancels_waiting_nodes() {
        let start = NodeId::new("start");
        let hold = NodeId::new("hold");
        let definition = ProcessDefinition::new("p", "p")
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::wait("hold", "never", None))
            .connect(&start, &hold);

        let collaborators = MemoryCollaborators::new();
        let mut instance =
            ProcessInstance::new(Arc::new(definition), collaborators.context(), Map::new());
        instance.start().unwrap();
        assert!(instance.has_listener("never"));

        instance.abort();
        assert_eq!(instance.state, ProcessState::Aborted);
        assert_eq!(instance.live_node_count(), 0);
        assert!(!instance.has_listener("never"));

        // idempotent
        instance.abort();
        assert_eq!(instance.state, ProcessState::Aborted);
    }

    #[test]
    fn test_unhandled_script_error_aborts_with_runtime_execution() {
        let start = NodeId::new("start");
        let boom = NodeId::new("boom");
        let definition = ProcessDefinition::new("p", "p")
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::script("boom", "]]bad[[", None))
            .connect(&start, &boom);

        let collaborators = MemoryCollaborators::new();
        let mut instance =
            ProcessInstance::new(Arc::new(definition), collaborators.context(), Map::new());
        let err = instance.start().unwrap_err();

        match &err {
            EngineError::RuntimeExecution {
                process_instance_id,
                ..
            } => {
                assert_eq!(process_instance_id, &instance.id.0);
            }
            other => panic!("Expected RuntimeExecution, got {:?}", other),
        }
        assert_eq!(instance.state, ProcessState::Aborted);
        assert_eq!(instance.abort_error(), Some(&err));
    }

    #[test]
    fn test_handled_script_error_routes_to_handler() {
        let start = NodeId::new("start");
        let boom = NodeId::new("boom");
        let recover = NodeId::new("recover");
        let end = NodeId::new("end");
        let definition = ProcessDefinition::new("p", "p")
            .with_variable(VariableDef::untyped("handled"))
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::script("boom", "]]bad[[", None))
            .with_node(NodeDefinition::script("recover", "error.type", Some("handled")))
            .with_node(NodeDefinition::end("end"))
            .with_exception_scope(
                ExceptionScope::new().with_handler("ExpressionError", recover.clone()),
            )
            .connect(&start, &boom)
            .connect(&recover, &end);

        let collaborators = MemoryCollaborators::new();
        let mut instance =
            ProcessInstance::new(Arc::new(definition), collaborators.context(), Map::new());
        instance.start().unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(instance.variable("handled"), Some(&json!("ExpressionError")));
    }

    #[test]
    fn test_checkpoint_restore_round_trips_wait_state() {
        let start = NodeId::new("start");
        let hold = NodeId::new("hold");
        let end = NodeId::new("end");
        let definition = Arc::new(
            ProcessDefinition::new("p", "p")
                .with_variable(VariableDef::untyped("answer"))
                .with_node(NodeDefinition::start("start"))
                .with_node(NodeDefinition::wait("hold", "approval", Some("answer")))
                .with_node(NodeDefinition::end("end"))
                .connect(&start, &hold)
                .connect(&hold, &end),
        );

        let collaborators = MemoryCollaborators::new();
        let mut instance = ProcessInstance::new(
            definition.clone(),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();

        let snapshot = instance.checkpoint();
        let serialized = serde_json::to_string(&snapshot).unwrap();
        let deserialized: ProcessSnapshot = serde_json::from_str(&serialized).unwrap();

        let mut restored = ProcessInstance::restore(
            definition,
            collaborators.context(),
            deserialized,
        )
        .unwrap();
        assert_eq!(restored.state, ProcessState::Active);
        assert!(restored.has_listener("approval"));

        restored.signal("approval", json!("late yes")).unwrap();
        assert_eq!(restored.state, ProcessState::Completed);
        assert_eq!(restored.variable("answer"), Some(&json!("late yes")));
    }

    #[test]
    fn test_restore_rejects_wrong_definition() {
        let collaborators = MemoryCollaborators::new();
        let definition = Arc::new(start_script_end());
        let instance = ProcessInstance::new(
            definition,
            collaborators.context(),
            Map::new(),
        );
        let snapshot = instance.checkpoint();

        let other = Arc::new(ProcessDefinition::new("other", "other"));
        let err =
            ProcessInstance::restore(other, collaborators.context(), snapshot).unwrap_err();
        assert_eq!(err.type_name(), "ConfigurationError");
    }

    #[test]
    fn test_events_are_recorded_and_drained() {
        let collaborators = MemoryCollaborators::new();
        let mut instance = ProcessInstance::new(
            Arc::new(start_script_end()),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();

        let events = instance.take_events();
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert!(types.contains(&"process_instance.started"));
        assert!(types.contains(&"node_instance.triggered"));
        assert!(types.contains(&"node_instance.completed"));
        assert!(types.contains(&"process_instance.completed"));
        assert!(instance.take_events().is_empty());
    }
}
