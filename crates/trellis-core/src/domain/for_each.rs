//! Runtime behavior of the fan-out/fan-in loop node
//!
//! The loop instantiates one child per collection element from the fixed
//! split/template/join descriptor. Children run in their own composite
//! scopes; completions rejoin through the owning process instance, which
//! is the synchronization barrier. The accumulator is index-addressed, so
//! output order is deterministic regardless of completion order.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::bindings;
use super::definition::{ForEachNode, NodeKind, CONNECTION_DEFAULT};
use super::node_instance::{
    ChildSlot, ChildStatus, Container, ForEachState, NodeInstanceId, NodeInstanceKind,
};
use super::process_instance::ProcessInstance;
use crate::error::EngineError;
use crate::runtime::expression::is_truthy;

impl ProcessInstance {
    pub(crate) fn trigger_for_each(&mut self, id: &NodeInstanceId) -> Result<(), EngineError> {
        let (node_id, scope) = {
            let instance = &self.nodes[id];
            (instance.node_id.clone(), instance.scope.clone())
        };
        let for_each: ForEachNode = match self.definition.node(&node_id).map(|n| &n.kind) {
            Some(NodeKind::ForEach(for_each)) => for_each.clone(),
            _ => {
                return Err(EngineError::Configuration(format!(
                    "Node {} is not a loop node",
                    node_id.0
                )))
            }
        };

        let ctx = Arc::clone(&self.context);
        let context = bindings::scope_context(&self.scopes, &scope);
        let collection = ctx
            .expressions
            .eval(&for_each.collection_expression, &context)?;
        let items = match collection {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(EngineError::Configuration(format!(
                    "Collection expression {} did not produce a sequence: {}",
                    for_each.collection_expression, other
                )))
            }
        };

        debug!(
            split = %for_each.descriptor.split.0,
            count = items.len(),
            sequential = for_each.sequential,
            "Fanning out loop children"
        );
        if items.is_empty() {
            return self.complete_for_each(id);
        }

        // One composite scope per element, loop variable bound at its
        // fixed index
        let template = &for_each.descriptor.template;
        let mut children = Vec::with_capacity(items.len());
        for (index, element) in items.iter().enumerate() {
            let child_scope = self.scopes.new_scope(
                Some(scope.clone()),
                vec![template.variable.clone(), template.output_variable.clone()],
            );
            self.scopes
                .set_local(&child_scope, &template.variable.name, element.clone());
            children.push(ChildSlot {
                index,
                scope: child_scope,
                body: None,
                status: ChildStatus::NotStarted,
            });
        }
        let count = children.len();
        if let Some(instance) = self.nodes.get_mut(id) {
            instance.kind = NodeInstanceKind::ForEach(ForEachState {
                children,
                accumulator: vec![None; count],
            });
        }

        if for_each.sequential {
            self.start_loop_child(id, 0)?;
        } else {
            for index in 0..count {
                // A child may complete inline and trip the completion
                // condition while the fan-out is still in flight
                if !self.node_is_active(id) {
                    return Ok(());
                }
                self.start_loop_child(id, index)?;
            }
        }

        if !for_each.wait_for_completion && self.node_is_active(id) && self.all_started(id) {
            return self.complete_for_each(id);
        }
        Ok(())
    }

    /// Rejoin point for one child: accumulate its output at the child's
    /// original index, then run the join policy.
    pub(crate) fn on_child_body_completed(
        &mut self,
        parent_id: &NodeInstanceId,
        body_id: &NodeInstanceId,
    ) -> Result<(), EngineError> {
        if !self.node_is_active(parent_id) {
            warn!(
                node_instance_id = %body_id.0,
                "Dropping child completion for a loop instance no longer active"
            );
            return Ok(());
        }
        let (node_id, scope) = {
            let instance = &self.nodes[parent_id];
            (instance.node_id.clone(), instance.scope.clone())
        };
        let for_each: ForEachNode = match self.definition.node(&node_id).map(|n| &n.kind) {
            Some(NodeKind::ForEach(for_each)) => for_each.clone(),
            _ => return Ok(()),
        };

        let slot = match &self.nodes[parent_id].kind {
            NodeInstanceKind::ForEach(state) => state
                .slot_of_body(body_id)
                .map(|index| (index, state.children[index].scope.clone())),
            _ => None,
        };
        let Some((index, child_scope)) = slot else {
            warn!(node_instance_id = %body_id.0, "Completion from an unknown loop child");
            return Ok(());
        };

        let output = self
            .scopes
            .lookup(&child_scope, &for_each.descriptor.template.output_variable.name)
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(instance) = self.nodes.get_mut(parent_id) {
            if let NodeInstanceKind::ForEach(state) = &mut instance.kind {
                state.children[index].status = ChildStatus::Completed;
                state.children[index].body = None;
                state.accumulator[index] = Some(output);
            }
        }
        debug!(
            node_instance_id = %parent_id.0,
            child_index = index,
            "Loop child completed"
        );

        // Join short-circuit: the completion condition is consulted after
        // every single completion, before the all-completed check
        if let Some(condition) = &for_each.completion_condition {
            let ctx = Arc::clone(&self.context);
            let mut condition_context = self.scopes.visible_context(&scope);
            let (completed, total, outputs) = self.loop_progress(parent_id);
            condition_context.insert("completed".to_string(), Value::from(completed));
            condition_context.insert("total".to_string(), Value::from(total));
            condition_context.insert("outputs".to_string(), Value::Array(outputs));
            let verdict = ctx
                .expressions
                .eval(condition, &Value::Object(condition_context))?;
            if is_truthy(&verdict) {
                debug!(
                    node_instance_id = %parent_id.0,
                    completed,
                    "Completion condition met, cancelling remaining children"
                );
                self.cancel_for_each_children(parent_id)?;
                return self.complete_for_each(parent_id);
            }
        }

        if for_each.sequential {
            let next = match &self.nodes[parent_id].kind {
                NodeInstanceKind::ForEach(state) => state
                    .children
                    .iter()
                    .position(|c| c.status == ChildStatus::NotStarted),
                _ => None,
            };
            if let Some(next) = next {
                self.start_loop_child(parent_id, next)?;
            }
        }

        // Starting more children can run the join to completion in a
        // nested frame; re-check before completing here
        if !self.node_is_active(parent_id) {
            return Ok(());
        }
        if !for_each.wait_for_completion && self.all_started(parent_id) {
            return self.complete_for_each(parent_id);
        }
        let all_completed = match &self.nodes[parent_id].kind {
            NodeInstanceKind::ForEach(state) => state
                .children
                .iter()
                .all(|c| c.status == ChildStatus::Completed),
            _ => false,
        };
        if all_completed {
            return self.complete_for_each(parent_id);
        }
        Ok(())
    }

    /// Cancel every live child; idempotent, and also the completion-
    /// condition short-circuit path.
    pub(crate) fn cancel_for_each_children(
        &mut self,
        id: &NodeInstanceId,
    ) -> Result<(), EngineError> {
        let pending: Vec<(usize, Option<NodeInstanceId>)> = match self.nodes.get(id) {
            Some(instance) => match &instance.kind {
                NodeInstanceKind::ForEach(state) => state
                    .children
                    .iter()
                    .filter(|c| {
                        matches!(c.status, ChildStatus::Running | ChildStatus::NotStarted)
                    })
                    .map(|c| (c.index, c.body.clone()))
                    .collect(),
                _ => return Ok(()),
            },
            None => return Ok(()),
        };

        for (index, body) in pending {
            if let Some(body) = body {
                self.cancel_node(&body)?;
            }
            if let Some(instance) = self.nodes.get_mut(id) {
                if let NodeInstanceKind::ForEach(state) = &mut instance.kind {
                    state.children[index].status = ChildStatus::Cancelled;
                    state.children[index].body = None;
                }
            }
        }
        Ok(())
    }

    fn start_loop_child(&mut self, id: &NodeInstanceId, index: usize) -> Result<(), EngineError> {
        let (node_id, child_scope) = {
            let instance = &self.nodes[id];
            let scope = match &instance.kind {
                NodeInstanceKind::ForEach(state) => state.children[index].scope.clone(),
                _ => {
                    return Err(EngineError::Configuration(
                        "Loop child started on a non-loop instance".to_string(),
                    ))
                }
            };
            (instance.node_id.clone(), scope)
        };
        let body_node = match self.definition.node(&node_id).map(|n| &n.kind) {
            Some(NodeKind::ForEach(for_each)) => for_each.descriptor.template.body.clone(),
            _ => {
                return Err(EngineError::Configuration(format!(
                    "Node {} is not a loop node",
                    node_id.0
                )))
            }
        };

        // Record the slot before entering the body: an inline completion
        // must find its owner
        let body_id =
            self.create_node_instance(&body_node, Container::Node(id.clone()), child_scope)?;
        if let Some(instance) = self.nodes.get_mut(id) {
            if let NodeInstanceKind::ForEach(state) = &mut instance.kind {
                state.children[index].body = Some(body_id.clone());
                state.children[index].status = ChildStatus::Running;
            }
        }
        debug!(
            node_instance_id = %id.0,
            child_index = index,
            body_instance_id = %body_id.0,
            "Starting loop child"
        );
        self.activate_node(&body_id, CONNECTION_DEFAULT)
    }

    fn complete_for_each(&mut self, id: &NodeInstanceId) -> Result<(), EngineError> {
        let (node_id, scope) = match self.nodes.get(id) {
            Some(instance) => (instance.node_id.clone(), instance.scope.clone()),
            None => return Ok(()),
        };
        let for_each: ForEachNode = match self.definition.node(&node_id).map(|n| &n.kind) {
            Some(NodeKind::ForEach(for_each)) => for_each.clone(),
            _ => return Ok(()),
        };

        if let Some(target) = &for_each.output_collection {
            let (_, _, outputs) = self.loop_progress(id);
            if !self
                .scopes
                .set_variable(&scope, target, Value::Array(outputs.clone()))
            {
                self.scopes.set_local(&scope, target, Value::Array(outputs));
            }
        }
        debug!(
            join = %for_each.descriptor.join.0,
            node_instance_id = %id.0,
            "Loop join complete"
        );
        self.complete_node(id, CONNECTION_DEFAULT)
    }

    fn loop_progress(&self, id: &NodeInstanceId) -> (usize, usize, Vec<Value>) {
        match self.nodes.get(id).map(|n| &n.kind) {
            Some(NodeInstanceKind::ForEach(state)) => (
                state.completed_count(),
                state.children.len(),
                state
                    .accumulator
                    .iter()
                    .map(|slot| slot.clone().unwrap_or(Value::Null))
                    .collect(),
            ),
            _ => (0, 0, Vec::new()),
        }
    }

    fn all_started(&self, id: &NodeInstanceId) -> bool {
        match self.nodes.get(id).map(|n| &n.kind) {
            Some(NodeInstanceKind::ForEach(state)) => state.all_started(),
            _ => false,
        }
    }
}
