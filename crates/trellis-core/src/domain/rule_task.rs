//! Runtime behavior of the rule-task node
//!
//! A rule task delegates part of its work to the external rule/decision
//! collaborators. Decision and RuleUnit modes complete inline; RuleFlowGroup
//! mode either fires synchronously under a fire limit or suspends on the
//! group signal until the external scheduler reports completion.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::bindings;
use super::definition::{DataAssociation, NodeKind, RuleTaskNode, RuleType, CONNECTION_DEFAULT};
use super::node_instance::{NodeInstanceId, NodeInstanceKind, RuleTaskState};
use super::process_instance::ProcessInstance;
use super::variable_scope::ScopeId;
use crate::error::EngineError;
use crate::runtime::RuleSession;

/// Data input carrying a per-activation fire-limit override; a control
/// parameter, never inserted into working memory
pub const FIRE_RULE_LIMIT_PARAMETER: &str = "FireRuleLimit";

/// The signal name a suspended rule-flow-group activation listens on
pub fn rule_set_event_type(group: &str, session: &dyn RuleSession) -> String {
    match session.session_id() {
        Some(session_id) => format!("RuleFlowGroup_{}_{}", group, session_id),
        None => format!("RuleFlowGroup_{}", group),
    }
}

fn parse_fire_limit(value: &Value) -> Result<u32, EngineError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        EngineError::Configuration(format!(
            "Invalid {} value: {}",
            FIRE_RULE_LIMIT_PARAMETER, value
        ))
    })
}

impl ProcessInstance {
    pub(crate) fn trigger_rule_task(&mut self, id: &NodeInstanceId) -> Result<(), EngineError> {
        let (node_id, scope) = {
            let instance = &self.nodes[id];
            (instance.node_id.clone(), instance.scope.clone())
        };
        let rule_task: RuleTaskNode = match self.definition.node(&node_id).map(|n| &n.kind) {
            Some(NodeKind::RuleTask(rule_task)) => rule_task.clone(),
            _ => {
                return Err(EngineError::Configuration(format!(
                    "Node {} is not a rule task",
                    node_id.0
                )))
            }
        };

        let ctx = Arc::clone(&self.context);
        let inputs = bindings::evaluate_inputs(
            &self.scopes,
            &scope,
            &ctx,
            &rule_task.inputs,
            &rule_task.parameters,
        )?;

        match &rule_task.rule_type {
            RuleType::Decision { namespace, model } => {
                let namespace = self.resolve_text(&scope, namespace);
                let model = self.resolve_text(&scope, model);
                debug!(namespace = %namespace, model = %model, "Evaluating decision model");

                let outcome = ctx.decision_evaluator.evaluate(&namespace, &model, &inputs)?;
                if !outcome.errors.is_empty() {
                    return Err(EngineError::DecisionEvaluation {
                        messages: outcome.errors,
                    });
                }
                self.apply_rule_outputs(&scope, &rule_task.outputs, &outcome.outputs, true)?;
                self.complete_node(id, CONNECTION_DEFAULT)
            }

            RuleType::RuleFlowGroup { group } => {
                let group = self.resolve_text(&scope, group);

                // Insert every binding as a fact, keyed by group, process
                // instance and binding name; the fire-limit control
                // parameter stays out of working memory
                let mut fact_handles = HashMap::new();
                for (name, value) in &inputs {
                    if name == FIRE_RULE_LIMIT_PARAMETER {
                        continue;
                    }
                    let key = format!("{}_{}_{}", group, self.id.0, name);
                    fact_handles.insert(key, ctx.rule_session.insert_fact(value.clone()));
                }
                if let Some(instance) = self.nodes.get_mut(id) {
                    instance.kind = NodeInstanceKind::RuleTask(RuleTaskState {
                        rule_flow_group: Some(group.clone()),
                        fact_handles,
                    });
                }

                if rule_task.wait_state {
                    let event = rule_set_event_type(&group, ctx.rule_session.as_ref());
                    self.add_listener(&event, id);
                    ctx.rule_scheduler.activate_group(&group, &self.id, id);
                    debug!(group = %group, event = %event, "Rule task suspended awaiting group signal");
                    Ok(())
                } else {
                    let fire_limit = match inputs.get(FIRE_RULE_LIMIT_PARAMETER) {
                        Some(value) => parse_fire_limit(value)?,
                        None => ctx.fire_limit,
                    };
                    ctx.rule_scheduler.activate_group(&group, &self.id, id);

                    let fired = ctx.rule_session.fire_all(fire_limit);
                    if fired == fire_limit {
                        return Err(EngineError::Configuration(format!(
                            "Fire rule limit reached {}, limit can be set on the execution context or via the {} data input",
                            fire_limit, FIRE_RULE_LIMIT_PARAMETER
                        )));
                    }
                    debug!(group = %group, fired, "Rule-flow group fired synchronously");

                    self.retract_facts(id)?;
                    self.complete_node(id, CONNECTION_DEFAULT)
                }
            }

            RuleType::RuleUnit { unit } => {
                let data = ctx.rule_unit_runner.bind(unit, &inputs)?;
                ctx.rule_unit_runner.fire(unit, &data)?;
                if let Value::Object(bag) = &data {
                    self.apply_rule_outputs(&scope, &rule_task.outputs, bag, false)?;
                }
                self.complete_node(id, CONNECTION_DEFAULT)
            }
        }
    }

    /// Resume a rule task suspended in wait-state: deregister, retract the
    /// activation's facts, apply outputs, complete.
    pub(crate) fn on_rule_task_signal(
        &mut self,
        id: &NodeInstanceId,
        event_type: &str,
    ) -> Result<(), EngineError> {
        let group = match &self.nodes[id].kind {
            NodeInstanceKind::RuleTask(state) => state.rule_flow_group.clone(),
            _ => None,
        };
        let Some(group) = group else {
            return Ok(());
        };

        let expected = rule_set_event_type(&group, self.context.rule_session.as_ref());
        if expected != event_type {
            return Ok(());
        }

        self.remove_listener(event_type, id);
        if let Err(error) = self
            .retract_facts(id)
            .and_then(|_| self.complete_node(id, CONNECTION_DEFAULT))
        {
            return self.handle_error(id, error);
        }
        Ok(())
    }

    /// Retract every fact inserted for this activation, recovering the
    /// original binding names, then apply the output associations.
    pub(crate) fn retract_facts(&mut self, id: &NodeInstanceId) -> Result<(), EngineError> {
        let (scope, node_id, state) = {
            let instance = &self.nodes[id];
            match &instance.kind {
                NodeInstanceKind::RuleTask(state) => (
                    instance.scope.clone(),
                    instance.node_id.clone(),
                    state.clone(),
                ),
                _ => return Ok(()),
            }
        };
        let ctx = Arc::clone(&self.context);
        let group = state.rule_flow_group.clone().unwrap_or_default();

        let mut objects = Map::new();
        for (key, handle) in &state.fact_handles {
            let object = ctx.rule_session.get_object(handle).unwrap_or(Value::Null);
            let name = key
                .replace(&format!("{}_", group), "")
                .replace(&format!("{}_", self.id.0), "");
            objects.insert(name, object);
            ctx.rule_session.retract_fact(handle);
        }

        if let Some(instance) = self.nodes.get_mut(id) {
            if let NodeInstanceKind::RuleTask(state) = &mut instance.kind {
                state.fact_handles.clear();
            }
        }

        let outputs: Vec<DataAssociation> =
            match self.definition.node(&node_id).map(|n| &n.kind) {
                Some(NodeKind::RuleTask(rule_task)) => rule_task.outputs.clone(),
                _ => Vec::new(),
            };
        self.apply_rule_outputs(&scope, &outputs, &objects, false)
    }

    /// Cancellation while suspended must deactivate the group so no
    /// orphaned activation fires afterwards; any facts still held are
    /// retracted.
    pub(crate) fn cancel_rule_task(&mut self, id: &NodeInstanceId) -> Result<(), EngineError> {
        let (node_id, state) = {
            let instance = &self.nodes[id];
            match &instance.kind {
                NodeInstanceKind::RuleTask(state) => (instance.node_id.clone(), state.clone()),
                _ => return Ok(()),
            }
        };
        let ctx = Arc::clone(&self.context);

        if let Some(group) = &state.rule_flow_group {
            let event = rule_set_event_type(group, ctx.rule_session.as_ref());
            self.remove_listener(&event, id);

            let wait_state = matches!(
                self.definition.node(&node_id).map(|n| &n.kind),
                Some(NodeKind::RuleTask(rule_task)) if rule_task.wait_state
            );
            if wait_state {
                ctx.rule_scheduler.deactivate_group(group);
                debug!(group = %group, "Deactivated rule-flow group on cancellation");
            }
        }

        for handle in state.fact_handles.values() {
            ctx.rule_session.retract_fact(handle);
        }
        if let Some(instance) = self.nodes.get_mut(id) {
            if let NodeInstanceKind::RuleTask(state) = &mut instance.kind {
                state.fact_handles.clear();
            }
        }
        Ok(())
    }

    /// Apply output associations against a result bag. With no associations
    /// configured, `bind_all_when_empty` binds every result field straight
    /// into the enclosing scope (the decision-mode behavior).
    fn apply_rule_outputs(
        &mut self,
        scope: &ScopeId,
        associations: &[DataAssociation],
        bag: &Map<String, Value>,
        bind_all_when_empty: bool,
    ) -> Result<(), EngineError> {
        if associations.is_empty() {
            if bind_all_when_empty {
                for (name, value) in bag {
                    if !self.scopes.set_variable(scope, name, value.clone()) {
                        self.scopes.set_local(scope, name, value.clone());
                    }
                }
            }
            return Ok(());
        }
        let ctx = Arc::clone(&self.context);
        bindings::apply_outputs(&mut self.scopes, scope, &ctx, associations, bag)
    }

    fn resolve_text(&self, scope: &ScopeId, text: &str) -> String {
        let resolved = bindings::resolve_parameter(
            &self.scopes,
            scope,
            &self.context,
            &Value::String(text.to_string()),
        );
        match resolved {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data_type::DataType;
    use crate::domain::definition::{
        NodeDefinition, NodeId, ProcessDefinition, RuleTaskNode,
    };
    use crate::domain::exception_scope::ExceptionScope;
    use crate::domain::process_instance::{ProcessInstance, ProcessState};
    use crate::domain::variable_scope::VariableDef;
    use crate::runtime::memory::{MemoryCollaborators, MemoryRuleSession};
    use crate::runtime::ExecutionContext;
    use serde_json::json;

    fn rule_task_process(rule_task: RuleTaskNode) -> ProcessDefinition {
        let start = NodeId::new("start");
        let task = NodeId::new("task");
        let end = NodeId::new("end");
        ProcessDefinition::new("p", "p")
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::rule_task("task", rule_task))
            .with_node(NodeDefinition::end("end"))
            .connect(&start, &task)
            .connect(&task, &end)
    }

    #[test]
    fn test_decision_binds_all_result_fields() {
        let collaborators = MemoryCollaborators::new();
        let mut outputs = Map::new();
        outputs.insert("approved".to_string(), json!(true));
        outputs.insert("score".to_string(), json!(88));
        collaborators
            .decisions
            .register_result("acme", "credit", outputs);

        let definition = rule_task_process(RuleTaskNode::new(RuleType::Decision {
            namespace: "acme".to_string(),
            model: "credit".to_string(),
        }));

        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(instance.variable("approved"), Some(&json!(true)));
        assert_eq!(instance.variable("score"), Some(&json!(88)));
    }

    #[test]
    fn test_decision_reference_resolves_tokens() {
        let collaborators = MemoryCollaborators::new();
        collaborators
            .decisions
            .register_result("acme", "credit", Map::new());

        let definition = rule_task_process(RuleTaskNode::new(RuleType::Decision {
            namespace: "#{ns}".to_string(),
            model: "#{model}".to_string(),
        }));

        let mut inputs = Map::new();
        inputs.insert("ns".to_string(), json!("acme"));
        inputs.insert("model".to_string(), json!("credit"));
        let definition = Arc::new(
            definition
                .with_variable(VariableDef::untyped("ns"))
                .with_variable(VariableDef::untyped("model")),
        );

        let mut instance =
            ProcessInstance::new(definition, collaborators.context(), inputs);
        instance.start().unwrap();
        assert_eq!(instance.state, ProcessState::Completed);
    }

    #[test]
    fn test_decision_output_association_coerces_to_declared_type() {
        let collaborators = MemoryCollaborators::new();
        let mut outputs = Map::new();
        outputs.insert("score".to_string(), json!("88"));
        collaborators
            .decisions
            .register_result("acme", "credit", outputs);

        let rule_task = RuleTaskNode::new(RuleType::Decision {
            namespace: "acme".to_string(),
            model: "credit".to_string(),
        })
        .with_output(DataAssociation::new("score", "score"));
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::new("score", DataType::object("integer")));

        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();

        assert_eq!(instance.variable("score"), Some(&json!(88)));
    }

    #[test]
    fn test_decision_errors_abort_without_handler() {
        let collaborators = MemoryCollaborators::new();
        collaborators.decisions.register_errors(
            "acme",
            "credit",
            vec!["missing input".to_string(), "bad model".to_string()],
        );

        let definition = rule_task_process(RuleTaskNode::new(RuleType::Decision {
            namespace: "acme".to_string(),
            model: "credit".to_string(),
        }));

        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            Map::new(),
        );
        let err = instance.start().unwrap_err();

        match &err {
            EngineError::RuntimeExecution {
                node_instance_id,
                source,
                ..
            } => {
                assert!(!node_instance_id.is_empty());
                assert_eq!(
                    source.as_deref().map(EngineError::type_name),
                    Some("DecisionEvaluationError")
                );
            }
            other => panic!("Expected RuntimeExecution, got {:?}", other),
        }
        assert_eq!(instance.state, ProcessState::Aborted);
    }

    #[test]
    fn test_decision_error_routed_to_matching_handler() {
        let collaborators = MemoryCollaborators::new();
        collaborators
            .decisions
            .register_errors("acme", "credit", vec!["boom".to_string()]);

        let recover = NodeId::new("recover");
        let end = NodeId::new("end");
        let definition = rule_task_process(RuleTaskNode::new(RuleType::Decision {
            namespace: "acme".to_string(),
            model: "credit".to_string(),
        }))
        .with_variable(VariableDef::untyped("handled"))
        .with_node(NodeDefinition::script("recover", "error.type", Some("handled")))
        .with_exception_scope(
            ExceptionScope::new().with_handler("DecisionEvaluationError", recover.clone()),
        )
        .connect(&recover, &end);

        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(
            instance.variable("handled"),
            Some(&json!("DecisionEvaluationError"))
        );
    }

    #[test]
    fn test_rule_flow_group_wait_state_round_trip() {
        let collaborators = MemoryCollaborators::new();
        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .as_wait_state()
        .with_input(DataAssociation::new("order", "order"))
        .with_output(DataAssociation::new("order", "order"));
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::untyped("order"));

        let mut inputs = Map::new();
        inputs.insert("order".to_string(), json!({"amount": 10}));
        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();

        // Suspended on the group signal with the group activated
        assert_eq!(instance.state, ProcessState::Active);
        assert!(instance.has_listener("RuleFlowGroup_approvals"));
        let activations = collaborators.scheduler.activations();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].0, "approvals");

        // One fact, keyed by group and process instance id
        let inserted = collaborators.session.inserted();
        assert_eq!(inserted.len(), 1);
        assert_eq!(collaborators.session.live_fact_count(), 1);

        // A rule updates the fact before the group completes
        collaborators
            .session
            .update_fact(&inserted[0], json!({"amount": 10, "approved": true}));

        instance.signal("RuleFlowGroup_approvals", json!(null)).unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(
            instance.variable("order"),
            Some(&json!({"amount": 10, "approved": true}))
        );
        // No leaked or double-retracted facts
        assert_eq!(collaborators.session.inserted().len(), 1);
        assert_eq!(collaborators.session.retracted().len(), 1);
        assert_eq!(collaborators.session.live_fact_count(), 0);
    }

    #[test]
    fn test_wait_state_event_name_carries_session_id() {
        let collaborators = MemoryCollaborators::new()
            .with_session(MemoryRuleSession::with_identifier("session-7"));
        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .as_wait_state();
        let definition = rule_task_process(rule_task);

        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();

        assert!(instance.has_listener("RuleFlowGroup_approvals_session-7"));

        instance
            .signal("RuleFlowGroup_approvals_session-7", json!(null))
            .unwrap();
        assert_eq!(instance.state, ProcessState::Completed);
    }

    #[test]
    fn test_rule_flow_group_resolves_group_tokens() {
        let collaborators = MemoryCollaborators::new();
        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "#{groupVar}".to_string(),
        })
        .as_wait_state();
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::untyped("groupVar"));

        let mut inputs = Map::new();
        inputs.insert("groupVar".to_string(), json!("escalations"));
        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();

        assert!(instance.has_listener("RuleFlowGroup_escalations"));
    }

    #[test]
    fn test_no_wait_fires_synchronously_and_completes() {
        let collaborators = MemoryCollaborators::new();
        collaborators.session.set_pending_activations(3);

        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .with_input(DataAssociation::new("order", "order"));
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::untyped("order"));

        let mut inputs = Map::new();
        inputs.insert("order".to_string(), json!({"amount": 10}));
        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(collaborators.session.live_fact_count(), 0);
        assert_eq!(
            collaborators.session.inserted().len(),
            collaborators.session.retracted().len()
        );
    }

    #[test]
    fn test_fire_limit_reached_exactly_is_configuration_error() {
        let collaborators = MemoryCollaborators::new();
        collaborators.session.set_pending_activations(10);

        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .with_parameter(FIRE_RULE_LIMIT_PARAMETER, json!(10));
        let definition = rule_task_process(rule_task);

        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            Map::new(),
        );
        let err = instance.start().unwrap_err();

        assert_eq!(
            err.root_cause().type_name(),
            "ConfigurationError",
            "runaway-fire guard must trip at exactly the limit"
        );
        assert_eq!(instance.state, ProcessState::Aborted);
    }

    #[test]
    fn test_one_below_fire_limit_completes_normally() {
        let collaborators = MemoryCollaborators::new();
        collaborators.session.set_pending_activations(9);

        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .with_parameter(FIRE_RULE_LIMIT_PARAMETER, json!(10));
        let definition = rule_task_process(rule_task);

        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            Map::new(),
        );
        instance.start().unwrap();
        assert_eq!(instance.state, ProcessState::Completed);
    }

    #[test]
    fn test_fire_limit_parameter_is_not_inserted_as_fact() {
        let collaborators = MemoryCollaborators::new();
        collaborators.session.set_pending_activations(0);

        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .with_input(DataAssociation::new("order", "order"))
        .with_parameter(FIRE_RULE_LIMIT_PARAMETER, json!(100));
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::untyped("order"));

        let mut inputs = Map::new();
        inputs.insert("order".to_string(), json!({"amount": 10}));
        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();

        // Only the order binding reached working memory
        assert_eq!(collaborators.session.inserted().len(), 1);
        assert_eq!(instance.state, ProcessState::Completed);
    }

    #[test]
    fn test_context_fire_limit_is_the_default() {
        let collaborators = MemoryCollaborators::new();
        collaborators.session.set_pending_activations(5);

        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        });
        let definition = rule_task_process(rule_task);

        let base = collaborators.context();
        let ctx = Arc::new(
            ExecutionContext::new(
                base.rule_scheduler.clone(),
                base.rule_session.clone(),
                base.decision_evaluator.clone(),
                base.rule_unit_runner.clone(),
                base.transformations.clone(),
                base.conversions.clone(),
                base.types.clone(),
                base.expressions.clone(),
            )
            .with_fire_limit(5),
        );

        let mut instance = ProcessInstance::new(Arc::new(definition), ctx, Map::new());
        let err = instance.start().unwrap_err();
        assert_eq!(err.root_cause().type_name(), "ConfigurationError");
    }

    #[test]
    fn test_cancel_while_waiting_deactivates_group() {
        let collaborators = MemoryCollaborators::new();
        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .as_wait_state()
        .with_input(DataAssociation::new("order", "order"));
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::untyped("order"));

        let mut inputs = Map::new();
        inputs.insert("order".to_string(), json!({"amount": 10}));
        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();
        assert!(instance.has_listener("RuleFlowGroup_approvals"));

        instance.abort();

        assert_eq!(
            collaborators.scheduler.deactivations(),
            vec!["approvals".to_string()]
        );
        assert!(!instance.has_listener("RuleFlowGroup_approvals"));
        // The orphaned activation's facts were retracted
        assert_eq!(collaborators.session.live_fact_count(), 0);

        // A late signal after cancellation is a no-op
        instance
            .signal("RuleFlowGroup_approvals", json!(null))
            .unwrap();
        assert_eq!(collaborators.session.retracted().len(), 1);
    }

    #[test]
    fn test_rule_unit_fires_isolated_instance() {
        let collaborators = MemoryCollaborators::new();
        let rule_task = RuleTaskNode::new(RuleType::RuleUnit {
            unit: "loanRules".to_string(),
        })
        .with_input(DataAssociation::new("order", "order"));
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::untyped("order"));

        let mut inputs = Map::new();
        inputs.insert("order".to_string(), json!({"amount": 10}));
        let mut instance = ProcessInstance::new(
            Arc::new(definition),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        let fired = collaborators.units.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "loanRules");
        assert_eq!(fired[0].1, json!({"order": {"amount": 10}}));
        // No shared fact handles with the session
        assert!(collaborators.session.inserted().is_empty());
    }

    #[test]
    fn test_root_cause_matching_reaches_handler() {
        // Strict bindings turn the coercion failure (whose cause chain
        // bottoms out in a serialization error) into a routed exception
        let collaborators = MemoryCollaborators::new();
        collaborators.types.register_object_type("com.acme.Order");
        let mut outputs = Map::new();
        outputs.insert("order".to_string(), json!("not json at all"));
        collaborators
            .decisions
            .register_result("acme", "credit", outputs);

        let recover = NodeId::new("recover");
        let end = NodeId::new("end");
        let rule_task = RuleTaskNode::new(RuleType::Decision {
            namespace: "acme".to_string(),
            model: "credit".to_string(),
        })
        .with_output(DataAssociation::new("order", "order"));
        let definition = rule_task_process(rule_task)
            .with_variable(VariableDef::new("order", DataType::object("com.acme.Order")))
            .with_variable(VariableDef::untyped("handled"))
            .with_node(NodeDefinition::script("recover", "error.type", Some("handled")))
            .with_exception_scope(
                // Registered for the root cause only, not the thrown type
                ExceptionScope::new().with_handler("SerializationError", recover.clone()),
            )
            .connect(&recover, &end);

        let base = collaborators.context();
        let ctx = Arc::new(
            ExecutionContext::new(
                base.rule_scheduler.clone(),
                base.rule_session.clone(),
                base.decision_evaluator.clone(),
                base.rule_unit_runner.clone(),
                base.transformations.clone(),
                base.conversions.clone(),
                base.types.clone(),
                base.expressions.clone(),
            )
            .with_strict_bindings(true),
        );

        let mut instance = ProcessInstance::new(Arc::new(definition), ctx, Map::new());
        instance.start().unwrap();

        assert_eq!(instance.state, ProcessState::Completed);
        assert_eq!(
            instance.variable("handled"),
            Some(&json!("SerializationError"))
        );
    }

    #[test]
    fn test_checkpoint_restore_requires_live_facts() {
        let collaborators = MemoryCollaborators::new();
        let rule_task = RuleTaskNode::new(RuleType::RuleFlowGroup {
            group: "approvals".to_string(),
        })
        .as_wait_state()
        .with_input(DataAssociation::new("order", "order"));
        let definition = Arc::new(
            rule_task_process(rule_task).with_variable(VariableDef::untyped("order")),
        );

        let mut inputs = Map::new();
        inputs.insert("order".to_string(), json!({"amount": 10}));
        let mut instance = ProcessInstance::new(
            definition.clone(),
            collaborators.context(),
            inputs,
        );
        instance.start().unwrap();

        let snapshot = instance.checkpoint();

        // Restore succeeds while the fact is still in the session
        let mut restored = ProcessInstance::restore(
            definition.clone(),
            collaborators.context(),
            snapshot.clone(),
        )
        .unwrap();
        restored
            .signal("RuleFlowGroup_approvals", json!(null))
            .unwrap();
        assert_eq!(restored.state, ProcessState::Completed);

        // With the fact gone, the same snapshot no longer restores
        let err = ProcessInstance::restore(
            definition,
            collaborators.context(),
            snapshot,
        )
        .unwrap_err();
        assert_eq!(err.type_name(), "ConfigurationError");
    }
}
