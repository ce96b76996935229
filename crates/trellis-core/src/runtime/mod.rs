//! Collaborator contracts consumed by the Trellis engine
//!
//! This module defines the traits the engine uses to talk to the external
//! rule/decision world, plus the `ExecutionContext` bundle that carries them
//! into a process instance. External crates implement these traits to plug
//! in a real rule engine; the `memory` module ships in-memory versions for
//! tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::node_instance::NodeInstanceId;
use crate::domain::process_instance::ProcessInstanceId;
use crate::error::EngineError;

pub mod expression;

pub use expression::{CompiledExpression, ExpressionEvaluator, JmespathEvaluator};

/// Opaque reference identifying one fact inserted into a rule session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactHandle(pub u64);

/// External scheduler for rule-flow groups
pub trait RuleScheduler: Send + Sync {
    /// Make the named group's rules eligible to fire
    fn activate_group(
        &self,
        name: &str,
        process_instance_id: &ProcessInstanceId,
        node_instance_id: &NodeInstanceId,
    );

    /// Withdraw the named group so no pending activation fires afterwards
    fn deactivate_group(&self, name: &str);
}

/// The external rule engine's mutable fact store
pub trait RuleSession: Send + Sync {
    /// Insert a fact, returning its handle
    fn insert_fact(&self, value: Value) -> FactHandle;

    /// Remove a previously inserted fact
    fn retract_fact(&self, handle: &FactHandle);

    /// Fire pending activations, up to `limit`; returns how many fired
    fn fire_all(&self, limit: u32) -> u32;

    /// Read the current value of a fact, if it is still in the session
    fn get_object(&self, handle: &FactHandle) -> Option<Value>;

    /// Stable identifier of this session, when it has one; feeds the
    /// optional suffix of the rule-flow-group signal name
    fn session_id(&self) -> Option<String> {
        None
    }
}

/// Outcome of a decision-model evaluation
#[derive(Debug, Clone, Default)]
pub struct DecisionOutcome {
    /// Error messages carried by the decision result
    pub errors: Vec<String>,

    /// The result fields, keyed by output name
    pub outputs: Map<String, Value>,
}

/// External decision-model evaluator
pub trait DecisionEvaluator: Send + Sync {
    /// Evaluate the named model with the given input bindings
    fn evaluate(
        &self,
        namespace: &str,
        model: &str,
        bindings: &Map<String, Value>,
    ) -> Result<DecisionOutcome, EngineError>;
}

/// Runner for isolated rule units (no shared fact handles with the session)
pub trait RuleUnitRunner: Send + Sync {
    /// Bind the unit's data object from the execution context bindings
    fn bind(&self, unit: &str, bindings: &Map<String, Value>) -> Result<Value, EngineError>;

    /// Create a dedicated unit instance for the data object and fire it
    fn fire(&self, unit: &str, data: &Value) -> Result<(), EngineError>;
}

/// A registered data transformation for one expression language
pub trait DataTransformer: Send + Sync {
    /// Run the compiled expression over the source bindings
    fn transform(&self, expression: &str, bindings: &Map<String, Value>)
        -> Result<Value, EngineError>;
}

/// Lookup of data transformers by expression-language id
pub trait TransformationRegistry: Send + Sync {
    /// Find the transformer registered for a language, if any
    fn find(&self, language: &str) -> Option<Arc<dyn DataTransformer>>;
}

/// Conversion of values to a declared target type
pub trait TypeConversionRegistry: Send + Sync {
    /// Coerce `value` to the named target type
    fn transform(&self, value: Value, target_type_name: &str) -> Result<Value, EngineError>;
}

/// Pluggable stand-in for host-language type reflection
pub trait TypeRegistry: Send + Sync {
    /// The ordered label→value table of a registered enum type, if the name
    /// resolves to one
    fn enum_values(&self, type_name: &str, loader: Option<&str>) -> Option<Vec<(String, Value)>>;

    /// Whether the name resolves to a registered object type
    fn is_object_type(&self, type_name: &str) -> bool;
}

/// Default fire limit for synchronous rule-flow-group activations
pub const DEFAULT_FIRE_LIMIT: u32 = 10_000;

/// Everything a process instance needs from the outside world, carried
/// explicitly instead of being read from ambient state
pub struct ExecutionContext {
    /// Rule-flow-group scheduler
    pub rule_scheduler: Arc<dyn RuleScheduler>,

    /// Rule session (working memory)
    pub rule_session: Arc<dyn RuleSession>,

    /// Decision-model evaluator
    pub decision_evaluator: Arc<dyn DecisionEvaluator>,

    /// Isolated rule-unit runner
    pub rule_unit_runner: Arc<dyn RuleUnitRunner>,

    /// Data transformers by language
    pub transformations: Arc<dyn TransformationRegistry>,

    /// Value coercion to declared types
    pub conversions: Arc<dyn TypeConversionRegistry>,

    /// Enum/object type resolution
    pub types: Arc<dyn TypeRegistry>,

    /// Expression language evaluator
    pub expressions: Arc<dyn ExpressionEvaluator>,

    /// Upper bound on synchronous rule firings per activation
    pub fire_limit: u32,

    /// Promote swallowed output-binding failures to hard errors
    pub strict_bindings: bool,
}

impl ExecutionContext {
    /// Create a context with the default fire limit and lenient bindings
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_scheduler: Arc<dyn RuleScheduler>,
        rule_session: Arc<dyn RuleSession>,
        decision_evaluator: Arc<dyn DecisionEvaluator>,
        rule_unit_runner: Arc<dyn RuleUnitRunner>,
        transformations: Arc<dyn TransformationRegistry>,
        conversions: Arc<dyn TypeConversionRegistry>,
        types: Arc<dyn TypeRegistry>,
        expressions: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            rule_scheduler,
            rule_session,
            decision_evaluator,
            rule_unit_runner,
            transformations,
            conversions,
            types,
            expressions,
            fire_limit: DEFAULT_FIRE_LIMIT,
            strict_bindings: false,
        }
    }

    /// Override the process-wide fire limit
    pub fn with_fire_limit(mut self, fire_limit: u32) -> Self {
        self.fire_limit = fire_limit;
        self
    }

    /// Turn swallowed output-binding failures into hard errors
    pub fn with_strict_bindings(mut self, strict: bool) -> Self {
        self.strict_bindings = strict;
        self
    }
}

/// JSON-native type conversion covering the built-in type names
///
/// Custom type names accept objects as-is and parse JSON out of strings,
/// which is what a host marshalling domain objects through JSON needs.
#[derive(Debug, Default)]
pub struct JsonTypeConversionRegistry;

impl JsonTypeConversionRegistry {
    fn coercion_error(target: &str, message: impl Into<String>) -> EngineError {
        EngineError::TypeCoercion {
            target: target.to_string(),
            message: message.into(),
            source: None,
        }
    }
}

impl TypeConversionRegistry for JsonTypeConversionRegistry {
    fn transform(&self, value: Value, target_type_name: &str) -> Result<Value, EngineError> {
        match target_type_name {
            "any" => Ok(value),
            "string" => match value {
                Value::String(_) => Ok(value),
                Value::Null => Ok(Value::String(String::new())),
                other => Ok(Value::String(other.to_string())),
            },
            "integer" | "long" => match &value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
                Value::Number(n) => {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    if f.fract() == 0.0 {
                        Ok(Value::from(f as i64))
                    } else {
                        Err(Self::coercion_error(target_type_name, format!("{} has a fractional part", f)))
                    }
                }
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| Self::coercion_error(target_type_name, e.to_string())),
                other => Err(Self::coercion_error(
                    target_type_name,
                    format!("unsupported value {}", other),
                )),
            },
            "float" | "double" => match &value {
                Value::Number(_) => Ok(value),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| Self::coercion_error(target_type_name, e.to_string()))
                    .and_then(|f| {
                        serde_json::Number::from_f64(f)
                            .map(Value::Number)
                            .ok_or_else(|| {
                                Self::coercion_error(target_type_name, "not a finite number")
                            })
                    }),
                other => Err(Self::coercion_error(
                    target_type_name,
                    format!("unsupported value {}", other),
                )),
            },
            "boolean" => match &value {
                Value::Bool(_) => Ok(value),
                Value::String(s) => match s.trim() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    other => Err(Self::coercion_error(
                        target_type_name,
                        format!("{:?} is not a boolean", other),
                    )),
                },
                other => Err(Self::coercion_error(
                    target_type_name,
                    format!("unsupported value {}", other),
                )),
            },
            "object" => match value {
                Value::Object(_) => Ok(value),
                Value::String(s) => serde_json::from_str::<Value>(&s)
                    .ok()
                    .filter(Value::is_object)
                    .ok_or_else(|| Self::coercion_error(target_type_name, "not a JSON object")),
                other => Err(Self::coercion_error(
                    target_type_name,
                    format!("unsupported value {}", other),
                )),
            },
            "array" | "collection" => match value {
                Value::Array(_) => Ok(value),
                other => Err(Self::coercion_error(
                    target_type_name,
                    format!("unsupported value {}", other),
                )),
            },
            // Custom declared type: structured values pass through, strings
            // are parsed as the JSON form of the declared type
            _ => match value {
                Value::Object(_) | Value::Array(_) => Ok(value),
                Value::String(s) => serde_json::from_str::<Value>(&s).map_err(|e| {
                    EngineError::TypeCoercion {
                        target: target_type_name.to_string(),
                        message: e.to_string(),
                        source: Some(Box::new(EngineError::Serialization(e.to_string()))),
                    }
                }),
                other => Err(Self::coercion_error(
                    target_type_name,
                    format!("unsupported value {}", other),
                )),
            },
        }
    }
}

/// A data transformer backed by a plain function
pub struct FnTransformer<F>(pub F)
where
    F: Fn(&str, &Map<String, Value>) -> Result<Value, EngineError> + Send + Sync;

impl<F> DataTransformer for FnTransformer<F>
where
    F: Fn(&str, &Map<String, Value>) -> Result<Value, EngineError> + Send + Sync,
{
    fn transform(
        &self,
        expression: &str,
        bindings: &Map<String, Value>,
    ) -> Result<Value, EngineError> {
        (self.0)(expression, bindings)
    }
}

/// In-memory collaborator implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct SessionInner {
        next_handle: u64,
        facts: HashMap<u64, Value>,
        inserted: Vec<FactHandle>,
        retracted: Vec<FactHandle>,
        pending_activations: u32,
    }

    /// Recording in-memory rule session
    #[derive(Default)]
    pub struct MemoryRuleSession {
        inner: Mutex<SessionInner>,
        identifier: Option<String>,
    }

    impl MemoryRuleSession {
        /// Create an anonymous session
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a session with a stable identifier
        pub fn with_identifier(identifier: impl Into<String>) -> Self {
            Self {
                inner: Mutex::default(),
                identifier: Some(identifier.into()),
            }
        }

        /// Configure how many activations the next `fire_all` has pending
        pub fn set_pending_activations(&self, count: u32) {
            self.inner.lock().unwrap().pending_activations = count;
        }

        /// Handles inserted so far, in insertion order
        pub fn inserted(&self) -> Vec<FactHandle> {
            self.inner.lock().unwrap().inserted.clone()
        }

        /// Handles retracted so far, in retraction order
        pub fn retracted(&self) -> Vec<FactHandle> {
            self.inner.lock().unwrap().retracted.clone()
        }

        /// Number of facts currently in the session
        pub fn live_fact_count(&self) -> usize {
            self.inner.lock().unwrap().facts.len()
        }

        /// Overwrite the value of a live fact, as a firing rule would
        pub fn update_fact(&self, handle: &FactHandle, value: Value) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(slot) = inner.facts.get_mut(&handle.0) {
                *slot = value;
            }
        }
    }

    impl RuleSession for MemoryRuleSession {
        fn insert_fact(&self, value: Value) -> FactHandle {
            let mut inner = self.inner.lock().unwrap();
            inner.next_handle += 1;
            let handle = FactHandle(inner.next_handle);
            inner.facts.insert(handle.0, value);
            inner.inserted.push(handle.clone());
            handle
        }

        fn retract_fact(&self, handle: &FactHandle) {
            let mut inner = self.inner.lock().unwrap();
            inner.facts.remove(&handle.0);
            inner.retracted.push(handle.clone());
        }

        fn fire_all(&self, limit: u32) -> u32 {
            let mut inner = self.inner.lock().unwrap();
            let fired = inner.pending_activations.min(limit);
            inner.pending_activations -= fired;
            fired
        }

        fn get_object(&self, handle: &FactHandle) -> Option<Value> {
            self.inner.lock().unwrap().facts.get(&handle.0).cloned()
        }

        fn session_id(&self) -> Option<String> {
            self.identifier.clone()
        }
    }

    /// Recording in-memory rule-flow-group scheduler
    #[derive(Default)]
    pub struct MemoryRuleScheduler {
        activations: Mutex<Vec<(String, ProcessInstanceId, NodeInstanceId)>>,
        deactivations: Mutex<Vec<String>>,
    }

    impl MemoryRuleScheduler {
        /// Create an empty scheduler
        pub fn new() -> Self {
            Self::default()
        }

        /// Group activations recorded so far
        pub fn activations(&self) -> Vec<(String, ProcessInstanceId, NodeInstanceId)> {
            self.activations.lock().unwrap().clone()
        }

        /// Group deactivations recorded so far
        pub fn deactivations(&self) -> Vec<String> {
            self.deactivations.lock().unwrap().clone()
        }
    }

    impl RuleScheduler for MemoryRuleScheduler {
        fn activate_group(
            &self,
            name: &str,
            process_instance_id: &ProcessInstanceId,
            node_instance_id: &NodeInstanceId,
        ) {
            self.activations.lock().unwrap().push((
                name.to_string(),
                process_instance_id.clone(),
                node_instance_id.clone(),
            ));
        }

        fn deactivate_group(&self, name: &str) {
            self.deactivations.lock().unwrap().push(name.to_string());
        }
    }

    /// Table-driven in-memory decision evaluator
    #[derive(Default)]
    pub struct MemoryDecisionEvaluator {
        results: Mutex<HashMap<(String, String), DecisionOutcome>>,
    }

    impl MemoryDecisionEvaluator {
        /// Create an evaluator with no registered models
        pub fn new() -> Self {
            Self::default()
        }

        /// Register the outputs a model evaluation returns
        pub fn register_result(&self, namespace: &str, model: &str, outputs: Map<String, Value>) {
            self.results.lock().unwrap().insert(
                (namespace.to_string(), model.to_string()),
                DecisionOutcome {
                    errors: Vec::new(),
                    outputs,
                },
            );
        }

        /// Register error messages a model evaluation returns
        pub fn register_errors(&self, namespace: &str, model: &str, messages: Vec<String>) {
            self.results.lock().unwrap().insert(
                (namespace.to_string(), model.to_string()),
                DecisionOutcome {
                    errors: messages,
                    outputs: Map::new(),
                },
            );
        }
    }

    impl DecisionEvaluator for MemoryDecisionEvaluator {
        fn evaluate(
            &self,
            namespace: &str,
            model: &str,
            _bindings: &Map<String, Value>,
        ) -> Result<DecisionOutcome, EngineError> {
            let results = self.results.lock().unwrap();
            Ok(results
                .get(&(namespace.to_string(), model.to_string()))
                .cloned()
                .unwrap_or_else(|| DecisionOutcome {
                    errors: vec![format!("unknown decision model {}:{}", namespace, model)],
                    outputs: Map::new(),
                }))
        }
    }

    /// Recording in-memory rule-unit runner
    #[derive(Default)]
    pub struct MemoryRuleUnitRunner {
        fired: Mutex<Vec<(String, Value)>>,
    }

    impl MemoryRuleUnitRunner {
        /// Create a runner with nothing fired yet
        pub fn new() -> Self {
            Self::default()
        }

        /// The (unit, data) pairs fired so far
        pub fn fired(&self) -> Vec<(String, Value)> {
            self.fired.lock().unwrap().clone()
        }
    }

    impl RuleUnitRunner for MemoryRuleUnitRunner {
        fn bind(&self, _unit: &str, bindings: &Map<String, Value>) -> Result<Value, EngineError> {
            Ok(Value::Object(bindings.clone()))
        }

        fn fire(&self, unit: &str, data: &Value) -> Result<(), EngineError> {
            self.fired
                .lock()
                .unwrap()
                .push((unit.to_string(), data.clone()));
            Ok(())
        }
    }

    /// In-memory type registry with counted enum resolutions
    #[derive(Default)]
    pub struct MemoryTypeRegistry {
        enums: Mutex<HashMap<String, Vec<(String, Value)>>>,
        object_types: Mutex<HashSet<String>>,
        resolutions: Mutex<HashMap<(String, Option<String>), usize>>,
    }

    impl MemoryTypeRegistry {
        /// Create an empty registry
        pub fn new() -> Self {
            Self::default()
        }

        /// Register an enum type's ordered label→value table
        pub fn register_enum(&self, type_name: &str, values: Vec<(String, Value)>) {
            self.enums
                .lock()
                .unwrap()
                .insert(type_name.to_string(), values);
        }

        /// Register a plain object type name
        pub fn register_object_type(&self, type_name: &str) {
            self.object_types
                .lock()
                .unwrap()
                .insert(type_name.to_string());
        }

        /// How many times an enum's table was resolved for a loader context
        pub fn resolution_count(&self, type_name: &str, loader: Option<&str>) -> usize {
            self.resolutions
                .lock()
                .unwrap()
                .get(&(type_name.to_string(), loader.map(str::to_string)))
                .copied()
                .unwrap_or(0)
        }
    }

    impl TypeRegistry for MemoryTypeRegistry {
        fn enum_values(
            &self,
            type_name: &str,
            loader: Option<&str>,
        ) -> Option<Vec<(String, Value)>> {
            *self
                .resolutions
                .lock()
                .unwrap()
                .entry((type_name.to_string(), loader.map(str::to_string)))
                .or_insert(0) += 1;
            self.enums.lock().unwrap().get(type_name).cloned()
        }

        fn is_object_type(&self, type_name: &str) -> bool {
            self.object_types.lock().unwrap().contains(type_name)
        }
    }

    /// In-memory transformer registry keyed by language id
    #[derive(Default)]
    pub struct MemoryTransformationRegistry {
        transformers: Mutex<HashMap<String, Arc<dyn DataTransformer>>>,
    }

    impl MemoryTransformationRegistry {
        /// Create a registry with no languages registered
        pub fn new() -> Self {
            Self::default()
        }

        /// Register the transformer for a language
        pub fn register(&self, language: &str, transformer: Arc<dyn DataTransformer>) {
            self.transformers
                .lock()
                .unwrap()
                .insert(language.to_string(), transformer);
        }
    }

    impl TransformationRegistry for MemoryTransformationRegistry {
        fn find(&self, language: &str) -> Option<Arc<dyn DataTransformer>> {
            self.transformers.lock().unwrap().get(language).cloned()
        }
    }

    /// Bundle of in-memory collaborators wired into one `ExecutionContext`
    pub struct MemoryCollaborators {
        /// The recording scheduler
        pub scheduler: Arc<MemoryRuleScheduler>,
        /// The recording rule session
        pub session: Arc<MemoryRuleSession>,
        /// The table-driven decision evaluator
        pub decisions: Arc<MemoryDecisionEvaluator>,
        /// The recording rule-unit runner
        pub units: Arc<MemoryRuleUnitRunner>,
        /// The in-memory type registry
        pub types: Arc<MemoryTypeRegistry>,
        /// The in-memory transformation registry
        pub transformations: Arc<MemoryTransformationRegistry>,
    }

    impl MemoryCollaborators {
        /// Create a fresh set of collaborators
        pub fn new() -> Self {
            Self {
                scheduler: Arc::new(MemoryRuleScheduler::new()),
                session: Arc::new(MemoryRuleSession::new()),
                decisions: Arc::new(MemoryDecisionEvaluator::new()),
                units: Arc::new(MemoryRuleUnitRunner::new()),
                types: Arc::new(MemoryTypeRegistry::new()),
                transformations: Arc::new(MemoryTransformationRegistry::new()),
            }
        }

        /// Replace the session with one carrying a stable identifier
        pub fn with_session(mut self, session: MemoryRuleSession) -> Self {
            self.session = Arc::new(session);
            self
        }

        /// Wire the collaborators into an execution context with the
        /// default JSON conversions and the JMESPath evaluator
        pub fn context(&self) -> Arc<ExecutionContext> {
            Arc::new(ExecutionContext::new(
                self.scheduler.clone(),
                self.session.clone(),
                self.decisions.clone(),
                self.units.clone(),
                self.transformations.clone(),
                Arc::new(JsonTypeConversionRegistry),
                self.types.clone(),
                Arc::new(JmespathEvaluator),
            ))
        }
    }

    impl Default for MemoryCollaborators {
        fn default() -> Self {
            Self::new()
        }
    }
}
