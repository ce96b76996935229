//! Expression-language evaluation
//!
//! The engine treats expressions as opaque strings handed to a pluggable
//! evaluator. The default implementation speaks JMESPath, with a literal
//! fallback so plain JSON values can be used where an expression is
//! expected.

use serde_json::Value;

use crate::error::EngineError;

/// An expression validated by `ExpressionEvaluator::compile`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledExpression {
    /// The source text of the expression
    pub expression: String,
}

/// Evaluator for the expression language used in bindings and conditions
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate an expression against a JSON context
    fn eval(&self, expr: &str, context: &Value) -> Result<Value, EngineError>;

    /// Validate an expression without evaluating it
    fn compile(&self, expr: &str) -> Result<CompiledExpression, EngineError>;
}

/// Default evaluator backed by JMESPath
#[derive(Debug, Default)]
pub struct JmespathEvaluator;

impl ExpressionEvaluator for JmespathEvaluator {
    fn eval(&self, expr: &str, context: &Value) -> Result<Value, EngineError> {
        match jmespath::compile(expr) {
            Ok(compiled) => match compiled.search(context) {
                Ok(result) => {
                    // Convert the jmespath result back to serde_json::Value
                    Ok(serde_json::to_value(result).unwrap_or(Value::Null))
                }
                Err(e) => Err(EngineError::Expression(format!(
                    "Failed to evaluate JMESPath expression: {}: {}",
                    expr, e
                ))),
            },
            Err(_) => {
                // Not a valid path expression; accept plain JSON literals
                serde_json::from_str::<Value>(expr).map_err(|_| {
                    EngineError::Expression(format!("Invalid expression: {}", expr))
                })
            }
        }
    }

    fn compile(&self, expr: &str) -> Result<CompiledExpression, EngineError> {
        if jmespath::compile(expr).is_err() && serde_json::from_str::<Value>(expr).is_err() {
            return Err(EngineError::Expression(format!(
                "Failed to compile JMESPath expression: {}",
                expr
            )));
        }
        Ok(CompiledExpression {
            expression: expr.to_string(),
        })
    }
}

/// Truthiness of a JSON value, with JMESPath semantics: null, false, empty
/// strings and empty containers are false, everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
