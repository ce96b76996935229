//! Data-association evaluation
//!
//! Resolves declarative source→target bindings for node instances: inputs
//! are gathered from the enclosing variable scopes (with `#{name}` token
//! resolution and an expression-language fallback), outputs are applied
//! back in the fixed order transformation > passthrough > explicit
//! assignments, first match wins.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use super::data_type::DataType;
use super::definition::DataAssociation;
use super::variable_scope::{ScopeId, ScopeSet};
use crate::error::EngineError;
use crate::runtime::ExecutionContext;

fn parameter_matcher() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| Regex::new(r"#\{([^\s}]+)\}").expect("parameter pattern"))
}

/// The `name` of the first `#{name}` token in a string, if any
pub fn parameter_token(text: &str) -> Option<&str> {
    parameter_matcher()
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// The visible variables of a scope as a JSON evaluation context
pub fn scope_context(scopes: &ScopeSet, scope: &ScopeId) -> Value {
    Value::Object(scopes.visible_context(scope))
}

/// Resolve `#{name}` tokens in a value against the nearest enclosing scope,
/// falling back to expression evaluation when no scope variable matches.
/// Values without tokens pass through unchanged.
pub fn resolve_parameter(
    scopes: &ScopeSet,
    scope: &ScopeId,
    ctx: &ExecutionContext,
    value: &Value,
) -> Value {
    let text = match value {
        Value::String(s) => s,
        _ => return value.clone(),
    };

    for captures in parameter_matcher().captures_iter(text) {
        let name = &captures[1];
        if scopes.resolve_declaring(scope, name).is_some() {
            if let Some(resolved) = scopes.lookup(scope, name) {
                return resolved.clone();
            }
        } else {
            match ctx.expressions.eval(name, &scope_context(scopes, scope)) {
                Ok(resolved) if !resolved.is_null() => return resolved,
                Ok(_) => {}
                Err(_) => {
                    warn!(parameter = %name, "Could not find variable scope for parameter");
                }
            }
        }
    }

    value.clone()
}

/// Gather the source parameters of one association from the scopes
pub fn source_parameters(
    scopes: &ScopeSet,
    scope: &ScopeId,
    ctx: &ExecutionContext,
    association: &DataAssociation,
) -> Map<String, Value> {
    let mut parameters = Map::new();
    for source in &association.sources {
        let value = read_source(scopes, scope, ctx, source);
        if !value.is_null() {
            parameters.insert(source.clone(), value);
        }
    }
    parameters
}

fn read_source(scopes: &ScopeSet, scope: &ScopeId, ctx: &ExecutionContext, source: &str) -> Value {
    if scopes.resolve_declaring(scope, source).is_some() {
        return scopes.lookup(scope, source).cloned().unwrap_or(Value::Null);
    }
    match ctx.expressions.eval(source, &scope_context(scopes, scope)) {
        Ok(value) => value,
        Err(_) => {
            warn!(source = %source, "Could not find variable scope for variable");
            Value::Null
        }
    }
}

/// Evaluate the input associations and static parameters of a node into a
/// binding map.
pub fn evaluate_inputs(
    scopes: &ScopeSet,
    scope: &ScopeId,
    ctx: &ExecutionContext,
    associations: &[DataAssociation],
    parameters: &Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let mut replacements = Map::new();

    for association in associations {
        if let Some(transformation) = &association.transformation {
            if let Some(transformer) = ctx.transformations.find(&transformation.language) {
                let sources = source_parameters(scopes, scope, ctx, association);
                let value = transformer.transform(&transformation.expression, &sources)?;
                if !value.is_null() {
                    replacements.insert(association.target.clone(), value);
                }
            }
        } else if association.assignments.is_empty() {
            let value = read_source(scopes, scope, ctx, &association.sources[0]);
            if !value.is_null() {
                replacements.insert(association.target.clone(), value);
            }
        }
    }

    for (name, value) in parameters {
        if value.is_string() {
            let resolved = resolve_parameter(scopes, scope, ctx, value);
            if !resolved.is_null() {
                replacements.insert(name.clone(), resolved);
            }
        } else {
            replacements.insert(name.clone(), value.clone());
        }
    }

    Ok(replacements)
}

/// Apply the output associations of a node against a result bag.
///
/// Per association, first match wins: a transformation runs the registered
/// transformer; otherwise an association without assignments is a
/// passthrough of the raw value by source key (with expression fallback and
/// declared-type coercion); otherwise every assignment expression is
/// evaluated against the result bag.
pub fn apply_outputs(
    scopes: &mut ScopeSet,
    scope: &ScopeId,
    ctx: &ExecutionContext,
    associations: &[DataAssociation],
    bag: &Map<String, Value>,
) -> Result<(), EngineError> {
    let bag_context = Value::Object(bag.clone());

    for association in associations {
        if let Some(transformation) = &association.transformation {
            if let Some(transformer) = ctx.transformations.find(&transformation.language) {
                let value = transformer.transform(&transformation.expression, bag)?;
                if !value.is_null() {
                    if !scopes.set_variable(scope, &association.target, value) {
                        warn!(target = %association.target, "Could not find variable scope for variable");
                        warn!("Continuing without setting variable.");
                    }
                }
            }
        } else if association.assignments.is_empty() {
            apply_passthrough(scopes, scope, ctx, association, bag, &bag_context)?;
        } else {
            for assignment in &association.assignments {
                match ctx.expressions.eval(&assignment.from, &bag_context) {
                    Ok(value) => {
                        if !scopes.set_variable(scope, &assignment.to, value.clone()) {
                            scopes.set_local(scope, &assignment.to, value);
                        }
                    }
                    Err(e) if ctx.strict_bindings => return Err(e),
                    Err(e) => {
                        warn!(assignment = %assignment.from, error = %e, "Assignment evaluation failed");
                    }
                }
            }
        }
    }

    Ok(())
}

fn apply_passthrough(
    scopes: &mut ScopeSet,
    scope: &ScopeId,
    ctx: &ExecutionContext,
    association: &DataAssociation,
    bag: &Map<String, Value>,
    bag_context: &Value,
) -> Result<(), EngineError> {
    let source = &association.sources[0];
    let mut value = bag.get(source).cloned().unwrap_or(Value::Null);

    if value.is_null() {
        // Fall back to expression evaluation against the result bag
        match ctx.expressions.eval(source, bag_context) {
            Ok(evaluated) => value = evaluated,
            Err(e) if ctx.strict_bindings => return Err(e),
            Err(e) => {
                warn!(source = %source, error = %e, "Output source evaluation failed");
            }
        }
    }

    let target = &association.target;
    if scopes.resolve_declaring(scope, target).is_some() {
        // Coerce to the declared type when it is a concrete object type
        if let Some(DataType::Object(object)) = scopes.declared_type(scope, target).cloned() {
            if !object.is_unknown() && !value.is_null() {
                match ctx.conversions.transform(value.clone(), &object.class_name) {
                    Ok(coerced) => value = coerced,
                    Err(e) if ctx.strict_bindings => return Err(e),
                    Err(e) => {
                        warn!(target = %target, error = %e, "Type coercion failed, assigning raw value");
                    }
                }
            }
        }
        scopes.set_variable(scope, target, value);
    } else if let Some(name) = parameter_token(target) {
        // Tokenised target: evaluate against the bag and write under the
        // token name when an enclosing scope knows it
        match ctx.expressions.eval(source, bag_context) {
            Ok(evaluated) => {
                if !scopes.set_variable(scope, name, evaluated) {
                    warn!(target = %name, "Could not find variable scope for variable");
                }
            }
            Err(e) if ctx.strict_bindings => return Err(e),
            Err(e) => {
                warn!(target = %name, error = %e, "Assignment expression failed");
            }
        }
    } else {
        warn!(target = %target, "Could not find variable scope for variable");
    }

    Ok(())
}
