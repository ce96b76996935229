use thiserror::Error;

/// Core error type for the Trellis runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Illegal connection type, fire-limit exceeded, unsupported mode
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unknown class or enum name
    #[error("Type resolution error: unknown type {0}")]
    TypeResolution(String),

    /// Value could not be converted to the declared target type
    #[error("Type coercion error: cannot coerce to {target}: {message}")]
    TypeCoercion {
        /// The declared target type name
        target: String,
        /// Why the conversion failed
        message: String,
        /// The underlying failure, when one exists
        #[source]
        source: Option<Box<EngineError>>,
    },

    /// The decision result carried one or more error messages
    #[error("Decision evaluation error: {}", .messages.join(", "))]
    DecisionEvaluation {
        /// The aggregated error messages from the decision result
        messages: Vec<String>,
    },

    /// Expression compilation or evaluation failed
    #[error("Expression evaluation error: {0}")]
    Expression(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Process definition not found
    #[error("Process definition not found: {0}")]
    DefinitionNotFound(String),

    /// Process instance not found
    #[error("Process instance not found: {0}")]
    InstanceNotFound(String),

    /// Uncaught failure that aborted the owning process instance
    #[error("Runtime execution error in node instance {node_instance_id} of process instance {process_instance_id}: {message}")]
    RuntimeExecution {
        /// The node instance the failure originated from
        node_instance_id: String,
        /// The owning process instance
        process_instance_id: String,
        /// Human-readable description
        message: String,
        /// The failure that was left unhandled
        #[source]
        source: Option<Box<EngineError>>,
    },
}

impl EngineError {
    /// The taxonomy name used to match exception-scope handler tables.
    pub fn type_name(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "ConfigurationError",
            EngineError::TypeResolution(_) => "TypeResolutionError",
            EngineError::TypeCoercion { .. } => "TypeCoercionError",
            EngineError::DecisionEvaluation { .. } => "DecisionEvaluationError",
            EngineError::Expression(_) => "ExpressionError",
            EngineError::Serialization(_) => "SerializationError",
            EngineError::DefinitionNotFound(_) => "DefinitionNotFoundError",
            EngineError::InstanceNotFound(_) => "InstanceNotFoundError",
            EngineError::RuntimeExecution { .. } => "RuntimeExecutionError",
        }
    }

    /// Walk the cause chain down to the innermost error.
    pub fn root_cause(&self) -> &EngineError {
        let mut current = self;
        loop {
            let next = match current {
                EngineError::TypeCoercion { source, .. } => source.as_deref(),
                EngineError::RuntimeExecution { source, .. } => source.as_deref(),
                _ => None,
            };
            match next {
                Some(inner) => current = inner,
                None => return current,
            }
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
