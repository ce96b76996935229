//! Static process-definition model
//!
//! A `ProcessDefinition` is the immutable node graph the engine executes.
//! Building one from an authoring format (BPMN or otherwise) is a
//! collaborator concern; this module only models the finished graph.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::exception_scope::ExceptionScope;
use super::variable_scope::VariableDef;

/// Value object: process definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

/// Value object: node definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id from a string
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }
}

/// The default connection type
pub const CONNECTION_DEFAULT: &str = "out";

/// A typed connection between two node definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Source node
    pub from: NodeId,

    /// Target node
    pub to: NodeId,

    /// Connection-type tag completions propagate along
    pub connection_type: String,
}

/// Static definition of a process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique identifier
    pub id: ProcessId,

    /// Human-readable name
    pub name: String,

    /// Node definitions by id
    pub nodes: HashMap<NodeId, NodeDefinition>,

    /// Connections between nodes
    pub connections: Vec<Connection>,

    /// Variables declared on the root scope
    pub variables: Vec<VariableDef>,

    /// Root exception scope
    pub exception_scope: ExceptionScope,
}

impl ProcessDefinition {
    /// Create an empty definition
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ProcessId(id.into()),
            name: name.into(),
            nodes: HashMap::new(),
            connections: Vec::new(),
            variables: Vec::new(),
            exception_scope: ExceptionScope::new(),
        }
    }

    /// Add a node definition
    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    /// Declare a root-scope variable
    pub fn with_variable(mut self, variable: VariableDef) -> Self {
        self.variables.push(variable);
        self
    }

    /// Connect two nodes with the default connection type
    pub fn connect(self, from: &NodeId, to: &NodeId) -> Self {
        self.connect_typed(from, to, CONNECTION_DEFAULT)
    }

    /// Connect two nodes with an explicit connection type
    pub fn connect_typed(mut self, from: &NodeId, to: &NodeId, connection_type: &str) -> Self {
        self.connections.push(Connection {
            from: from.clone(),
            to: to.clone(),
            connection_type: connection_type.to_string(),
        });
        self
    }

    /// Replace the root exception scope
    pub fn with_exception_scope(mut self, scope: ExceptionScope) -> Self {
        self.exception_scope = scope;
        self
    }

    /// Look a node definition up by id
    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    /// Outgoing connections of a node, filtered by connection type
    pub fn outgoing(&self, from: &NodeId, connection_type: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| &c.from == from && c.connection_type == connection_type)
            .collect()
    }

    /// All start nodes of the graph
    pub fn start_nodes(&self) -> Vec<&NodeDefinition> {
        let mut starts: Vec<&NodeDefinition> = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .collect();
        starts.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        starts
    }
}

/// Static definition of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within the definition
    pub id: NodeId,

    /// Human-readable name
    pub name: String,

    /// What the node does
    pub kind: NodeKind,
}

impl NodeDefinition {
    /// A start node
    pub fn start(id: impl Into<String>) -> Self {
        Self::of(id, NodeKind::Start)
    }

    /// An end node
    pub fn end(id: impl Into<String>) -> Self {
        Self::of(id, NodeKind::End)
    }

    /// A script node evaluating an expression, optionally writing a variable
    pub fn script(
        id: impl Into<String>,
        expression: impl Into<String>,
        target: Option<&str>,
    ) -> Self {
        Self::of(
            id,
            NodeKind::Script(ScriptNode {
                expression: expression.into(),
                target: target.map(str::to_string),
            }),
        )
    }

    /// A wait node suspending until a named signal arrives
    pub fn wait(id: impl Into<String>, event: impl Into<String>, target: Option<&str>) -> Self {
        Self::of(
            id,
            NodeKind::Wait(WaitNode {
                event: event.into(),
                target: target.map(str::to_string),
            }),
        )
    }

    /// A rule-task node
    pub fn rule_task(id: impl Into<String>, node: RuleTaskNode) -> Self {
        Self::of(id, NodeKind::RuleTask(node))
    }

    /// A fan-out/fan-in loop node
    pub fn for_each(id: impl Into<String>, node: ForEachNode) -> Self {
        Self::of(id, NodeKind::ForEach(node))
    }

    fn of(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: NodeId(id),
            kind,
        }
    }

    /// Override the display name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether this node accepts an incoming connection of the given type
    pub fn accepts_incoming(&self, connection_type: &str) -> bool {
        connection_type == CONNECTION_DEFAULT
    }
}

/// The behavior variants a node definition can carry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    /// Process entry point
    Start,

    /// Process exit point
    End,

    /// Inline expression evaluation
    Script(ScriptNode),

    /// Suspension on a named signal
    Wait(WaitNode),

    /// Delegation to the external rule/decision engine
    RuleTask(RuleTaskNode),

    /// Fan-out/fan-in loop over a collection
    ForEach(ForEachNode),
}

/// Configuration of a script node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptNode {
    /// Expression evaluated against the visible variables
    pub expression: String,

    /// Variable the result is written to, when set
    pub target: Option<String>,
}

/// Configuration of a wait node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitNode {
    /// Signal name the node listens on
    pub event: String,

    /// Variable the signal payload is written to, when set
    pub target: Option<String>,
}

/// How a rule task talks to the rule/decision world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleType {
    /// Evaluate a decision model
    Decision {
        /// Model namespace; supports `#{name}` tokens
        namespace: String,
        /// Model name; supports `#{name}` tokens
        model: String,
    },

    /// Activate a named rule-flow group in the shared session
    RuleFlowGroup {
        /// Group name; supports `#{name}` tokens
        group: String,
    },

    /// Fire an isolated rule unit
    RuleUnit {
        /// Unit name
        unit: String,
    },
}

/// Configuration of a rule-task node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTaskNode {
    /// Evaluation mode
    pub rule_type: RuleType,

    /// Suspend on a signal instead of firing synchronously
    /// (RuleFlowGroup mode only)
    pub wait_state: bool,

    /// Input data associations
    pub inputs: Vec<DataAssociation>,

    /// Output data associations
    pub outputs: Vec<DataAssociation>,

    /// Static parameters; string values support `#{name}` tokens
    pub parameters: Map<String, Value>,
}

impl RuleTaskNode {
    /// Create a rule task for the given mode
    pub fn new(rule_type: RuleType) -> Self {
        Self {
            rule_type,
            wait_state: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: Map::new(),
        }
    }

    /// Suspend on the group signal instead of firing synchronously
    pub fn as_wait_state(mut self) -> Self {
        self.wait_state = true;
        self
    }

    /// Add an input data association
    pub fn with_input(mut self, association: DataAssociation) -> Self {
        self.inputs.push(association);
        self
    }

    /// Add an output data association
    pub fn with_output(mut self, association: DataAssociation) -> Self {
        self.outputs.push(association);
        self
    }

    /// Add a static parameter
    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Configuration of a fan-out/fan-in loop node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachNode {
    /// The immutable split/template/join subgraph descriptor
    pub descriptor: ForEachDescriptor,

    /// Expression producing the input collection
    pub collection_expression: String,

    /// Outer variable the accumulator is written to, when set
    pub output_collection: Option<String>,

    /// Short-circuit join predicate, evaluated after each completion
    pub completion_condition: Option<String>,

    /// Start children one at a time instead of all at once
    pub sequential: bool,

    /// Complete on the last child completion rather than the last start
    pub wait_for_completion: bool,

    /// Exception scope of the composite template
    pub exception_scope: ExceptionScope,
}

impl ForEachNode {
    /// Build a loop node, fixing the internal 3-node descriptor.
    ///
    /// The descriptor never changes after this call; the runtime only
    /// instantiates from it.
    pub fn build(
        node_id: &str,
        collection_expression: impl Into<String>,
        variable: VariableDef,
        output_variable: VariableDef,
        body: NodeId,
    ) -> Self {
        Self {
            descriptor: ForEachDescriptor {
                split: NodeId(format!("{}:split", node_id)),
                join: NodeId(format!("{}:join", node_id)),
                template: CompositeTemplate {
                    variable,
                    output_variable,
                    body,
                },
            },
            collection_expression: collection_expression.into(),
            output_collection: None,
            completion_condition: None,
            sequential: false,
            wait_for_completion: true,
            exception_scope: ExceptionScope::new(),
        }
    }

    /// Start children one at a time
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    /// Complete as soon as all children are started
    pub fn fire_and_forget(mut self) -> Self {
        self.wait_for_completion = false;
        self
    }

    /// Write the accumulator into this outer variable on completion
    pub fn with_output_collection(mut self, name: impl Into<String>) -> Self {
        self.output_collection = Some(name.into());
        self
    }

    /// Short-circuit the join when this expression evaluates true
    pub fn with_completion_condition(mut self, expression: impl Into<String>) -> Self {
        self.completion_condition = Some(expression.into());
        self
    }

    /// Attach an exception scope to the composite template
    pub fn with_exception_scope(mut self, scope: ExceptionScope) -> Self {
        self.exception_scope = scope;
        self
    }
}

/// The fixed internal subgraph of a loop node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachDescriptor {
    /// Synthetic split node id
    pub split: NodeId,

    /// Synthetic join node id
    pub join: NodeId,

    /// The per-iteration composite template
    pub template: CompositeTemplate,
}

/// Per-iteration template: loop variable, output variable, body node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeTemplate {
    /// The loop variable bound to one collection element
    pub variable: VariableDef,

    /// The per-iteration output variable read into the accumulator
    pub output_variable: VariableDef,

    /// The node instantiated once per element
    pub body: NodeId,
}

/// Declarative source→target binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAssociation {
    /// Source expressions or variable names
    pub sources: Vec<String>,

    /// Target variable name
    pub target: String,

    /// Optional transformation applied to the sources
    pub transformation: Option<Transformation>,

    /// Optional explicit assignment list
    pub assignments: Vec<Assignment>,
}

impl DataAssociation {
    /// A plain source→target association
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            sources: vec![source.into()],
            target: target.into(),
            transformation: None,
            assignments: Vec::new(),
        }
    }

    /// Route the sources through a transformation
    pub fn with_transformation(mut self, language: impl Into<String>, expression: impl Into<String>) -> Self {
        self.transformation = Some(Transformation {
            language: language.into(),
            expression: expression.into(),
        });
        self
    }

    /// Add an explicit assignment
    pub fn with_assignment(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.assignments.push(Assignment {
            from: from.into(),
            to: to.into(),
        });
        self
    }
}

/// A registered transformation reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    /// Expression-language id looked up in the transformation registry
    pub language: String,

    /// The compiled expression handed to the transformer
    pub expression: String,
}

/// One explicit assignment inside a data association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Expression evaluated against the result bag
    pub from: String,

    /// Target variable name
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data_type::DataType;

    #[test]
    fn test_definition_builder_and_lookup() {
        let start = NodeId::new("start");
        let end = NodeId::new("end");
        let definition = ProcessDefinition::new("orders", "Order handling")
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::end("end"))
            .with_variable(VariableDef::untyped("order"))
            .connect(&start, &end);

        assert_eq!(definition.id, ProcessId("orders".to_string()));
        assert!(definition.node(&start).is_some());
        assert!(definition.node(&NodeId::new("missing")).is_none());

        let outgoing = definition.outgoing(&start, CONNECTION_DEFAULT);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].to, end);
        assert!(definition.outgoing(&start, "error").is_empty());
    }

    #[test]
    fn test_start_nodes_are_ordered() {
        let definition = ProcessDefinition::new("p", "p")
            .with_node(NodeDefinition::start("b-start"))
            .with_node(NodeDefinition::start("a-start"))
            .with_node(NodeDefinition::end("end"));

        let starts: Vec<&str> = definition
            .start_nodes()
            .iter()
            .map(|n| n.id.0.as_str())
            .collect();
        assert_eq!(starts, vec!["a-start", "b-start"]);
    }

    #[test]
    fn test_for_each_factory_fixes_descriptor() {
        let node = ForEachNode::build(
            "approve-items",
            "items",
            VariableDef::untyped("item"),
            VariableDef::untyped("approved"),
            NodeId::new("approve-one"),
        )
        .sequential()
        .with_output_collection("approvals");

        assert_eq!(node.descriptor.split, NodeId::new("approve-items:split"));
        assert_eq!(node.descriptor.join, NodeId::new("approve-items:join"));
        assert_eq!(node.descriptor.template.body, NodeId::new("approve-one"));
        assert_eq!(node.descriptor.template.variable.name, "item");
        assert_eq!(node.descriptor.template.output_variable.name, "approved");
        assert!(node.sequential);
        assert!(node.wait_for_completion);
        assert_eq!(node.output_collection.as_deref(), Some("approvals"));
    }

    #[test]
    fn test_nodes_accept_only_default_connections() {
        let node = NodeDefinition::script("calc", "a", Some("b"));
        assert!(node.accepts_incoming(CONNECTION_DEFAULT));
        assert!(!node.accepts_incoming("error"));
    }

    #[test]
    fn test_data_association_builders() {
        let association = DataAssociation::new("result", "total")
            .with_transformation("jmespath", "amounts | sum(@)");
        assert_eq!(association.sources, vec!["result".to_string()]);
        assert_eq!(association.target, "total");
        assert!(association.transformation.is_some());

        let with_assignments =
            DataAssociation::new("result", "total").with_assignment("result.amount", "amount");
        assert_eq!(with_assignments.assignments.len(), 1);
    }

    #[test]
    fn test_definition_serde_round_trip() {
        let body = NodeId::new("body");
        let definition = ProcessDefinition::new("p", "p")
            .with_node(NodeDefinition::start("start"))
            .with_node(NodeDefinition::for_each(
                "loop",
                ForEachNode::build(
                    "loop",
                    "items",
                    VariableDef::new("item", DataType::object("string")),
                    VariableDef::untyped("out"),
                    body,
                ),
            ))
            .with_node(NodeDefinition::end("end"));

        let serialized = serde_json::to_string(&definition).unwrap();
        let deserialized: ProcessDefinition = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.id, definition.id);
        assert_eq!(deserialized.nodes.len(), 3);
    }
}
