use crate::error::DefinitionError;
use crate::value::{Value, Variables};
use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Kind of a flow node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task,
    ExclusiveGateway,
    ParallelGateway,
    EventBasedGateway,
    IntermediateCatchEvent,
}

impl NodeKind {
    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            NodeKind::ExclusiveGateway | NodeKind::ParallelGateway | NodeKind::EventBasedGateway
        )
    }
}

/// What an intermediate catch event waits for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatchEventDefinition {
    Message {
        name: String,
        /// Expression evaluated against the token payload when subscribing.
        correlation_key: String,
    },
    Timer {
        duration_ms: u64,
    },
}

/// Flow node in a process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_event: Option<CatchEventDefinition>,
    /// Variables a task merges into the token payload on completion.
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub outputs: Variables,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            catch_event: None,
            outputs: Variables::new(),
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Task)
    }

    pub fn exclusive_gateway(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::ExclusiveGateway)
    }

    pub fn parallel_gateway(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::ParallelGateway)
    }

    pub fn event_based_gateway(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::EventBasedGateway)
    }

    pub fn message_catch(
        id: impl Into<String>,
        message_name: impl Into<String>,
        correlation_key: impl Into<String>,
    ) -> Self {
        let mut node = Self::new(id, NodeKind::IntermediateCatchEvent);
        node.catch_event = Some(CatchEventDefinition::Message {
            name: message_name.into(),
            correlation_key: correlation_key.into(),
        });
        node
    }

    pub fn timer_catch(id: impl Into<String>, duration_ms: u64) -> Self {
        let mut node = Self::new(id, NodeKind::IntermediateCatchEvent);
        node.catch_event = Some(CatchEventDefinition::Timer { duration_ms });
        node
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// Write the value to the target, replacing what is there.
    #[default]
    Put,
    /// Append the value to an array at the target.
    Collect,
}

/// Maps a branch value into the joined payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: MappingKind,
}

/// Directed edge between two flow nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload_mappings: Vec<PayloadMapping>,
}

impl SequenceFlow {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            is_default: false,
            payload_mappings: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_mapping(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.payload_mappings.push(PayloadMapping {
            source: source.into(),
            target: target.into(),
            kind: MappingKind::Put,
        });
        self
    }

    pub fn with_collect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.payload_mappings.push(PayloadMapping {
            source: source.into(),
            target: target.into(),
            kind: MappingKind::Collect,
        });
        self
    }
}

/// Immutable, validated process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub bpmn_process_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub flows: Vec<SequenceFlow>,
}

impl ProcessDefinition {
    pub fn new(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            name: None,
            nodes: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) {
        self.nodes.push(node);
    }

    pub fn add_flow(&mut self, flow: SequenceFlow) {
        self.flows.push(flow);
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.add_node(node);
        self
    }

    pub fn with_flow(mut self, flow: SequenceFlow) -> Self {
        self.add_flow(flow);
        self
    }

    /// Shorthand for an unconditional flow.
    pub fn connect(
        self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.with_flow(SequenceFlow::new(id, source, target))
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn start_node(&self) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Start)
    }

    /// Outgoing flows of an element, in declaration order.
    pub fn outgoing(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.source == element_id).collect()
    }

    /// Incoming flows of an element, in declaration order.
    pub fn incoming(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.target == element_id).collect()
    }

    /// A parallel gateway with more than one incoming flow synchronizes them.
    pub fn is_join(&self, element_id: &str) -> bool {
        self.find_node(element_id)
            .map(|n| n.kind == NodeKind::ParallelGateway)
            .unwrap_or(false)
            && self.incoming(element_id).len() > 1
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(DefinitionError::DuplicateId(node.id.clone()));
            }
        }

        let mut flow_ids = HashSet::new();
        for flow in &self.flows {
            if !flow_ids.insert(flow.id.as_str()) || node_ids.contains(flow.id.as_str()) {
                return Err(DefinitionError::DuplicateId(flow.id.clone()));
            }
            for endpoint in [&flow.source, &flow.target] {
                if !node_ids.contains(endpoint.as_str()) {
                    return Err(DefinitionError::UnknownElement(endpoint.clone()));
                }
            }
        }

        let starts: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Start)
            .collect();
        if starts.len() != 1 {
            return Err(DefinitionError::Invalid(format!(
                "expected exactly one start event, found {}",
                starts.len()
            )));
        }

        for node in &self.nodes {
            self.validate_node(node)?;
        }

        self.validate_reachability(&starts[0].id)
    }

    fn validate_node(&self, node: &NodeSpec) -> Result<(), DefinitionError> {
        let outgoing = self.outgoing(&node.id);
        let incoming = self.incoming(&node.id);

        if node.kind != NodeKind::ExclusiveGateway {
            if let Some(flow) = outgoing.iter().find(|f| f.condition.is_some() || f.is_default) {
                return Err(DefinitionError::Invalid(format!(
                    "flow '{}' has a condition but '{}' is not an exclusive gateway",
                    flow.id, node.id
                )));
            }
        }

        match node.kind {
            NodeKind::Start if !incoming.is_empty() => Err(DefinitionError::Invalid(format!(
                "start event '{}' has incoming flows",
                node.id
            ))),
            NodeKind::End if !outgoing.is_empty() => Err(DefinitionError::Invalid(format!(
                "end event '{}' has outgoing flows",
                node.id
            ))),
            NodeKind::IntermediateCatchEvent if node.catch_event.is_none() => {
                Err(DefinitionError::Invalid(format!(
                    "catch event '{}' has no event definition",
                    node.id
                )))
            }
            NodeKind::ExclusiveGateway if outgoing.iter().filter(|f| f.is_default).count() > 1 => {
                Err(DefinitionError::Invalid(format!(
                    "exclusive gateway '{}' has more than one default flow",
                    node.id
                )))
            }
            NodeKind::EventBasedGateway => self.validate_event_based_gateway(node, &outgoing),
            _ => Ok(()),
        }
    }

    fn validate_event_based_gateway(
        &self,
        node: &NodeSpec,
        outgoing: &[&SequenceFlow],
    ) -> Result<(), DefinitionError> {
        if outgoing.len() < 2 {
            return Err(DefinitionError::Invalid(format!(
                "event-based gateway '{}' needs at least two outgoing flows",
                node.id
            )));
        }

        let mut message_names = HashSet::new();
        for flow in outgoing {
            let target = self
                .find_node(&flow.target)
                .ok_or_else(|| DefinitionError::UnknownElement(flow.target.clone()))?;

            match &target.catch_event {
                Some(CatchEventDefinition::Message { name, .. })
                    if target.kind == NodeKind::IntermediateCatchEvent =>
                {
                    if !message_names.insert(name.as_str()) {
                        return Err(DefinitionError::Invalid(format!(
                            "event-based gateway '{}' waits for message '{}' twice",
                            node.id, name
                        )));
                    }
                }
                Some(CatchEventDefinition::Timer { .. })
                    if target.kind == NodeKind::IntermediateCatchEvent => {}
                _ => {
                    return Err(DefinitionError::Invalid(format!(
                        "event-based gateway '{}' must only lead to catch events, found '{}'",
                        node.id, target.id
                    )))
                }
            }
        }

        Ok(())
    }

    fn validate_reachability(&self, start_id: &str) -> Result<(), DefinitionError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut node_to_index = HashMap::new();

        for node in &self.nodes {
            let idx = graph.add_node(node.id.as_str());
            node_to_index.insert(node.id.as_str(), idx);
        }

        for flow in &self.flows {
            let from_idx = node_to_index
                .get(flow.source.as_str())
                .ok_or_else(|| DefinitionError::UnknownElement(flow.source.clone()))?;
            let to_idx = node_to_index
                .get(flow.target.as_str())
                .ok_or_else(|| DefinitionError::UnknownElement(flow.target.clone()))?;
            graph.add_edge(*from_idx, *to_idx, ());
        }

        let start_idx = node_to_index
            .get(start_id)
            .ok_or_else(|| DefinitionError::UnknownElement(start_id.to_string()))?;

        let mut reached = HashSet::new();
        let mut dfs = Dfs::new(&graph, *start_idx);
        while let Some(idx) = dfs.next(&graph) {
            reached.insert(idx);
        }

        match graph.node_indices().find(|idx| !reached.contains(idx)) {
            Some(idx) => Err(DefinitionError::Unreachable(graph[idx].to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exclusive_split() -> ProcessDefinition {
        ProcessDefinition::new("workflow")
            .with_node(NodeSpec::start("start"))
            .with_node(NodeSpec::exclusive_gateway("xor"))
            .with_node(NodeSpec::end("a"))
            .with_node(NodeSpec::end("b"))
            .with_node(NodeSpec::end("c"))
            .connect("s1", "start", "xor")
            .with_flow(SequenceFlow::new("s2", "xor", "a").with_condition("foo < 5"))
            .with_flow(SequenceFlow::new("s3", "xor", "b").with_condition("foo >= 5 && foo < 10"))
            .with_flow(SequenceFlow::new("s4", "xor", "c").as_default())
    }

    #[test]
    fn accepts_valid_definition() {
        let definition = exclusive_split();
        assert!(definition.validate().is_ok());

        let outgoing: Vec<_> = definition.outgoing("xor").iter().map(|f| f.id.as_str()).collect();
        assert_eq!(outgoing, vec!["s2", "s3", "s4"]);
        assert!(!definition.is_join("xor"));
    }

    #[test]
    fn rejects_unknown_flow_target() {
        let definition = exclusive_split().connect("s5", "a", "missing");
        assert_eq!(
            definition.validate(),
            Err(DefinitionError::UnknownElement("missing".into()))
        );
    }

    #[test]
    fn rejects_unreachable_nodes() {
        let definition = exclusive_split().with_node(NodeSpec::task("orphan"));
        assert_eq!(
            definition.validate(),
            Err(DefinitionError::Unreachable("orphan".into()))
        );
    }

    #[test]
    fn rejects_duplicate_message_names_after_event_based_gateway() {
        let definition = ProcessDefinition::new("race")
            .with_node(NodeSpec::start("start"))
            .with_node(NodeSpec::event_based_gateway("gateway"))
            .with_node(NodeSpec::message_catch("m1", "msg", "key"))
            .with_node(NodeSpec::message_catch("m2", "msg", "key"))
            .with_node(NodeSpec::end("end"))
            .connect("s1", "start", "gateway")
            .connect("s2", "gateway", "m1")
            .connect("s3", "gateway", "m2")
            .connect("s4", "m1", "end")
            .connect("s5", "m2", "end");

        assert!(matches!(
            definition.validate(),
            Err(DefinitionError::Invalid(_))
        ));
    }

    #[test]
    fn detects_parallel_join() {
        let definition = ProcessDefinition::new("join")
            .with_node(NodeSpec::start("start"))
            .with_node(NodeSpec::parallel_gateway("fork"))
            .with_node(NodeSpec::parallel_gateway("join"))
            .with_node(NodeSpec::end("end"))
            .connect("s1", "start", "fork")
            .connect("s2", "fork", "join")
            .connect("s3", "fork", "join")
            .connect("s4", "join", "end");

        assert!(definition.validate().is_ok());
        assert!(definition.is_join("join"));
        assert!(!definition.is_join("fork"));
    }

    #[test]
    fn loads_from_json() {
        let json = r#"{
            "bpmn_process_id": "timer",
            "nodes": [
                { "id": "start", "kind": "start" },
                { "id": "wait", "kind": "intermediate_catch_event",
                  "catch_event": { "type": "timer", "duration_ms": 100 } },
                { "id": "end", "kind": "end" }
            ],
            "flows": [
                { "id": "s1", "source": "start", "target": "wait" },
                { "id": "s2", "source": "wait", "target": "end" }
            ]
        }"#;

        let definition: ProcessDefinition = serde_json::from_str(json).unwrap();
        assert!(definition.validate().is_ok());
        assert_eq!(
            definition.find_node("wait").and_then(|n| n.catch_event.clone()),
            Some(CatchEventDefinition::Timer { duration_ms: 100 })
        );
    }
}
