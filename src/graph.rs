use crate::backend::BackendId;
use crate::tensor::TensorValue;
use std::collections::{HashMap, HashSet};

pub type NodeId = usize;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate initializer \"{0}\"")]
    DuplicateInitializer(String),
    #[error("Graph is not topologically resolvable: cycle through value \"{0}\"")]
    CyclicDependency(String),
    #[error("Node {0} already has an assigned backend")]
    BackendAlreadyAssigned(NodeId),
    #[error("Unknown node id {0}")]
    UnknownNode(NodeId),
}

#[derive(Debug)]
pub struct Node {
    name: Option<String>,
    op_type: String,
    domain: String,
    since_version: usize,
    inputs: Vec<String>,
    outputs: Vec<String>,
    subgraphs: HashMap<String, Graph>,
    assigned_backend: Option<BackendId>,
}

impl Node {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn since_version(&self) -> usize {
        self.since_version
    }

    pub fn get_inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn get_outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn get_subgraphs(&self) -> &HashMap<String, Graph> {
        &self.subgraphs
    }

    pub(crate) fn get_subgraphs_mut(&mut self) -> &mut HashMap<String, Graph> {
        &mut self.subgraphs
    }

    pub fn has_subgraphs(&self) -> bool {
        !self.subgraphs.is_empty()
    }

    pub fn assigned_backend(&self) -> Option<BackendId> {
        self.assigned_backend
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    ir_version: usize,
    nodes: Vec<Node>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    outer_scope_names: HashSet<String>,
    initializers: HashMap<String, TensorValue>,
}

impl Graph {
    pub fn ir_version(&self) -> usize {
        self.ir_version
    }

    pub fn get_nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn get_inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn get_outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn get_outer_scope_names(&self) -> &HashSet<String> {
        &self.outer_scope_names
    }

    pub fn get_initializers(&self) -> &HashMap<String, TensorValue> {
        &self.initializers
    }

    pub fn get_initializer(&self, name: &str) -> Option<&TensorValue> {
        self.initializers.get(name)
    }

    /// An initializer is constant unless the graph's IR version permits
    /// run-time overrides (>= 4) and a graph input shares its name.
    pub fn is_constant_initializer(&self, name: &str) -> bool {
        if !self.initializers.contains_key(name) {
            return false;
        }
        if self.ir_version < 4 {
            return true;
        }
        !self.inputs.iter().any(|x| x == name)
    }

    /// Whether any nested subgraph (at any depth) pulls this name in as an
    /// outer-scope value.
    pub fn is_used_by_subgraphs(&self, name: &str) -> bool {
        for node in &self.nodes {
            for subgraph in node.subgraphs.values() {
                if subgraph.outer_scope_names.contains(name)
                    || subgraph.is_used_by_subgraphs(name)
                {
                    return true;
                }
            }
        }
        false
    }

    /// All (node, input index) pairs consuming the named value in this graph.
    pub fn get_consumers(&self, name: &str) -> Vec<(NodeId, usize)> {
        let mut results = Vec::new();
        for (node_id, node) in self.nodes.iter().enumerate() {
            for (input_index, input) in node.inputs.iter().enumerate() {
                if input == name {
                    results.push((node_id, input_index));
                }
            }
        }
        results
    }

    /// Node ids in a valid execution order, resolved through value names.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut producers: HashMap<&str, NodeId> = HashMap::new();
        for (node_id, node) in self.nodes.iter().enumerate() {
            for output in &node.outputs {
                producers.insert(output.as_str(), node_id);
            }
        }

        let mut pending_inputs: Vec<usize> = vec![0; self.nodes.len()];
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (node_id, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                if let Some(producer) = producers.get(input.as_str()) {
                    pending_inputs[node_id] += 1;
                    dependents.entry(*producer).or_default().push(node_id);
                }
            }
        }

        // Min-heap on node id keeps the order deterministic across runs.
        let node_count = self.nodes.len();
        let mut ready: std::collections::BinaryHeap<std::cmp::Reverse<NodeId>> = (0..node_count)
            .filter(|x| pending_inputs[*x] == 0)
            .map(std::cmp::Reverse)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(std::cmp::Reverse(node_id)) = ready.pop() {
            order.push(node_id);
            if let Some(consumers) = dependents.get(&node_id) {
                for consumer in consumers {
                    pending_inputs[*consumer] -= 1;
                    if pending_inputs[*consumer] == 0 {
                        ready.push(std::cmp::Reverse(*consumer));
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .find(|x| pending_inputs[*x] > 0)
                .and_then(|x| self.nodes[x].outputs.first())
                .cloned()
                .unwrap_or_default();
            return Err(GraphError::CyclicDependency(stuck));
        }
        Ok(order)
    }

    /// Records the partitioning decision for a node. May be set only once.
    pub fn assign_backend(&mut self, node_id: NodeId, backend: BackendId) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or(GraphError::UnknownNode(node_id))?;
        if node.assigned_backend.is_some() {
            return Err(GraphError::BackendAlreadyAssigned(node_id));
        }
        node.assigned_backend = Some(backend);
        Ok(())
    }
}

pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(ir_version: usize) -> Self {
        Self {
            graph: Graph {
                ir_version,
                ..Graph::default()
            },
        }
    }

    pub fn add_input(&mut self, name: &str) -> &mut Self {
        self.graph.inputs.push(name.to_string());
        self
    }

    pub fn add_output(&mut self, name: &str) -> &mut Self {
        self.graph.outputs.push(name.to_string());
        self
    }

    /// Declares a name resolved from an enclosing graph rather than produced
    /// or initialized at this level.
    pub fn add_outer_scope_name(&mut self, name: &str) -> &mut Self {
        self.graph.outer_scope_names.insert(name.to_string());
        self
    }

    pub fn add_node(
        &mut self,
        name: Option<String>,
        op_type: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> NodeId {
        self.add_node_full(name, op_type, "", 1, inputs, outputs, HashMap::new())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_node_full(
        &mut self,
        name: Option<String>,
        op_type: &str,
        domain: &str,
        since_version: usize,
        inputs: Vec<String>,
        outputs: Vec<String>,
        subgraphs: HashMap<String, Graph>,
    ) -> NodeId {
        let node_id = self.graph.nodes.len();
        self.graph.nodes.push(Node {
            name,
            op_type: op_type.to_string(),
            domain: domain.to_string(),
            since_version,
            inputs,
            outputs,
            subgraphs,
            assigned_backend: None,
        });
        node_id
    }

    pub fn add_initializer(&mut self, name: &str, value: TensorValue) -> Result<(), GraphError> {
        if self.graph.initializers.contains_key(name) {
            return Err(GraphError::DuplicateInitializer(name.to_string()));
        }
        self.graph.initializers.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_inner(self) -> Graph {
        self.graph
    }
}
