use crate::backend::{BackendId, ExecutionBackends};
use crate::graph::{Graph, GraphError, NodeId};
use crate::kernel::KernelCatalog;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("No execution backend can run operator \"{op_type}\" (node \"{node_name}\")")]
    Unassignable { op_type: String, node_name: String },
    #[error("Resource-aware partitioning requires a fallback backend")]
    NoFallbackForBudget,
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error("Failed to load partition cost table")]
    CostTableError(#[from] anyhow::Error),
}

#[derive(Debug, Default, Deserialize)]
struct CostTableFile {
    #[serde(default)]
    default_cost: Option<f64>,
    costs: HashMap<String, f64>,
}

/// Estimated execution cost per node or operator identity, consulted when a
/// budget restricts how much work non-fallback backends may take.
#[derive(Clone, Debug)]
pub struct CostTable {
    costs: HashMap<String, f64>,
    default_cost: f64,
}

impl CostTable {
    pub const DEFAULT_COST: f64 = 1.0;

    pub fn new(costs: HashMap<String, f64>, default_cost: f64) -> Self {
        Self {
            costs,
            default_cost,
        }
    }

    /// Node-name entries take precedence over operator-type entries; absent
    /// both, the default cost applies.
    pub fn cost_for(&self, node_name: Option<&str>, op_type: &str) -> f64 {
        if let Some(name) = node_name
            && let Some(cost) = self.costs.get(name)
        {
            return *cost;
        }
        self.costs
            .get(op_type)
            .copied()
            .unwrap_or(self.default_cost)
    }
}

/// A (budget, cost table) pair enabling resource-aware partitioning.
#[derive(Clone, Debug)]
pub struct BudgetConfig {
    pub budget: f64,
    pub costs: CostTable,
}

impl BudgetConfig {
    pub fn new(budget: f64, costs: CostTable) -> Self {
        Self { budget, costs }
    }

    pub fn from_file(budget: f64, path: &Path) -> Result<Self, PartitionError> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading cost table {}", path.display()))?;
        let file: CostTableFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing cost table {}", path.display()))?;
        Ok(Self::new(
            budget,
            CostTable::new(
                file.costs,
                file.default_cost.unwrap_or(CostTable::DEFAULT_COST),
            ),
        ))
    }

    /// Parses the `"<budget>,<cost-table-path>"` form carried in session
    /// configuration entries.
    pub fn from_config_value(value: &str) -> Result<Self, PartitionError> {
        let (budget_str, path_str) = value
            .split_once(',')
            .ok_or_else(|| anyhow::anyhow!("expected \"<budget>,<path>\", got {:?}", value))?;
        let budget: f64 = budget_str
            .trim()
            .parse()
            .with_context(|| format!("parsing budget {:?}", budget_str))?;
        Self::from_file(budget, Path::new(path_str.trim()))
    }
}

/// Assigns every node in a graph (and its nested subgraphs) to an execution
/// backend.
pub struct GraphPartitioner<'a> {
    backends: &'a ExecutionBackends,
    catalog: &'a KernelCatalog,
}

impl<'a> GraphPartitioner<'a> {
    pub fn new(backends: &'a ExecutionBackends, catalog: &'a KernelCatalog) -> Self {
        Self { backends, catalog }
    }

    /// Queries backends in priority order; the first claim wins. Unclaimed
    /// nodes fall back to the designated fallback backend when it both
    /// claims the node and has a kernel for it, else partitioning fails
    /// naming the operator. With a budget, contiguous non-fallback runs
    /// exceeding it are demoted node-by-node onto the fallback.
    ///
    /// On success every node carries exactly one assigned backend.
    pub fn partition(
        &self,
        graph: &mut Graph,
        budget: Option<&BudgetConfig>,
    ) -> Result<(), PartitionError> {
        let topo = graph.topo_order()?;

        let mut assignments: Vec<Option<BackendId>> = vec![None; graph.get_nodes().len()];

        for (backend_id, backend) in self.backends.iter_priority() {
            // The fallback takes leftovers in the defaulting step below, with
            // the extra requirement that a kernel actually exists for it.
            if Some(backend_id) == self.backends.fallback_id() {
                continue;
            }
            if let Some(groups) = backend.claim_node_groups(graph) {
                for group in groups {
                    for node_id in group {
                        if node_id < assignments.len() && assignments[node_id].is_none() {
                            assignments[node_id] = Some(backend_id);
                        }
                    }
                }
            }
            for node_id in &topo {
                if assignments[*node_id].is_none()
                    && backend.can_execute(&graph.get_nodes()[*node_id])
                {
                    assignments[*node_id] = Some(backend_id);
                }
            }
        }

        for node_id in &topo {
            if assignments[*node_id].is_some() {
                continue;
            }
            let node = &graph.get_nodes()[*node_id];
            let fallback = self.backends.fallback_id().and_then(|id| {
                let backend = self.backends.get(id)?;
                (backend.can_execute(node) && self.catalog.has_kernel(node, backend.name()))
                    .then_some(id)
            });
            match fallback {
                Some(id) => assignments[*node_id] = Some(id),
                None => {
                    return Err(PartitionError::Unassignable {
                        op_type: node.op_type().to_string(),
                        node_name: node.name().unwrap_or_default().to_string(),
                    });
                }
            }
        }

        if let Some(budget) = budget {
            self.apply_budget(graph, &topo, &mut assignments, budget)?;
        }

        for (node_id, assignment) in assignments.iter().enumerate() {
            if let Some(backend_id) = assignment {
                graph.assign_backend(node_id, *backend_id)?;
            }
        }

        // Nested subgraphs are partitioned independently with the same
        // backend list; outer-scope names arrive already resolved and carry
        // no assignment of their own.
        let node_count = graph.get_nodes().len();
        for node_id in 0..node_count {
            let subgraph_attrs: Vec<String> = graph.get_nodes()[node_id]
                .get_subgraphs()
                .keys()
                .cloned()
                .collect();
            for attr in subgraph_attrs {
                let subgraph = graph
                    .get_node_mut(node_id)
                    .and_then(|n| n.get_subgraphs_mut().get_mut(&attr));
                if let Some(subgraph) = subgraph {
                    self.partition(subgraph, budget)?;
                }
            }
        }

        Ok(())
    }

    fn apply_budget(
        &self,
        graph: &Graph,
        topo: &[NodeId],
        assignments: &mut [Option<BackendId>],
        budget: &BudgetConfig,
    ) -> Result<(), PartitionError> {
        let fallback = self
            .backends
            .fallback_id()
            .ok_or(PartitionError::NoFallbackForBudget)?;

        // Contiguous runs of non-fallback nodes, in topological order.
        let mut runs: Vec<Vec<(usize, NodeId)>> = Vec::new();
        let mut current: Vec<(usize, NodeId)> = Vec::new();
        for (topo_pos, node_id) in topo.iter().enumerate() {
            if assignments[*node_id].is_some_and(|x| x != fallback) {
                current.push((topo_pos, *node_id));
            } else if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }

        for run in runs {
            let mut costed: Vec<(f64, usize, NodeId)> = run
                .iter()
                .map(|(topo_pos, node_id)| {
                    let node = &graph.get_nodes()[*node_id];
                    (
                        budget.costs.cost_for(node.name(), node.op_type()),
                        *topo_pos,
                        *node_id,
                    )
                })
                .collect();
            let mut total: f64 = costed.iter().map(|(cost, _, _)| *cost).sum();
            if total <= budget.budget {
                continue;
            }

            // Demote the cheapest nodes first (smallest marginal benefit of
            // staying off the fallback), earliest topological position on
            // ties.
            costed.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            for (cost, _, node_id) in &costed {
                if total <= budget.budget {
                    break;
                }
                log::debug!(
                    "budget {} exceeded (run total {}): demoting node {} to fallback",
                    budget.budget,
                    total,
                    node_id
                );
                assignments[*node_id] = Some(fallback);
                total -= cost;
            }
        }

        Ok(())
    }
}
