mod common;

use common::*;
use mosaic_tensor::backend::{CpuBackend, ExecutionBackend, ExecutionBackends};
use mosaic_tensor::graph::{Graph, GraphBuilder, NodeId};
use mosaic_tensor::kernel::{KernelCatalog, KernelDef};
use mosaic_tensor::partition::{BudgetConfig, CostTable, GraphPartitioner, PartitionError};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

/// input -> MatMul -> Relu -> Add -> output chain.
fn chain_graph(ops: &[&str]) -> Graph {
    let mut builder = GraphBuilder::new(7);
    builder.add_input("x0");
    for (i, op) in ops.iter().enumerate() {
        builder.add_node(
            Some(format!("n{i}")),
            op,
            vec![format!("x{i}")],
            vec![format!("x{}", i + 1)],
        );
    }
    builder.add_output(&format!("x{}", ops.len()));
    builder.get_inner()
}

fn catalog_for(ops: &[&str], backend: &str) -> KernelCatalog {
    let mut catalog = KernelCatalog::new();
    for op in ops {
        catalog.register(
            KernelDef::new(op, "", backend, 1),
            Box::new(|_| Ok(Box::new(PlainKernel))),
        );
    }
    catalog
}

fn assigned_names(graph: &Graph, backends: &ExecutionBackends) -> Vec<String> {
    graph
        .get_nodes()
        .iter()
        .map(|node| {
            let id = node.assigned_backend().expect("assigned");
            backends.get(id).expect("backend").name().to_string()
        })
        .collect()
}

#[test]
fn every_node_gets_exactly_one_backend() {
    init_logging();
    let mut graph = chain_graph(&["MatMul", "Relu", "Add"]);
    let mut backends = ExecutionBackends::new();
    backends
        .add(Box::new(AccelBackend::new("accel", ["MatMul"])))
        .unwrap();
    backends.add_fallback(Box::new(CpuBackend::new())).unwrap();
    let catalog = catalog_for(&["MatMul", "Relu", "Add"], "cpu");

    GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, None)
        .unwrap();

    assert_eq!(assigned_names(&graph, &backends), ["accel", "cpu", "cpu"]);
}

#[test]
fn first_claiming_backend_wins() {
    let mut graph = chain_graph(&["MatMul"]);
    let mut backends = ExecutionBackends::new();
    backends
        .add(Box::new(AccelBackend::new("accel_a", ["MatMul"])))
        .unwrap();
    backends
        .add(Box::new(AccelBackend::new("accel_b", ["MatMul"])))
        .unwrap();
    backends.add_fallback(Box::new(CpuBackend::new())).unwrap();
    let catalog = catalog_for(&["MatMul"], "cpu");

    GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, None)
        .unwrap();

    assert_eq!(assigned_names(&graph, &backends), ["accel_a"]);
}

#[test]
fn unassignable_operator_is_fatal() {
    let mut graph = chain_graph(&["Weird"]);
    let mut backends = ExecutionBackends::new();
    backends
        .add_fallback(Box::new(CpuBackend::with_unsupported_ops([
            "Weird".to_string()
        ])))
        .unwrap();
    let catalog = catalog_for(&["Weird"], "cpu");

    let err = GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, None)
        .unwrap_err();
    match err {
        PartitionError::Unassignable { op_type, .. } => assert_eq!(op_type, "Weird"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(graph.get_nodes().iter().all(|n| n.assigned_backend().is_none()));
}

#[test]
fn fallback_default_requires_a_kernel() {
    let mut graph = chain_graph(&["Relu"]);
    let backends = cpu_only_backends();
    // Capability claims the node, but the catalog has nothing for it.
    let catalog = KernelCatalog::new();

    let err = GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, None)
        .unwrap_err();
    assert!(matches!(err, PartitionError::Unassignable { .. }));
}

struct GroupClaimBackend {
    group: Vec<NodeId>,
}

impl ExecutionBackend for GroupClaimBackend {
    fn name(&self) -> &str {
        "fused"
    }

    fn can_execute(&self, _node: &mosaic_tensor::graph::Node) -> bool {
        false
    }

    fn claim_node_groups(&self, _graph: &Graph) -> Option<Vec<Vec<NodeId>>> {
        Some(vec![self.group.clone()])
    }

    fn default_memory_space(&self) -> mosaic_tensor::allocator::MemorySpace {
        mosaic_tensor::allocator::MemorySpace::new("fused")
    }
}

#[test]
fn fused_group_claims_take_their_nodes() {
    let mut graph = chain_graph(&["MatMul", "Add", "Relu"]);
    let mut backends = ExecutionBackends::new();
    backends
        .add(Box::new(GroupClaimBackend { group: vec![0, 1] }))
        .unwrap();
    backends.add_fallback(Box::new(CpuBackend::new())).unwrap();
    let catalog = catalog_for(&["MatMul", "Add", "Relu"], "cpu");

    GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, None)
        .unwrap();

    assert_eq!(assigned_names(&graph, &backends), ["fused", "fused", "cpu"]);
}

#[test]
fn subgraph_nodes_are_partitioned_too() {
    let (mut graph, if_node) = graph_with_subgraphs(packing_weight());
    let backends = cpu_only_backends();
    let catalog = packing_catalog(Arc::new(KernelCounters::default()));

    GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, None)
        .unwrap();

    for node in graph.get_nodes() {
        assert!(node.assigned_backend().is_some());
    }
    for subgraph in graph.get_nodes()[if_node].get_subgraphs().values() {
        for node in subgraph.get_nodes() {
            assert!(node.assigned_backend().is_some());
        }
    }
}

fn budget_setup() -> (Graph, ExecutionBackends, KernelCatalog, CostTable) {
    let graph = chain_graph(&["MatMul", "Gemm", "Conv", "Attention"]);
    let mut backends = ExecutionBackends::new();
    backends
        .add(Box::new(AccelBackend::new(
            "accel",
            ["MatMul", "Gemm", "Conv", "Attention"],
        )))
        .unwrap();
    backends.add_fallback(Box::new(CpuBackend::new())).unwrap();
    let catalog = catalog_for(&["MatMul", "Gemm", "Conv", "Attention"], "cpu");
    let costs = CostTable::new(
        HashMap::from([
            ("n0".to_string(), 1.0),
            ("n1".to_string(), 2.0),
            ("n2".to_string(), 3.0),
            ("n3".to_string(), 4.0),
        ]),
        1.0,
    );
    (graph, backends, catalog, costs)
}

fn offloaded(graph: &Graph, backends: &ExecutionBackends) -> HashSet<String> {
    graph
        .get_nodes()
        .iter()
        .filter(|node| {
            let id = node.assigned_backend().expect("assigned");
            backends.get(id).expect("backend").name() == "cpu"
        })
        .map(|node| node.name().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn unrestricted_budget_matches_capability_assignment() {
    let (mut graph, backends, catalog, costs) = budget_setup();
    let budget = BudgetConfig::new(1e9, costs);
    GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, Some(&budget))
        .unwrap();
    assert!(offloaded(&graph, &backends).is_empty());
}

#[test]
fn budget_demotes_cheapest_nodes_first() {
    let (mut graph, backends, catalog, costs) = budget_setup();
    // Total cost 10: demoting n0 (1) and n1 (2) and n2 (3) brings the run
    // to 4, the first point under a budget of 5.
    let budget = BudgetConfig::new(5.0, costs);
    GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, Some(&budget))
        .unwrap();
    let cpu_nodes = offloaded(&graph, &backends);
    assert_eq!(
        cpu_nodes,
        HashSet::from(["n0".to_string(), "n1".to_string(), "n2".to_string()])
    );
}

#[test]
fn budget_monotonicity() {
    let budgets = [2.0, 4.0, 6.0, 8.0, 10.0];
    let mut previous: Option<HashSet<String>> = None;
    for budget_value in budgets {
        let (mut graph, backends, catalog, costs) = budget_setup();
        let budget = BudgetConfig::new(budget_value, costs);
        GraphPartitioner::new(&backends, &catalog)
            .partition(&mut graph, Some(&budget))
            .unwrap();
        let current = offloaded(&graph, &backends);
        if let Some(previous) = &previous {
            assert!(
                current.is_subset(previous),
                "offloaded set must shrink as the budget grows: {previous:?} -> {current:?}"
            );
        }
        previous = Some(current);
    }
}

#[test]
fn budget_config_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let table_path = dir.path().join("node_costs.json");
    let mut file = std::fs::File::create(&table_path).unwrap();
    write!(
        file,
        "{}",
        serde_json::json!({
            "default_cost": 1.0,
            "costs": { "n0": 1.0, "n1": 2.0, "n2": 3.0, "n3": 4.0 }
        })
    )
    .unwrap();
    drop(file);

    let value = format!("5,{}", table_path.display());
    let budget = BudgetConfig::from_config_value(&value).unwrap();
    assert_eq!(budget.budget, 5.0);

    let (mut graph, backends, catalog, _) = budget_setup();
    GraphPartitioner::new(&backends, &catalog)
        .partition(&mut graph, Some(&budget))
        .unwrap();
    assert_eq!(offloaded(&graph, &backends).len(), 3);
}

#[test]
fn malformed_budget_config_is_an_error() {
    assert!(matches!(
        BudgetConfig::from_config_value("no-comma-here"),
        Err(PartitionError::CostTableError(_))
    ));
}
