#![allow(dead_code)]

use mosaic_tensor::allocator::{Allocator, AllocatorService, MemorySpace};
use mosaic_tensor::backend::{CpuBackend, ExecutionBackend, ExecutionBackends};
use mosaic_tensor::graph::{Graph, GraphBuilder, Node, NodeId};
use mosaic_tensor::kernel::{Kernel, KernelCatalog, KernelDef, KernelError, PrepackOutput};
use mosaic_tensor::partition::GraphPartitioner;
use mosaic_tensor::prepack::PackedBuffers;
use mosaic_tensor::tensor::TensorValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Shared observation point for kernels created through a catalog factory;
/// the test holds one clone, every kernel instance holds another.
#[derive(Default)]
pub struct KernelCounters {
    pub prepack_calls: AtomicUsize,
    pub adopt_calls: AtomicUsize,
}

impl KernelCounters {
    pub fn prepacks(&self) -> usize {
        self.prepack_calls.load(Ordering::SeqCst)
    }

    pub fn adoptions(&self) -> usize {
        self.adopt_calls.load(Ordering::SeqCst)
    }
}

/// Kernel that packs every constant input: 2-D f32 weights are transposed
/// into the packed layout, anything else is packed as-is.
pub struct PackingKernel {
    counters: Arc<KernelCounters>,
}

impl Kernel for PackingKernel {
    fn prepack(
        &mut self,
        tensor: &TensorValue,
        input_index: usize,
        allocator: &dyn Allocator,
    ) -> Result<PrepackOutput, KernelError> {
        self.counters.prepack_calls.fetch_add(1, Ordering::SeqCst);
        let packed_bytes: Vec<u8> =
            if tensor.dtype() == mosaic_tensor::DType::F32 && tensor.shape().len() == 2 {
                let array = tensor
                    .to_ndarray::<f32>()
                    .map_err(|e| KernelError::PrepackFailed {
                        op_type: "PackingTest".to_string(),
                        input_index,
                        reason: e.to_string(),
                    })?;
                let transposed = TensorValue::from_ndarray(&array.t().to_owned());
                transposed.raw_data().to_vec()
            } else {
                tensor.raw_data().to_vec()
            };
        let mut buffer = allocator.alloc(packed_bytes.len())?;
        buffer.as_mut_slice().copy_from_slice(&packed_bytes);
        let mut buffers = PackedBuffers::new();
        buffers.push(buffer);
        Ok(PrepackOutput::packed(buffers))
    }

    fn adopt_shared_buffers(
        &mut self,
        _buffers: &Arc<PackedBuffers>,
        _input_index: usize,
    ) -> Result<bool, KernelError> {
        self.counters.adopt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Kernel with no prepack support at all.
pub struct PlainKernel;

impl Kernel for PlainKernel {}

/// Catalog with the packing test op plus the control-flow ops the test
/// graphs use, all on the CPU backend.
pub fn packing_catalog(counters: Arc<KernelCounters>) -> KernelCatalog {
    let mut catalog = KernelCatalog::new();
    catalog.register(
        KernelDef::new("PackingTest", "", "cpu", 1),
        Box::new(move |_node| {
            Ok(Box::new(PackingKernel {
                counters: counters.clone(),
            }))
        }),
    );
    catalog.register(
        KernelDef::new("If", "", "cpu", 1),
        Box::new(|_node| Ok(Box::new(PlainKernel))),
    );
    catalog.register(
        KernelDef::new("Mul", "", "cpu", 1),
        Box::new(|_node| Ok(Box::new(PlainKernel))),
    );
    catalog
}

pub fn cpu_only_backends() -> ExecutionBackends {
    let mut backends = ExecutionBackends::new();
    backends
        .add_fallback(Box::new(CpuBackend::new()))
        .expect("register cpu backend");
    backends
}

pub fn place_all_nodes(
    graph: &mut Graph,
    backends: &ExecutionBackends,
    catalog: &KernelCatalog,
) {
    GraphPartitioner::new(backends, catalog)
        .partition(graph, None)
        .expect("partition");
}

pub fn cpu_allocators() -> Arc<AllocatorService> {
    Arc::new(AllocatorService::with_cpu_defaults())
}

/// One PackingTest node consuming a graph input and a 2-element f32
/// constant.
pub fn simple_packing_graph(weight: TensorValue) -> Graph {
    let mut builder = GraphBuilder::new(7);
    builder.add_input("node_0_input_0");
    builder.add_output("node_0_output_0");
    builder.add_node(
        Some("node_0".to_string()),
        "PackingTest",
        vec!["node_0_input_0".to_string(), "node_0_input_1".to_string()],
        vec!["node_0_output_0".to_string()],
    );
    builder
        .add_initializer("node_0_input_1", weight)
        .expect("initializer");
    builder.get_inner()
}

pub fn packing_weight() -> TensorValue {
    TensorValue::from_vec_shape(vec![1.0f32, 2.0], vec![2]).expect("weight")
}

fn subgraph_branch(suffix: &str) -> Graph {
    let mut builder = GraphBuilder::new(7);
    builder.add_outer_scope_name("if_shared");
    builder.add_outer_scope_name(&format!("if_input_{suffix}"));
    builder.add_output(&format!("if_output_{suffix}"));
    builder.add_node(
        Some(format!("if_node_{suffix}")),
        "PackingTest",
        vec!["if_shared".to_string(), format!("if_input_{suffix}")],
        vec![format!("if_output_{suffix}")],
    );
    builder.get_inner()
}

/// Main graph owning the "if_shared" weight, with an If node whose two
/// branches each consume it through the outer scope. Returns the graph and
/// the If node's id.
pub fn graph_with_subgraphs(weight: TensorValue) -> (Graph, NodeId) {
    let mut builder = GraphBuilder::new(7);
    builder.add_input("bool_arg");
    builder.add_input("if_input_0");
    builder.add_input("if_input_1");
    builder.add_output("output_arg");
    builder.add_node(
        Some("node_0".to_string()),
        "PackingTest",
        vec!["if_input_0".to_string(), "if_input_1".to_string()],
        vec!["node_0_output_0".to_string()],
    );
    let mut subgraphs = HashMap::new();
    subgraphs.insert("then_branch".to_string(), subgraph_branch("0"));
    subgraphs.insert("else_branch".to_string(), subgraph_branch("1"));
    let if_node = builder.add_node_full(
        Some("if".to_string()),
        "If",
        "",
        1,
        vec!["bool_arg".to_string()],
        vec!["output_arg".to_string()],
        subgraphs,
    );
    builder
        .add_initializer("if_shared", weight)
        .expect("initializer");
    (builder.get_inner(), if_node)
}

/// Accelerator-style backend claiming a fixed set of operator types.
pub struct AccelBackend {
    name: String,
    ops: HashSet<String>,
}

impl AccelBackend {
    pub fn new(name: &str, ops: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            name: name.to_string(),
            ops: ops.into_iter().map(|x| x.to_string()).collect(),
        }
    }
}

impl ExecutionBackend for AccelBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_execute(&self, node: &Node) -> bool {
        self.ops.contains(node.op_type())
    }

    fn default_memory_space(&self) -> MemorySpace {
        MemorySpace::new(self.name.clone())
    }
}
