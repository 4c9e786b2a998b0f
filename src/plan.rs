use crate::allocator::{AllocatedBuffer, Allocator, AllocatorError, AllocatorService, MemorySpace};
use crate::backend::{BackendError, ExecutionBackends};
use crate::config::SessionConfig;
use crate::graph::{Graph, GraphError, NodeId};
use crate::kernel::{Kernel, KernelCatalog, KernelError};
use crate::prepack::{PackedBuffers, PrepackCache, PrepackKey, PrepackedBlobTable};
use crate::tensor::{TensorError, TensorValue};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Execution plan has already been finalized")]
    AlreadyFinalized,
    #[error("Node {0} has no assigned backend; partition the graph first")]
    UnassignedNode(NodeId),
    #[error("No kernel instance for node {0}")]
    MissingKernelInstance(NodeId),
    #[error("Shared initializer \"{0}\" does not match the graph's dtype/shape")]
    SharedInitializerMismatch(String),
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    KernelError(#[from] KernelError),
    #[error(transparent)]
    AllocatorError(#[from] AllocatorError),
    #[error(transparent)]
    BackendError(#[from] BackendError),
    #[error(transparent)]
    TensorError(#[from] TensorError),
}

/// Where a constant input's value was resolved from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ConstOrigin {
    /// An initializer of this plan's own graph.
    Own,
    /// Resolved from an enclosing graph through the outer-scope closure.
    Outer,
}

/// A blob produced for an outer-scope weight, bubbled up until the plan
/// whose graph owns the weight records it.
struct OuterRecording {
    weight: String,
    signature: String,
    blob: Arc<PackedBuffers>,
}

enum PrepackFactoryError {
    NotPacked,
    Kernel(KernelError),
}

/// The finalized, execution-ready structure for one graph: kernel instances,
/// realized initializers, and nested plans for control-flow subgraphs.
///
/// Created once per graph, mutated only by [`ExecutionPlan::finalize`], then
/// immutable for the plan's lifetime.
pub struct ExecutionPlan<'g> {
    graph: &'g Graph,
    backends: &'g ExecutionBackends,
    allocators: Arc<AllocatorService>,
    config: Arc<SessionConfig>,
    cache: Option<Arc<PrepackCache>>,
    recovered: Option<Arc<PrepackedBlobTable>>,
    finalized: bool,
    kernels: HashMap<NodeId, Box<dyn Kernel>>,
    value_slots: HashMap<String, usize>,
    initialized_values: HashMap<usize, TensorValue>,
    constant_values: HashMap<usize, TensorValue>,
    initializer_storage: HashMap<usize, AllocatedBuffer>,
    prepacked_for_save: PrepackedBlobTable,
    prepack_counter: usize,
    shared_reuse_counter: usize,
    children: HashMap<(NodeId, String), ExecutionPlan<'g>>,
}

impl<'g> ExecutionPlan<'g> {
    pub fn new(
        graph: &'g Graph,
        backends: &'g ExecutionBackends,
        allocators: Arc<AllocatorService>,
        config: Arc<SessionConfig>,
        cache: Option<Arc<PrepackCache>>,
    ) -> Self {
        Self {
            graph,
            backends,
            allocators,
            config,
            cache,
            recovered: None,
            finalized: false,
            kernels: HashMap::new(),
            value_slots: HashMap::new(),
            initialized_values: HashMap::new(),
            constant_values: HashMap::new(),
            initializer_storage: HashMap::new(),
            prepacked_for_save: PrepackedBlobTable::new(),
            prepack_counter: 0,
            shared_reuse_counter: 0,
            children: HashMap::new(),
        }
    }

    /// Attaches blob tables recovered from a loaded artifact. Weights with a
    /// matching kernel signature skip prepack entirely during finalize.
    pub fn with_recovered_prepacks(mut self, recovered: Arc<PrepackedBlobTable>) -> Self {
        self.recovered = Some(recovered);
        self
    }

    /// Walks the assigned graph, realizes initializer storage, instantiates
    /// kernels, runs the prepack protocol, and recurses into subgraph plans.
    /// Must be called exactly once; a second call is rejected.
    pub fn finalize(
        &mut self,
        catalog: &KernelCatalog,
        saving_model: bool,
    ) -> Result<(), PlanError> {
        if self.finalized {
            return Err(PlanError::AlreadyFinalized);
        }
        let outer_constants = HashMap::new();
        let leftover = self.finalize_inner(catalog, saving_model, &outer_constants, true)?;
        for rec in leftover {
            log::warn!(
                "prepack recording for \"{}\" has no owning graph; dropped",
                rec.weight
            );
        }
        self.finalized = true;
        Ok(())
    }

    fn finalize_inner(
        &mut self,
        catalog: &KernelCatalog,
        saving_model: bool,
        outer_constants: &HashMap<String, TensorValue>,
        is_root: bool,
    ) -> Result<Vec<OuterRecording>, PlanError> {
        let graph = self.graph;
        let topo = graph.topo_order()?;

        self.build_value_slots();
        self.realize_initializers()?;

        for node_id in &topo {
            let node = &graph.get_nodes()[*node_id];
            let backend_id = node
                .assigned_backend()
                .ok_or(PlanError::UnassignedNode(*node_id))?;
            let backend = self.backends.get_required(backend_id)?;
            let kernel = catalog.create_kernel(node, backend.name())?;
            self.kernels.insert(*node_id, kernel);
        }

        let mut foreign = Vec::new();
        let mut packed_counts: HashMap<String, usize> = HashMap::new();
        if !self.config.disable_prepacking {
            for node_id in &topo {
                self.prepack_node(
                    catalog,
                    *node_id,
                    outer_constants,
                    is_root,
                    saving_model,
                    &mut packed_counts,
                    &mut foreign,
                )?;
            }
        }

        // Child plans share the catalog, cache, config, and recovered blob
        // tables; outer-scope constants are resolved here and passed down as
        // a read-only closure.
        for node_id in 0..graph.get_nodes().len() {
            let node = &graph.get_nodes()[node_id];
            if !node.has_subgraphs() {
                continue;
            }
            for (attr, subgraph) in node.get_subgraphs() {
                let mut child_outer: HashMap<String, TensorValue> = HashMap::new();
                for name in subgraph.get_outer_scope_names() {
                    if let Some(value) = self
                        .value_slots
                        .get(name.as_str())
                        .and_then(|slot| self.constant_values.get(slot))
                    {
                        child_outer.insert(name.clone(), value.clone());
                    } else if let Some(value) = outer_constants.get(name) {
                        child_outer.insert(name.clone(), value.clone());
                    }
                }

                let mut child = ExecutionPlan::new(
                    subgraph,
                    self.backends,
                    self.allocators.clone(),
                    self.config.clone(),
                    self.cache.clone(),
                );
                child.recovered = self.recovered.clone();
                let child_foreign =
                    child.finalize_inner(catalog, saving_model, &child_outer, false)?;
                child.finalized = true;

                for rec in child_foreign {
                    if graph.get_initializer(&rec.weight).is_some() {
                        self.prepacked_for_save
                            .record(&rec.weight, &rec.signature, rec.blob);
                    } else {
                        foreign.push(rec);
                    }
                }
                self.children.insert((node_id, attr.clone()), child);
            }
        }

        // A constant packed by every local consumer no longer needs its
        // execution-time copy, unless a graph output or a nested subgraph
        // still refers to it.
        for (name, count) in packed_counts {
            let consumers = graph.get_consumers(&name).len();
            if count == consumers
                && consumers > 0
                && !graph.get_outputs().contains(&name)
                && !graph.is_used_by_subgraphs(&name)
            {
                if let Some(slot) = self.value_slots.get(name.as_str()) {
                    self.constant_values.remove(slot);
                    self.initialized_values.remove(slot);
                    self.initializer_storage.remove(slot);
                }
            }
        }

        Ok(foreign)
    }

    #[allow(clippy::too_many_arguments)]
    fn prepack_node(
        &mut self,
        catalog: &KernelCatalog,
        node_id: NodeId,
        outer_constants: &HashMap<String, TensorValue>,
        is_root: bool,
        saving_model: bool,
        packed_counts: &mut HashMap<String, usize>,
        foreign: &mut Vec<OuterRecording>,
    ) -> Result<(), PlanError> {
        let graph = self.graph;
        let node = &graph.get_nodes()[node_id];
        let backend_id = node
            .assigned_backend()
            .ok_or(PlanError::UnassignedNode(node_id))?;
        let backend = self.backends.get_required(backend_id)?;
        let Some(signature) = catalog.kernel_signature(node, backend.name()) else {
            return Ok(());
        };

        let mut const_inputs: Vec<(usize, String, TensorValue, ConstOrigin)> = Vec::new();
        for (input_index, input_name) in node.get_inputs().iter().enumerate() {
            if let Some(value) = self
                .value_slots
                .get(input_name.as_str())
                .and_then(|slot| self.constant_values.get(slot))
            {
                const_inputs.push((
                    input_index,
                    input_name.clone(),
                    value.clone(),
                    ConstOrigin::Own,
                ));
            } else if let Some(value) = outer_constants.get(input_name) {
                const_inputs.push((
                    input_index,
                    input_name.clone(),
                    value.clone(),
                    ConstOrigin::Outer,
                ));
            }
        }
        if const_inputs.is_empty() {
            return Ok(());
        }

        let allocator = self
            .allocators
            .get_allocator(&backend.default_memory_space(), backend.uses_arena())?;
        let cache = self.cache.clone();
        let recovered = self.recovered.clone();
        let config = self.config.clone();
        let saving = saving_model && config.save_prepacked_constants;

        let kernel = self
            .kernels
            .get_mut(&node_id)
            .ok_or(PlanError::MissingKernelInstance(node_id))?;

        for (input_index, input_name, value, origin) in const_inputs {
            // The persisted side table is keyed at the owning (top-level)
            // graph, so only root-owned and outer-resolved weights consult it.
            let may_recover = is_root || origin == ConstOrigin::Outer;
            if may_recover
                && let Some(recovered) = &recovered
                && let Some(blob) = recovered.get(&input_name, &signature)
            {
                if kernel.adopt_shared_buffers(&blob, input_index)? {
                    self.prepack_counter += 1;
                    self.shared_reuse_counter += 1;
                    if origin == ConstOrigin::Own {
                        *packed_counts.entry(input_name.clone()).or_default() += 1;
                    }
                    if let Some(cache) = cache
                        .as_ref()
                        .filter(|_| config.is_shared_initializer(&input_name, &value))
                    {
                        // Seed the cross-session container with the
                        // recovered blob.
                        let key = PrepackKey {
                            kernel_signature: signature.clone(),
                            weight_identity: value.identity(),
                        };
                        let seeded = blob.clone();
                        let _ = cache
                            .get_or_create::<std::convert::Infallible, _>(key, || Ok(seeded));
                    }
                    if saving {
                        record_blob(
                            &mut self.prepacked_for_save,
                            &input_name,
                            &signature,
                            blob,
                            origin,
                            foreign,
                        );
                    }
                    continue;
                }
            }

            if let Some(cache) = cache
                .as_ref()
                .filter(|_| config.is_shared_initializer(&input_name, &value))
            {
                let key = PrepackKey {
                    kernel_signature: signature.clone(),
                    weight_identity: value.identity(),
                };
                let result = cache.get_or_create(key, || {
                    let out = kernel
                        .prepack(&value, input_index, allocator.as_ref())
                        .map_err(PrepackFactoryError::Kernel)?;
                    match (out.is_packed, out.buffers) {
                        (true, Some(buffers)) => Ok(Arc::new(buffers)),
                        _ => Err(PrepackFactoryError::NotPacked),
                    }
                });
                match result {
                    Ok((blob, created)) => {
                        if kernel.adopt_shared_buffers(&blob, input_index)? {
                            self.prepack_counter += 1;
                            if !created {
                                self.shared_reuse_counter += 1;
                            }
                            if origin == ConstOrigin::Own {
                                *packed_counts.entry(input_name.clone()).or_default() += 1;
                            }
                            if saving {
                                record_blob(
                                    &mut self.prepacked_for_save,
                                    &input_name,
                                    &signature,
                                    blob,
                                    origin,
                                    foreign,
                                );
                            }
                        }
                    }
                    Err(PrepackFactoryError::NotPacked) => {}
                    Err(PrepackFactoryError::Kernel(e)) => return Err(e.into()),
                }
                continue;
            }

            let out = kernel.prepack(&value, input_index, allocator.as_ref())?;
            if out.is_packed {
                self.prepack_counter += 1;
                if origin == ConstOrigin::Own {
                    *packed_counts.entry(input_name.clone()).or_default() += 1;
                }
                if let Some(buffers) = out.buffers {
                    let blob = Arc::new(buffers);
                    let _ = kernel.adopt_shared_buffers(&blob, input_index)?;
                    if saving {
                        record_blob(
                            &mut self.prepacked_for_save,
                            &input_name,
                            &signature,
                            blob,
                            origin,
                            foreign,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn build_value_slots(&mut self) {
        let graph = self.graph;
        let mut add = |slots: &mut HashMap<String, usize>, name: &str| {
            if !slots.contains_key(name) {
                let next = slots.len();
                slots.insert(name.to_string(), next);
            }
        };
        for name in graph.get_inputs() {
            add(&mut self.value_slots, name);
        }
        let mut initializer_names: Vec<&String> = graph.get_initializers().keys().collect();
        initializer_names.sort();
        for name in initializer_names {
            add(&mut self.value_slots, name);
        }
        for node in graph.get_nodes() {
            for name in node.get_inputs() {
                add(&mut self.value_slots, name);
            }
            for name in node.get_outputs() {
                add(&mut self.value_slots, name);
            }
        }
        for name in graph.get_outputs() {
            add(&mut self.value_slots, name);
        }
    }

    fn realize_initializers(&mut self) -> Result<(), PlanError> {
        let graph = self.graph;
        let mut names: Vec<&String> = graph.get_initializers().keys().collect();
        names.sort();
        for name in names {
            let value = &graph.get_initializers()[name];
            let slot = self.value_slots[name.as_str()];
            let realized = if let Some(shared) = self.config.get_shared_initializer(name) {
                if shared.dtype() != value.dtype() || shared.shape() != value.shape() {
                    return Err(PlanError::SharedInitializerMismatch(name.clone()));
                }
                // Host-supplied storage replaces the graph's copy and keeps
                // its buffer identity for cross-session sharing.
                shared.clone()
            } else {
                let allocator = self.initializer_allocator(name)?;
                let mut buffer = if self.config.use_direct_allocator_for_initializers {
                    allocator.reserve(value.byte_len())?
                } else {
                    allocator.alloc(value.byte_len())?
                };
                buffer.as_mut_slice().copy_from_slice(value.raw_data());
                let realized = TensorValue::from_raw_data(
                    buffer.as_slice(),
                    value.dtype(),
                    value.shape().to_vec(),
                )?;
                self.initializer_storage.insert(slot, buffer);
                realized
            };
            self.initialized_values.insert(slot, realized.clone());
            if graph.is_constant_initializer(name) {
                self.constant_values.insert(slot, realized);
            }
        }
        Ok(())
    }

    /// Initializer storage comes from the default allocator of the first
    /// consumer's backend; unconsumed initializers land in CPU space.
    fn initializer_allocator(&self, name: &str) -> Result<Arc<dyn Allocator>, PlanError> {
        let backend = self
            .graph
            .get_consumers(name)
            .into_iter()
            .filter_map(|(node_id, _)| self.graph.get_nodes()[node_id].assigned_backend())
            .next()
            .and_then(|id| self.backends.get(id));
        let (space, arena) = match backend {
            Some(backend) => (backend.default_memory_space(), backend.uses_arena()),
            None => (MemorySpace::cpu(), true),
        };
        Ok(self.allocators.get_allocator(&space, arena)?)
    }

    pub fn get_graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Total prepack events for this plan: owned productions plus shared
    /// adoptions. Not aggregated across nested plans.
    pub fn get_prepack_counter(&self) -> usize {
        self.prepack_counter
    }

    /// Prepack events satisfied by an already-shared buffer (cache hit or
    /// recovered artifact blob).
    pub fn get_shared_prepack_reuse_counter(&self) -> usize {
        self.shared_reuse_counter
    }

    pub fn get_kernel(&self, node_id: NodeId) -> Option<&dyn Kernel> {
        self.kernels.get(&node_id).map(|x| x.as_ref())
    }

    pub fn get_value_slot(&self, name: &str) -> Option<usize> {
        self.value_slots.get(name).copied()
    }

    pub fn get_initialized_values(&self) -> &HashMap<usize, TensorValue> {
        &self.initialized_values
    }

    pub fn get_constant_initializers(&self) -> &HashMap<usize, TensorValue> {
        &self.constant_values
    }

    pub fn get_subgraph_plan(&self, node_id: NodeId, attribute: &str) -> Option<&ExecutionPlan<'g>> {
        self.children.get(&(node_id, attribute.to_string()))
    }

    pub fn get_subgraph_plans(&self) -> &HashMap<(NodeId, String), ExecutionPlan<'g>> {
        &self.children
    }

    /// Blobs recorded for the artifact writer during a saving finalize,
    /// keyed by this graph's own weights.
    pub fn get_prepacked_for_save(&self) -> &PrepackedBlobTable {
        &self.prepacked_for_save
    }
}

fn record_blob(
    table: &mut PrepackedBlobTable,
    weight: &str,
    signature: &str,
    blob: Arc<PackedBuffers>,
    origin: ConstOrigin,
    foreign: &mut Vec<OuterRecording>,
) {
    match origin {
        ConstOrigin::Own => table.record(weight, signature, blob),
        ConstOrigin::Outer => foreign.push(OuterRecording {
            weight: weight.to_string(),
            signature: signature.to_string(),
            blob,
        }),
    }
}
