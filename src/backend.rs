use crate::allocator::MemorySpace;
use crate::graph::{Graph, Node, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("A backend named \"{0}\" is already registered")]
    DuplicateBackend(String),
    #[error("A fallback backend (\"{0}\") is already registered")]
    DuplicateFallback(String),
    #[error("Unknown backend id {0:?}")]
    UnknownBackend(BackendId),
}

/// Small integer id stored per node once partitioning assigns it.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackendId(pub u8);

/// Capability surface a hardware backend exposes to the partitioner and the
/// finalization pass. Kernel construction itself goes through the catalog.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this backend claims the node.
    fn can_execute(&self, node: &Node) -> bool;

    /// Optional fused-group claim: node groups this backend wants to take as
    /// units. Nodes already assigned to a higher-priority backend are
    /// skipped; membership does not override priority.
    fn claim_node_groups(&self, _graph: &Graph) -> Option<Vec<Vec<NodeId>>> {
        None
    }

    fn default_memory_space(&self) -> MemorySpace;

    /// Whether this backend's default allocator is arena-based.
    fn uses_arena(&self) -> bool {
        true
    }
}

/// Ordered backend registry. Priority is registration order; the fallback is
/// the designated last resort for unclaimed nodes.
#[derive(Default)]
pub struct ExecutionBackends {
    backends: Vec<Box<dyn ExecutionBackend>>,
    fallback: Option<BackendId>,
}

impl ExecutionBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, backend: Box<dyn ExecutionBackend>) -> Result<BackendId, BackendError> {
        if self.backends.iter().any(|x| x.name() == backend.name()) {
            return Err(BackendError::DuplicateBackend(backend.name().to_string()));
        }
        let id = BackendId(self.backends.len() as u8);
        self.backends.push(backend);
        Ok(id)
    }

    /// Registers a backend and marks it as the fallback target for unclaimed
    /// nodes. Lowest priority is the conventional position, so call this
    /// last.
    pub fn add_fallback(
        &mut self,
        backend: Box<dyn ExecutionBackend>,
    ) -> Result<BackendId, BackendError> {
        if let Some(existing) = self.fallback {
            return Err(BackendError::DuplicateFallback(
                self.get(existing)
                    .map(|x| x.name().to_string())
                    .unwrap_or_default(),
            ));
        }
        let id = self.add(backend)?;
        self.fallback = Some(id);
        Ok(id)
    }

    pub fn get(&self, id: BackendId) -> Option<&dyn ExecutionBackend> {
        self.backends.get(id.0 as usize).map(|x| x.as_ref())
    }

    pub fn get_required(&self, id: BackendId) -> Result<&dyn ExecutionBackend, BackendError> {
        self.get(id).ok_or(BackendError::UnknownBackend(id))
    }

    pub fn fallback_id(&self) -> Option<BackendId> {
        self.fallback
    }

    pub fn iter_priority(&self) -> impl Iterator<Item = (BackendId, &dyn ExecutionBackend)> {
        self.backends
            .iter()
            .enumerate()
            .map(|(i, x)| (BackendId(i as u8), x.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// The host-CPU backend, conventionally registered as the fallback.
pub struct CpuBackend {
    unsupported_ops: HashSet<String>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            unsupported_ops: HashSet::new(),
        }
    }

    /// A CPU backend that refuses the given operator types.
    pub fn with_unsupported_ops(ops: impl IntoIterator<Item = String>) -> Self {
        Self {
            unsupported_ops: ops.into_iter().collect(),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn can_execute(&self, node: &Node) -> bool {
        !self.unsupported_ops.contains(node.op_type())
    }

    fn default_memory_space(&self) -> MemorySpace {
        MemorySpace::cpu()
    }
}
