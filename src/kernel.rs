use crate::allocator::{Allocator, AllocatorError};
use crate::graph::Node;
use crate::prepack::PackedBuffers;
use crate::tensor::TensorValue;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("No kernel for op \"{domain}:{op_type}\" version {version} on backend \"{backend}\"")]
    MissingKernel {
        op_type: String,
        domain: String,
        version: usize,
        backend: String,
    },
    #[error("Kernel construction failed for \"{0}\": {1}")]
    ConstructionFailed(String, String),
    #[error("Prepack failed for input {input_index} of \"{op_type}\": {reason}")]
    PrepackFailed {
        op_type: String,
        input_index: usize,
        reason: String,
    },
    #[error(transparent)]
    AllocatorError(#[from] AllocatorError),
}

/// Result of a prepack call. Kernels that pack return the produced buffer
/// set; ownership of the set is decided by the caller (plan-local adoption,
/// shared cache, or artifact side table), and handed back through
/// [`Kernel::adopt_shared_buffers`].
#[derive(Debug, Default)]
pub struct PrepackOutput {
    pub is_packed: bool,
    pub buffers: Option<PackedBuffers>,
}

impl PrepackOutput {
    pub fn not_packed() -> Self {
        Self::default()
    }

    pub fn packed(buffers: PackedBuffers) -> Self {
        Self {
            is_packed: true,
            buffers: Some(buffers),
        }
    }
}

/// One instantiated kernel, exclusively owned by its plan.
pub trait Kernel: Send {
    /// One-time repack of a constant input into the kernel's preferred
    /// layout. The default declines.
    fn prepack(
        &mut self,
        _tensor: &TensorValue,
        _input_index: usize,
        _allocator: &dyn Allocator,
    ) -> Result<PrepackOutput, KernelError> {
        Ok(PrepackOutput::not_packed())
    }

    /// Hands the kernel a shared handle to packed buffers for the given
    /// input. Returns whether the kernel took them.
    fn adopt_shared_buffers(
        &mut self,
        _buffers: &Arc<PackedBuffers>,
        _input_index: usize,
    ) -> Result<bool, KernelError> {
        Ok(false)
    }
}

/// Registration record: which op an entry serves, on which backend, for
/// which operator-set version range (inclusive).
#[derive(Clone, Debug)]
pub struct KernelDef {
    op_type: String,
    domain: String,
    backend: String,
    since_version: usize,
    until_version: usize,
}

impl KernelDef {
    pub fn new(op_type: &str, domain: &str, backend: &str, since_version: usize) -> Self {
        Self {
            op_type: op_type.to_string(),
            domain: domain.to_string(),
            backend: backend.to_string(),
            since_version,
            until_version: usize::MAX,
        }
    }

    pub fn until_version(mut self, until_version: usize) -> Self {
        self.until_version = until_version;
        self
    }

    pub fn matches(&self, node: &Node, backend: &str) -> bool {
        self.backend == backend
            && self.op_type == node.op_type()
            && self.domain == node.domain()
            && (self.since_version..=self.until_version).contains(&node.since_version())
    }

    /// Stable signature naming this kernel registration; used as the kernel
    /// half of prepack keys and persisted in saved artifacts.
    pub fn signature(&self) -> String {
        format!(
            "{}/{}:{}@{}",
            self.backend, self.domain, self.op_type, self.since_version
        )
    }
}

pub type KernelFactory = Box<dyn Fn(&Node) -> Result<Box<dyn Kernel>, KernelError> + Send + Sync>;

/// Resolves (operator, version, backend) to a kernel constructor.
#[derive(Default)]
pub struct KernelCatalog {
    entries: Vec<(KernelDef, KernelFactory)>,
}

impl KernelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: KernelDef, factory: KernelFactory) {
        self.entries.push((def, factory));
    }

    fn find(&self, node: &Node, backend: &str) -> Option<&(KernelDef, KernelFactory)> {
        self.entries.iter().find(|(def, _)| def.matches(node, backend))
    }

    pub fn has_kernel(&self, node: &Node, backend: &str) -> bool {
        self.find(node, backend).is_some()
    }

    pub fn kernel_signature(&self, node: &Node, backend: &str) -> Option<String> {
        self.find(node, backend).map(|(def, _)| def.signature())
    }

    pub fn create_kernel(&self, node: &Node, backend: &str) -> Result<Box<dyn Kernel>, KernelError> {
        let (_, factory) = self
            .find(node, backend)
            .ok_or_else(|| KernelError::MissingKernel {
                op_type: node.op_type().to_string(),
                domain: node.domain().to_string(),
                version: node.since_version(),
                backend: backend.to_string(),
            })?;
        factory(node)
    }
}
