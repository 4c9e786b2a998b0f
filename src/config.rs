use crate::tensor::TensorValue;
use std::collections::HashMap;

/// Validity policy for artifact-cache placement identifiers.
#[derive(Clone, Debug)]
pub struct CacheIdPolicy {
    pub max_len: usize,
    pub alphanumeric_only: bool,
}

impl Default for CacheIdPolicy {
    fn default() -> Self {
        Self {
            max_len: 36,
            alphanumeric_only: true,
        }
    }
}

impl CacheIdPolicy {
    pub fn is_valid(&self, id: &str) -> bool {
        if id.is_empty() || id.len() > self.max_len {
            return false;
        }
        if self.alphanumeric_only && !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return false;
        }
        true
    }
}

/// Session-wide options consulted during partitioning and finalization.
/// Fixed for a plan's lifetime once finalization starts.
#[derive(Clone)]
pub struct SessionConfig {
    /// Skip the prepack pass entirely.
    pub disable_prepacking: bool,
    /// Route all initializer storage through direct (unpooled) requests even
    /// when the owning backend's default allocator is arena-based, keeping
    /// long-lived weights from pinning arena capacity.
    pub use_direct_allocator_for_initializers: bool,
    /// Record packed blobs during a saving finalize so the artifact writer
    /// can persist them alongside the initializers.
    pub save_prepacked_constants: bool,
    /// Byte alignment for external-data segments. Must be a power of two.
    pub external_data_alignment: u64,
    shared_initializers: HashMap<String, TensorValue>,
    artifact_cache_id: Option<String>,
    cache_id_policy: CacheIdPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disable_prepacking: false,
            use_direct_allocator_for_initializers: false,
            save_prepacked_constants: false,
            external_data_alignment: 4,
            shared_initializers: HashMap::new(),
            artifact_cache_id: None,
            cache_id_policy: CacheIdPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host-owned initializer value that overrides the graph's
    /// copy and is eligible for cross-session prepack sharing. Sharing keys
    /// on the value's buffer identity: sessions dedup only when given the
    /// same value.
    pub fn add_shared_initializer(&mut self, name: &str, value: TensorValue) {
        self.shared_initializers.insert(name.to_string(), value);
    }

    pub fn get_shared_initializer(&self, name: &str) -> Option<&TensorValue> {
        self.shared_initializers.get(name)
    }

    pub fn is_shared_initializer(&self, name: &str, value: &TensorValue) -> bool {
        self.shared_initializers
            .get(name)
            .map(|x| x.shares_buffer_with(value))
            .unwrap_or(false)
    }

    /// Sets the placement identifier under which saved artifacts are cached.
    /// An identifier the policy rejects disables caching rather than failing.
    pub fn set_artifact_cache_id(&mut self, id: &str) {
        if self.cache_id_policy.is_valid(id) {
            self.artifact_cache_id = Some(id.to_string());
        } else {
            log::warn!(
                "artifact cache id {:?} rejected by policy (max_len={}, alphanumeric_only={}); caching disabled",
                id,
                self.cache_id_policy.max_len,
                self.cache_id_policy.alphanumeric_only
            );
            self.artifact_cache_id = None;
        }
    }

    pub fn artifact_cache_id(&self) -> Option<&str> {
        self.artifact_cache_id.as_deref()
    }

    pub fn set_cache_id_policy(&mut self, policy: CacheIdPolicy) {
        self.cache_id_policy = policy;
    }
}
