use crate::allocator::AllocatedBuffer;
use crate::tensor::BufferIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A set of backend-specific packed buffers produced by one prepack call.
#[derive(Debug, Default)]
pub struct PackedBuffers {
    buffers: Vec<AllocatedBuffer>,
    buffer_sizes: Vec<usize>,
}

impl PackedBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: AllocatedBuffer) {
        self.buffer_sizes.push(buffer.len());
        self.buffers.push(buffer);
    }

    pub fn get(&self, index: usize) -> Option<&AllocatedBuffer> {
        self.buffers.get(index)
    }

    pub fn buffer_sizes(&self) -> &[usize] {
        &self.buffer_sizes
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocatedBuffer> {
        self.buffers.iter()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.buffer_sizes.iter().sum()
    }
}

/// Cache key: which kernel packed it, and the identity of the weight buffer
/// it packed. Keying on identity rather than name means two sessions only
/// share an entry when the host registered the same buffer in both.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct PrepackKey {
    pub kernel_signature: String,
    pub weight_identity: BufferIdentity,
}

/// Cross-session store of packed weight blobs with at-most-once production.
///
/// Lifetime is the host's concern: typically one container outliving every
/// session that shares it. Grows monotonically; there is no eviction.
#[derive(Default)]
pub struct PrepackCache {
    entries: Mutex<HashMap<PrepackKey, Arc<PackedBuffers>>>,
}

impl PrepackCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored handle for `key`, running `factory` exactly once to
    /// produce it if absent. The boolean is true when this call produced the
    /// entry. Concurrent first-writers serialize on the container lock, so a
    /// losing writer observes the winner's value and its factory never runs.
    pub fn get_or_create<E, F>(
        &self,
        key: PrepackKey,
        factory: F,
    ) -> Result<(Arc<PackedBuffers>, bool), E>
    where
        F: FnOnce() -> Result<Arc<PackedBuffers>, E>,
    {
        let mut entries = self.lock_entries();
        if let Some(existing) = entries.get(&key) {
            return Ok((existing.clone(), false));
        }
        let produced = factory()?;
        entries.insert(key, produced.clone());
        Ok((produced, true))
    }

    pub fn get(&self, key: &PrepackKey) -> Option<Arc<PackedBuffers>> {
        self.lock_entries().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<PrepackKey, Arc<PackedBuffers>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-weight blob table: weight name -> kernel signature -> blob.
///
/// Used in both directions of the artifact format: recording blobs produced
/// during a saving finalize, and holding blobs recovered from a loaded
/// artifact. Names rather than buffer identities, since identities do not
/// survive a process.
#[derive(Clone, Default)]
pub struct PrepackedBlobTable {
    weight_to_blobs: HashMap<String, HashMap<String, Arc<PackedBuffers>>>,
}

impl PrepackedBlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, weight: &str, kernel_signature: &str, blob: Arc<PackedBuffers>) {
        self.weight_to_blobs
            .entry(weight.to_string())
            .or_default()
            .insert(kernel_signature.to_string(), blob);
    }

    pub fn get(&self, weight: &str, kernel_signature: &str) -> Option<Arc<PackedBuffers>> {
        self.weight_to_blobs
            .get(weight)?
            .get(kernel_signature)
            .cloned()
    }

    pub fn get_blobs_for_weight(
        &self,
        weight: &str,
    ) -> Option<&HashMap<String, Arc<PackedBuffers>>> {
        self.weight_to_blobs.get(weight)
    }

    /// Number of weights with at least one recorded blob.
    pub fn weight_count(&self) -> usize {
        self.weight_to_blobs.len()
    }

    /// Total number of (weight, signature) blob entries.
    pub fn blob_count(&self) -> usize {
        self.weight_to_blobs.values().map(|x| x.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.weight_to_blobs.is_empty()
    }

    pub fn iter_weights(
        &self,
    ) -> impl Iterator<Item = (&String, &HashMap<String, Arc<PackedBuffers>>)> {
        self.weight_to_blobs.iter()
    }
}
