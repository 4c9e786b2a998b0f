use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("Arena for {0} exhausted: requested {1} bytes with {2} remaining")]
    ArenaExhausted(MemorySpace, usize, usize),
    #[error("No allocator registered for memory space {0} (arena: {1})")]
    UnknownMemorySpace(MemorySpace, bool),
}

/// A memory-space descriptor, e.g. `cpu` or `gpu:0`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemorySpace(String);

impl MemorySpace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn cpu() -> Self {
        Self("cpu".to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocatorStats {
    pub num_allocs: usize,
    pub num_reserves: usize,
    pub bytes_allocated: usize,
}

/// A buffer handed out by an [`Allocator`], tagged with its memory space.
#[derive(Clone, Debug)]
pub struct AllocatedBuffer {
    space: MemorySpace,
    data: Vec<u8>,
}

impl AllocatedBuffer {
    pub(crate) fn from_vec(space: MemorySpace, data: Vec<u8>) -> Self {
        Self { space, data }
    }

    pub fn memory_space(&self) -> &MemorySpace {
        &self.space
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Allocation service for one memory space.
///
/// `alloc` goes through the allocator's pooling strategy; `reserve` is a
/// direct request that bypasses the pool, intended for long-lived buffers
/// that should not pin pooled capacity.
pub trait Allocator: Send + Sync {
    fn memory_space(&self) -> &MemorySpace;
    fn is_arena(&self) -> bool;
    fn alloc(&self, len: usize) -> Result<AllocatedBuffer, AllocatorError>;
    fn reserve(&self, len: usize) -> Result<AllocatedBuffer, AllocatorError>;
    fn stats(&self) -> AllocatorStats;
}

/// Pooled allocator with observable allocation counters. The bin-fit
/// strategy itself is an external service.
pub struct ArenaAllocator {
    space: MemorySpace,
    capacity_limit: Option<usize>,
    stats: Mutex<AllocatorStats>,
}

impl ArenaAllocator {
    pub fn new(space: MemorySpace) -> Self {
        Self {
            space,
            capacity_limit: None,
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    pub fn with_capacity_limit(space: MemorySpace, limit: usize) -> Self {
        Self {
            space,
            capacity_limit: Some(limit),
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, AllocatorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Allocator for ArenaAllocator {
    fn memory_space(&self) -> &MemorySpace {
        &self.space
    }

    fn is_arena(&self) -> bool {
        true
    }

    fn alloc(&self, len: usize) -> Result<AllocatedBuffer, AllocatorError> {
        let mut stats = self.lock_stats();
        if let Some(limit) = self.capacity_limit {
            let remaining = limit.saturating_sub(stats.bytes_allocated);
            if len > remaining {
                return Err(AllocatorError::ArenaExhausted(
                    self.space.clone(),
                    len,
                    remaining,
                ));
            }
        }
        stats.num_allocs += 1;
        stats.bytes_allocated += len;
        Ok(AllocatedBuffer::from_vec(self.space.clone(), vec![0u8; len]))
    }

    fn reserve(&self, len: usize) -> Result<AllocatedBuffer, AllocatorError> {
        // Reserved buffers live outside the pool and don't count against the
        // arena capacity.
        let mut stats = self.lock_stats();
        stats.num_reserves += 1;
        Ok(AllocatedBuffer::from_vec(self.space.clone(), vec![0u8; len]))
    }

    fn stats(&self) -> AllocatorStats {
        *self.lock_stats()
    }
}

/// Direct allocator issuing a per-call request for every allocation.
pub struct DirectAllocator {
    space: MemorySpace,
    stats: Mutex<AllocatorStats>,
}

impl DirectAllocator {
    pub fn new(space: MemorySpace) -> Self {
        Self {
            space,
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, AllocatorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Allocator for DirectAllocator {
    fn memory_space(&self) -> &MemorySpace {
        &self.space
    }

    fn is_arena(&self) -> bool {
        false
    }

    fn alloc(&self, len: usize) -> Result<AllocatedBuffer, AllocatorError> {
        let mut stats = self.lock_stats();
        stats.num_allocs += 1;
        stats.bytes_allocated += len;
        Ok(AllocatedBuffer::from_vec(self.space.clone(), vec![0u8; len]))
    }

    fn reserve(&self, len: usize) -> Result<AllocatedBuffer, AllocatorError> {
        self.alloc(len)
    }

    fn stats(&self) -> AllocatorStats {
        *self.lock_stats()
    }
}

/// Registry of allocators keyed by (memory space, arena flag).
#[derive(Default)]
pub struct AllocatorService {
    allocators: HashMap<(MemorySpace, bool), Arc<dyn Allocator>>,
}

impl AllocatorService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service with arena and direct allocators for the CPU space, the
    /// minimum any session needs for the fallback backend.
    pub fn with_cpu_defaults() -> Self {
        let mut service = Self::new();
        service.register(Arc::new(ArenaAllocator::new(MemorySpace::cpu())));
        service.register(Arc::new(DirectAllocator::new(MemorySpace::cpu())));
        service
    }

    pub fn register(&mut self, allocator: Arc<dyn Allocator>) {
        let key = (allocator.memory_space().clone(), allocator.is_arena());
        self.allocators.insert(key, allocator);
    }

    pub fn get_allocator(
        &self,
        space: &MemorySpace,
        arena: bool,
    ) -> Result<Arc<dyn Allocator>, AllocatorError> {
        self.allocators
            .get(&(space.clone(), arena))
            .cloned()
            .ok_or_else(|| AllocatorError::UnknownMemorySpace(space.clone(), arena))
    }
}
