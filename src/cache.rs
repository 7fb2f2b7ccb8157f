//! Reference-counted cache of compiled pass programs.
//!
//! Every distinct [`ProgramKey`] is compiled at most once for the lifetime
//! of the cache. Acquiring a key that is being compiled by another thread
//! blocks until that compile finishes and then shares its handle. Released
//! entries stay resident until [`ProgramCache::trim`] is called.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::backend::{BackendError, ExecutionBackend, ProgramHandle};
use crate::radix::WorkGroupSize;
use crate::shape::{Axis, Direction, Precision, Target, TransformType};

/// Kernel a pass program implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelKind {
    /// One radix-R Stockham stage (fused stages use the product radix).
    Radix(u32),
    /// Real-to-complex post-processing of a packed half-length transform.
    ResolveRealToComplex,
    /// Complex-to-real pre-processing into a packed half-length transform.
    ResolveComplexToReal,
    /// Row/column swap of a two-dimensional array.
    Transpose,
    /// Plain copy, used when no axis needs a transform.
    Copy,
}

/// Everything that changes the generated program text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub kernel: KernelKind,
    pub axis: Axis,
    pub direction: Direction,
    pub transform_type: TransformType,
    pub precision: Precision,
    pub workgroup: WorkGroupSize,
    pub lanes: u32,
    pub input_target: Target,
    pub output_target: Target,
    /// First stage of an axis (stride 1, trivial twiddles).
    pub first_stage: bool,
    pub normalize: bool,
    /// Capability profile of the device the program is built for.
    pub target_profile: String,
}

/// The backend rejected a program.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to compile program for {kernel:?}: {source}")]
pub struct ProgramCompileError {
    pub kernel: KernelKind,
    #[source]
    pub source: BackendError,
}

enum SlotState {
    Compiling,
    Ready { handle: ProgramHandle, refs: usize },
    Failed,
    Evicted,
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn compiling() -> Self {
        Self {
            state: Mutex::new(SlotState::Compiling),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A counted reference to a compiled program.
///
/// Obtained from [`ProgramCache::acquire`] and handed back with
/// [`ProgramCache::release`].
pub struct ProgramCacheEntry {
    key: Arc<ProgramKey>,
    handle: ProgramHandle,
    slot: Arc<Slot>,
}

impl ProgramCacheEntry {
    pub fn key(&self) -> &ProgramKey {
        &self.key
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    /// Current reference count of the underlying program.
    pub fn ref_count(&self) -> usize {
        match &*self.slot.lock() {
            SlotState::Ready { refs, .. } => *refs,
            _ => 0,
        }
    }
}

impl std::fmt::Debug for ProgramCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramCacheEntry")
            .field("kernel", &self.key.kernel)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Counters describing cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub compiles: u64,
    pub hits: u64,
    pub failures: u64,
    pub evictions: u64,
}

/// Program cache shared by every plan built against one backend.
pub struct ProgramCache {
    backend: Arc<dyn ExecutionBackend>,
    slots: Mutex<HashMap<Arc<ProgramKey>, Arc<Slot>>>,
    stats: Mutex<CacheStats>,
}

impl ProgramCache {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Get a program for `key`, compiling it on first use.
    pub fn acquire(&self, key: &ProgramKey) -> Result<ProgramCacheEntry, ProgramCompileError> {
        loop {
            let (key_arc, slot, owner) = {
                let mut slots = self.lock_slots();
                match slots.get_key_value(key) {
                    Some((k, slot)) => {
                        let slot = slot.clone();
                        let k = k.clone();
                        // Count hits while the map is locked so trim cannot race.
                        let mut state = slot.lock();
                        if let SlotState::Ready { handle, refs } = &mut *state {
                            *refs += 1;
                            let handle = *handle;
                            drop(state);
                            self.bump(|s| s.hits += 1);
                            return Ok(ProgramCacheEntry {
                                key: k,
                                handle,
                                slot,
                            });
                        }
                        drop(state);
                        (k, slot, false)
                    }
                    None => {
                        let k = Arc::new(key.clone());
                        let slot = Arc::new(Slot::compiling());
                        slots.insert(k.clone(), slot.clone());
                        (k, slot, true)
                    }
                }
            };

            if owner {
                return self.compile_into(key_arc, slot);
            }

            // Another thread owns the compile; wait for its outcome.
            let mut state = slot.lock();
            while matches!(*state, SlotState::Compiling) {
                state = slot.ready.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            if let SlotState::Ready { handle, refs } = &mut *state {
                *refs += 1;
                let handle = *handle;
                drop(state);
                self.bump(|s| s.hits += 1);
                return Ok(ProgramCacheEntry {
                    key: key_arc,
                    handle,
                    slot,
                });
            }
            // Failed or evicted before we got to it: start over.
        }
    }

    fn compile_into(
        &self,
        key: Arc<ProgramKey>,
        slot: Arc<Slot>,
    ) -> Result<ProgramCacheEntry, ProgramCompileError> {
        log::debug!("Compiling program {:?} ({:?})", key.kernel, key.axis);
        match self.backend.compile(&key) {
            Ok(handle) => {
                *slot.lock() = SlotState::Ready { handle, refs: 1 };
                slot.ready.notify_all();
                self.bump(|s| s.compiles += 1);
                Ok(ProgramCacheEntry { key, handle, slot })
            }
            Err(source) => {
                {
                    let mut slots = self.lock_slots();
                    if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                        slots.remove(&key);
                    }
                }
                *slot.lock() = SlotState::Failed;
                slot.ready.notify_all();
                self.bump(|s| s.failures += 1);
                log::warn!("Program compile failed for {:?}: {}", key.kernel, source);
                Err(ProgramCompileError {
                    kernel: key.kernel,
                    source,
                })
            }
        }
    }

    /// Return a reference. The program stays cached until trimmed.
    pub fn release(&self, entry: ProgramCacheEntry) {
        let mut state = entry.slot.lock();
        if let SlotState::Ready { refs, .. } = &mut *state {
            *refs = refs.saturating_sub(1);
        }
    }

    /// Destroy every program with no outstanding references.
    ///
    /// Returns the number of programs destroyed.
    pub fn trim(&self) -> usize {
        let mut destroyed = Vec::new();
        {
            let mut slots = self.lock_slots();
            slots.retain(|_, slot| {
                let mut state = slot.lock();
                match &*state {
                    SlotState::Ready { handle, refs: 0 } => {
                        destroyed.push(*handle);
                        *state = SlotState::Evicted;
                        false
                    }
                    _ => true,
                }
            });
        }
        for handle in &destroyed {
            self.backend.destroy_program(*handle);
        }
        if !destroyed.is_empty() {
            log::debug!("Trimmed {} unused programs", destroyed.len());
            let count = destroyed.len() as u64;
            self.bump(|s| s.evictions += count);
        }
        destroyed.len()
    }

    /// Reference count of a cached key, `None` if it is not resident.
    pub fn ref_count(&self, key: &ProgramKey) -> Option<usize> {
        let slots = self.lock_slots();
        let slot = slots.get(key)?;
        let state = slot.lock();
        match &*state {
            SlotState::Ready { refs, .. } => Some(*refs),
            _ => None,
        }
    }

    /// Number of resident programs, compiled or compiling.
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<Arc<ProgramKey>, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, f: impl FnOnce(&mut CacheStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn key(radix: u32) -> ProgramKey {
        ProgramKey {
            kernel: KernelKind::Radix(radix),
            axis: Axis::Horizontal,
            direction: Direction::Forward,
            transform_type: TransformType::ComplexToComplex,
            precision: Precision::Single,
            workgroup: WorkGroupSize::new(4, 1, 1),
            lanes: 1,
            input_target: Target::Buffer,
            output_target: Target::Buffer,
            first_stage: true,
            normalize: false,
            target_profile: "cpu-reference".to_string(),
        }
    }

    #[test]
    fn test_hit_reuses_handle() {
        let backend = Arc::new(CpuBackend::new());
        let cache = ProgramCache::new(backend.clone());

        let a = cache.acquire(&key(4)).unwrap();
        let b = cache.acquire(&key(4)).unwrap();
        assert_eq!(a.handle(), b.handle());
        assert_eq!(a.ref_count(), 2);
        assert_eq!(backend.compile_count(), 1);
        assert_eq!(cache.stats().hits, 1);

        let c = cache.acquire(&key(8)).unwrap();
        assert_ne!(a.handle(), c.handle());
        assert_eq!(backend.compile_count(), 2);
    }

    #[test]
    fn test_release_is_lazy() {
        let backend = Arc::new(CpuBackend::new());
        let cache = ProgramCache::new(backend.clone());

        let entry = cache.acquire(&key(4)).unwrap();
        cache.release(entry);
        assert_eq!(cache.ref_count(&key(4)), Some(0));
        assert_eq!(cache.len(), 1);

        // Reacquiring an unreferenced program does not recompile.
        let entry = cache.acquire(&key(4)).unwrap();
        assert_eq!(backend.compile_count(), 1);
        cache.release(entry);
    }

    #[test]
    fn test_trim_only_drops_unreferenced() {
        let backend = Arc::new(CpuBackend::new());
        let cache = ProgramCache::new(backend.clone());

        let held = cache.acquire(&key(4)).unwrap();
        let dropped = cache.acquire(&key(8)).unwrap();
        cache.release(dropped);

        assert_eq!(cache.trim(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ref_count(&key(8)), None);
        assert_eq!(cache.ref_count(&key(4)), Some(1));

        cache.release(held);
        assert_eq!(cache.trim(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 2);
    }
}
