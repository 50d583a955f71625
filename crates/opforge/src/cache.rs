//! Compile cache: at most one compilation per distinct cache key.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::env;
use crate::error::CompilationError;
use crate::hashing::CacheKey;
use crate::unit::CompiledUnit;

/// Native toolchain collaborator: turns a unit into a loaded artifact.
pub trait Toolchain: Send + Sync {
    type Artifact: Send + Sync + 'static;

    fn name(&self) -> &str;

    fn compile(&self, unit: &CompiledUnit) -> Result<Self::Artifact, CompilationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on compilations running at the same time.
    pub max_parallel_compiles: usize,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(limit) = env::var_usize(env::MAX_PARALLEL_COMPILES) {
            config.max_parallel_compiles = limit.max(1);
        }
        config
    }

    pub fn with_max_parallel_compiles(mut self, limit: usize) -> Self {
        self.max_parallel_compiles = limit.max(1);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_parallel_compiles: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// A live reference to a compiled artifact.
///
/// Each handle holds one reference on its cache entry; hand it back with
/// [`CompileCache::release`].
pub struct ArtifactHandle<A> {
    key: CacheKey,
    artifact: Arc<A>,
    cached: bool,
}

impl<A> ArtifactHandle<A> {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn artifact(&self) -> &Arc<A> {
        &self.artifact
    }

    /// False for units built outside the cache because they are not
    /// cacheable.
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

impl<A> Deref for ArtifactHandle<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.artifact
    }
}

impl<A> fmt::Debug for ArtifactHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("key", &self.key)
            .field("cached", &self.cached)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    Evicted,
    /// The entry still has this many live references.
    InUse(usize),
    /// A compilation for the key is running.
    InFlight,
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
    pub failures: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

type BuildOutcome<A> = Result<Arc<A>, CompilationError>;

struct InFlight<A> {
    outcome: Mutex<Option<BuildOutcome<A>>>,
    done: Condvar,
}

impl<A> InFlight<A> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn publish(&self, outcome: BuildOutcome<A>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> BuildOutcome<A> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

enum Slot<A> {
    Ready { artifact: Arc<A>, refs: usize },
    Building { flight: Arc<InFlight<A>>, waiters: usize },
}

enum Role<A> {
    Build(Arc<InFlight<A>>),
    Wait(Arc<InFlight<A>>),
}

/// Bounds the number of compilations running at once.
struct CompileGate {
    active: Mutex<usize>,
    freed: Condvar,
    limit: usize,
}

struct GatePermit<'a> {
    gate: &'a CompileGate,
}

impl CompileGate {
    fn new(limit: usize) -> Self {
        Self {
            active: Mutex::new(0),
            freed: Condvar::new(),
            limit: limit.max(1),
        }
    }

    fn enter(&self) -> GatePermit<'_> {
        let mut active = self.active.lock();
        while *active >= self.limit {
            self.freed.wait(&mut active);
        }
        *active += 1;
        GatePermit { gate: self }
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut active = self.gate.active.lock();
        *active = active.saturating_sub(1);
        self.gate.freed.notify_one();
    }
}

pub struct CompileCache<T: Toolchain> {
    toolchain: T,
    entries: Mutex<HashMap<CacheKey, Slot<T::Artifact>>>,
    gate: CompileGate,
    counters: Counters,
}

impl<T: Toolchain> CompileCache<T> {
    pub fn new(toolchain: T) -> Self {
        Self::with_config(toolchain, CacheConfig::from_env())
    }

    pub fn with_config(toolchain: T, config: CacheConfig) -> Self {
        Self {
            toolchain,
            entries: Mutex::new(HashMap::new()),
            gate: CompileGate::new(config.max_parallel_compiles),
            counters: Counters::default(),
        }
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    /// Returns a handle to the artifact for `unit`, compiling it when no
    /// entry exists.
    ///
    /// Concurrent callers for one key share a single compilation and all
    /// observe its outcome. Failures are not cached.
    pub fn acquire(
        &self,
        unit: &CompiledUnit,
    ) -> Result<ArtifactHandle<T::Artifact>, CompilationError> {
        let key = unit.key;
        if !unit.cacheable {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("unit {} is not cacheable; compiling", key.short());
            let artifact = self.compile(unit)?;
            return Ok(ArtifactHandle {
                key,
                artifact,
                cached: false,
            });
        }

        let role = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(Slot::Ready { artifact, refs }) => {
                    *refs += 1;
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("cache hit for unit {} (refs={refs})", key.short());
                    return Ok(ArtifactHandle {
                        key,
                        artifact: Arc::clone(artifact),
                        cached: true,
                    });
                }
                Some(Slot::Building { flight, waiters }) => {
                    *waiters += 1;
                    debug!("waiting on in-flight compilation of unit {}", key.short());
                    Role::Wait(Arc::clone(flight))
                }
                None => {
                    let flight = Arc::new(InFlight::new());
                    entries.insert(
                        key,
                        Slot::Building {
                            flight: Arc::clone(&flight),
                            waiters: 0,
                        },
                    );
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    debug!("cache miss for unit {}", key.short());
                    Role::Build(flight)
                }
            }
        };

        let artifact = match role {
            Role::Wait(flight) => {
                let artifact = flight.wait()?;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                artifact
            }
            Role::Build(flight) => {
                let mut build = BuildGuard {
                    cache: self,
                    key,
                    flight,
                    finished: false,
                };
                let outcome = self.compile(unit);
                build.finish(outcome)?
            }
        };
        Ok(ArtifactHandle {
            key,
            artifact,
            cached: true,
        })
    }

    /// Drops one reference. Entries stay resident until evicted.
    pub fn release(&self, handle: ArtifactHandle<T::Artifact>) {
        if !handle.cached {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(Slot::Ready { artifact, refs }) = entries.get_mut(&handle.key) {
            if Arc::ptr_eq(artifact, &handle.artifact) {
                *refs = refs.saturating_sub(1);
                debug!("released unit {} (refs={refs})", handle.key.short());
            }
        }
    }

    /// Removes the entry for `key` if nothing references it.
    pub fn evict(&self, key: &CacheKey) -> EvictOutcome {
        let mut entries = self.entries.lock();
        let outcome = match entries.get(key) {
            None => EvictOutcome::Missing,
            Some(Slot::Building { .. }) => EvictOutcome::InFlight,
            Some(Slot::Ready { refs, .. }) if *refs > 0 => EvictOutcome::InUse(*refs),
            Some(Slot::Ready { .. }) => EvictOutcome::Evicted,
        };
        if outcome == EvictOutcome::Evicted {
            entries.remove(key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            info!("evicted unit {}", key.short());
        }
        outcome
    }

    /// Evicts every entry without live references; returns how many.
    pub fn evict_unused(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, slot| !matches!(slot, Slot::Ready { refs: 0, .. }));
        let evicted = before - entries.len();
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            info!("evicted {evicted} unused unit(s)");
        }
        evicted
    }

    pub fn refcount(&self, key: &CacheKey) -> Option<usize> {
        match self.entries.lock().get(key) {
            Some(Slot::Ready { refs, .. }) => Some(*refs),
            _ => None,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.entries.lock().get(key), Some(Slot::Ready { .. }))
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            compilations: self.counters.compilations.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries,
        }
    }

    fn compile(&self, unit: &CompiledUnit) -> Result<Arc<T::Artifact>, CompilationError> {
        let _permit = self.gate.enter();
        self.counters.compilations.fetch_add(1, Ordering::Relaxed);
        info!(
            "compiling unit {} with {} ({} application(s))",
            unit.key.short(),
            self.toolchain.name(),
            unit.instances.len()
        );
        match self.toolchain.compile(unit) {
            Ok(artifact) => Ok(Arc::new(artifact)),
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("compilation of unit {} failed", unit.key.short());
                Err(err)
            }
        }
    }
}

/// Publishes the outcome of a compilation to waiters, including when the
/// toolchain panics.
struct BuildGuard<'a, T: Toolchain> {
    cache: &'a CompileCache<T>,
    key: CacheKey,
    flight: Arc<InFlight<T::Artifact>>,
    finished: bool,
}

impl<T: Toolchain> BuildGuard<'_, T> {
    fn finish(&mut self, outcome: BuildOutcome<T::Artifact>) -> BuildOutcome<T::Artifact> {
        {
            let mut entries = self.cache.entries.lock();
            let waiters = match entries.remove(&self.key) {
                Some(Slot::Building { waiters, .. }) => waiters,
                _ => 0,
            };
            if let Ok(artifact) = &outcome {
                entries.insert(
                    self.key,
                    Slot::Ready {
                        artifact: Arc::clone(artifact),
                        refs: waiters + 1,
                    },
                );
            }
        }
        self.finished = true;
        self.flight.publish(outcome.clone());
        outcome
    }
}

impl<T: Toolchain> Drop for BuildGuard<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let err = CompilationError::new(self.key, "toolchain panicked during compilation");
        self.cache.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!("compilation of unit {} panicked", self.key.short());
        self.cache.entries.lock().remove(&self.key);
        self.flight.publish(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::hashing::KeyHasher;
    use crate::unit::BuildRequirements;

    struct Counting {
        calls: AtomicUsize,
    }

    impl Toolchain for Counting {
        type Artifact = usize;

        fn name(&self) -> &str {
            "counting"
        }

        fn compile(&self, _unit: &CompiledUnit) -> Result<usize, CompilationError> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn unit(tag: &str, cacheable: bool) -> CompiledUnit {
        let mut hasher = KeyHasher::new();
        hasher.write_str(tag);
        CompiledUnit {
            key: hasher.finish(),
            cacheable,
            source: tag.to_string(),
            requirements: BuildRequirements::default(),
            versions: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            module_inits: Vec::new(),
            instances: Vec::new(),
            folded: Vec::new(),
        }
    }

    fn cache() -> CompileCache<Counting> {
        CompileCache::with_config(
            Counting {
                calls: AtomicUsize::new(0),
            },
            CacheConfig::default().with_max_parallel_compiles(2),
        )
    }

    #[test]
    fn hit_increments_refcount() {
        let cache = cache();
        let unit = unit("a", true);
        let first = cache.acquire(&unit).expect("first");
        let second = cache.acquire(&unit).expect("second");
        assert_eq!(*first, 1);
        assert_eq!(*second, 1);
        assert_eq!(cache.refcount(&unit.key), Some(2));
        cache.release(first);
        assert_eq!(cache.refcount(&unit.key), Some(1));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.compilations, 1);
        assert_eq!(stats.entries, 1);
        cache.release(second);
    }

    #[test]
    fn eviction_requires_zero_refs() {
        let cache = cache();
        let unit = unit("b", true);
        let handle = cache.acquire(&unit).expect("acquire");
        assert_eq!(cache.evict(&unit.key), EvictOutcome::InUse(1));
        cache.release(handle);
        assert!(cache.contains(&unit.key), "release must not evict");
        assert_eq!(cache.evict(&unit.key), EvictOutcome::Evicted);
        assert_eq!(cache.evict(&unit.key), EvictOutcome::Missing);
        assert_eq!(cache.stats().evictions, 1);

        let again = cache.acquire(&unit).expect("reacquire");
        assert_eq!(*again, 2, "evicted unit is rebuilt");
        cache.release(again);
    }

    #[test]
    fn evict_unused_keeps_referenced_entries() {
        let cache = cache();
        let held = cache.acquire(&unit("held", true)).expect("held");
        let dropped = cache.acquire(&unit("dropped", true)).expect("dropped");
        cache.release(dropped);
        assert_eq!(cache.evict_unused(), 1);
        assert!(cache.contains(&held.key()));
        cache.release(held);
    }

    #[test]
    fn non_cacheable_units_bypass_the_map() {
        let cache = cache();
        let unit = unit("c", false);
        let first = cache.acquire(&unit).expect("first");
        let second = cache.acquire(&unit).expect("second");
        assert!(!first.is_cached());
        assert_eq!((*first, *second), (1, 2));
        assert!(!cache.contains(&unit.key));
        assert_eq!(cache.evict(&unit.key), EvictOutcome::Missing);
    }

    #[test]
    fn gate_bounds_parallel_compiles() {
        let gate = CompileGate::new(1);
        let permit = gate.enter();
        assert_eq!(*gate.active.lock(), 1);
        drop(permit);
        assert_eq!(*gate.active.lock(), 0);
    }
}
