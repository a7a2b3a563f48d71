//! Per-region bookkeeping of every compilation the inspector has seen.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, MemoryRange};
use crate::compilation::CompiledMethod;
use crate::context::InspectorContext;
use crate::error::InspectorError;
use crate::interval::IntervalIndex;
use crate::target::{CompilationRecord, CompilationRef, RegionKind, RegionStatus, TargetVm};

struct RegistryState {
    range: MemoryRange,
    index: IntervalIndex<Arc<CompiledMethod>>,
    /// Keyed by the target's record reference, independent of where the
    /// code currently lives.
    known: HashMap<CompilationRef, Arc<CompiledMethod>>,
    /// Discovered before the target gave them an allocation.
    unallocated: Vec<Arc<CompiledMethod>>,
    /// Entries of the target's list already walked.
    seen: usize,
    eviction_count: u64,
    last_epoch: u64,
}

/// Tracks the compilations of one code cache region by their current
/// allocation.
pub struct CompiledCodeRegistry {
    ctx: Arc<InspectorContext>,
    kind: RegionKind,
    state: Mutex<RegistryState>,
}

impl CompiledCodeRegistry {
    pub fn new(ctx: Arc<InspectorContext>, kind: RegionKind) -> Self {
        Self {
            ctx,
            kind,
            state: Mutex::new(RegistryState {
                range: MemoryRange::EMPTY,
                index: IntervalIndex::new(),
                known: HashMap::new(),
                unallocated: Vec::new(),
                seen: 0,
                eviction_count: 0,
                last_epoch: 0,
            }),
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn range(&self) -> MemoryRange {
        self.state.lock().range
    }

    /// Compilations known, allocated or not.
    pub fn size(&self) -> usize {
        self.state.lock().known.len()
    }

    pub fn unallocated_count(&self) -> usize {
        self.state.lock().unallocated.len()
    }

    /// Eviction count as of the last refresh.
    pub fn eviction_count(&self) -> u64 {
        self.state.lock().eviction_count
    }

    pub fn find(&self, address: Address) -> Option<Arc<CompiledMethod>> {
        self.state
            .lock()
            .index
            .find(address)
            .map(|(_, compilation)| compilation.clone())
    }

    pub fn get(&self, reference: CompilationRef) -> Option<Arc<CompiledMethod>> {
        self.state.lock().known.get(&reference).cloned()
    }

    /// Allocated compilations by address, followed by unallocated ones.
    pub fn compilations(&self) -> Vec<Arc<CompiledMethod>> {
        let state = self.state.lock();
        state
            .index
            .iter()
            .map(|(_, compilation)| compilation.clone())
            .chain(state.unallocated.iter().cloned())
            .collect()
    }

    /// Bring the registry up to date with the target for `epoch`.
    ///
    /// `status` must have been read in the same epoch, before any other
    /// refresh.
    pub fn refresh(&self, epoch: u64, status: &RegionStatus) -> Result<(), InspectorError> {
        let mut state = self.state.lock();
        if epoch <= state.last_epoch {
            return Ok(());
        }
        if !status.allocated {
            log::trace!("{}: not allocated yet", self.kind);
            state.last_epoch = epoch;
            return Ok(());
        }
        state.range = status.range;
        if status.eviction_in_progress {
            log::trace!("{}: eviction in progress, skipping epoch {epoch}", self.kind);
            state.last_epoch = epoch;
            return Ok(());
        }

        let guard = self.ctx.lock()?;
        state.last_epoch = epoch;
        let target = guard.target();
        if self.kind.is_managed() && status.eviction_count != state.eviction_count {
            self.reset_after_eviction(&mut state, target, status.eviction_count, epoch)?;
        } else {
            self.walk_new(&mut state, target)?;
        }
        self.promote_unallocated(&mut state, epoch)?;
        self.refresh_compilations(&mut state, epoch)?;
        log::trace!(
            "{}: epoch {epoch}, {} compilations, {} unallocated",
            self.kind,
            state.known.len(),
            state.unallocated.len()
        );
        Ok(())
    }

    /// Register list entries past the ones already seen.
    fn walk_new(
        &self,
        state: &mut RegistryState,
        target: &dyn TargetVm,
    ) -> Result<(), InspectorError> {
        let references = target.compilation_refs(self.kind, state.seen)?;
        let records = read_records(target, &references)?;
        for (reference, record) in references.into_iter().zip(records) {
            state.seen += 1;
            if state.known.contains_key(&reference) {
                continue;
            }
            let compilation =
                CompiledMethod::new(self.ctx.clone(), reference, self.kind, record);
            self.register(state, compilation)?;
        }
        Ok(())
    }

    /// Every address issued before an eviction may be stale: start over
    /// from the target's list, keep the identity of survivors and retire
    /// the rest.
    fn reset_after_eviction(
        &self,
        state: &mut RegistryState,
        target: &dyn TargetVm,
        eviction_count: u64,
        epoch: u64,
    ) -> Result<(), InspectorError> {
        log::debug!(
            "{}: eviction {} -> {}, rebuilding {} compilations",
            self.kind,
            state.eviction_count,
            eviction_count,
            state.known.len()
        );
        // Read everything first so a failed read leaves the old view intact.
        let references = target.compilation_refs(self.kind, 0)?;
        let records = read_records(target, &references)?;

        let mut previous = std::mem::take(&mut state.known);
        state.index.clear();
        state.unallocated.clear();
        state.seen = 0;
        state.eviction_count = eviction_count;

        for (reference, record) in references.into_iter().zip(records) {
            state.seen += 1;
            let compilation = match previous.remove(&reference) {
                Some(survivor) => {
                    survivor.apply_record(record, epoch);
                    survivor
                }
                None => CompiledMethod::new(self.ctx.clone(), reference, self.kind, record),
            };
            self.register(state, compilation)?;
        }
        for evicted in previous.into_values() {
            evicted.mark_evicted();
        }
        Ok(())
    }

    fn promote_unallocated(
        &self,
        state: &mut RegistryState,
        epoch: u64,
    ) -> Result<(), InspectorError> {
        if state.unallocated.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut state.unallocated);
        for compilation in pending {
            if let Err(err) = compilation.refresh(epoch) {
                if err.is_fatal() {
                    return Err(err);
                }
                log::warn!("{}: rereading {} failed: {err}", self.kind, compilation.id());
            }
            if compilation.is_evicted() {
                continue;
            }
            if compilation.is_allocated() {
                log::debug!(
                    "allocated compilation {} at {:?} in {}",
                    compilation.id(),
                    compilation.allocation(),
                    self.kind
                );
                self.index(state, compilation)?;
            } else {
                state.unallocated.push(compilation);
            }
        }
        Ok(())
    }

    /// Per-compilation refresh, re-indexing anything that moved.
    fn refresh_compilations(
        &self,
        state: &mut RegistryState,
        epoch: u64,
    ) -> Result<(), InspectorError> {
        let indexed: Vec<Arc<CompiledMethod>> = state
            .index
            .iter()
            .map(|(_, compilation)| compilation.clone())
            .collect();
        for compilation in indexed {
            let before = compilation.allocation();
            match compilation.refresh(epoch) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!("{}: refreshing {} failed: {err}", self.kind, compilation.id());
                    continue;
                }
            }
            if compilation.is_evicted() {
                state.index.remove(before.start);
                continue;
            }
            if compilation.allocation() != before {
                state.index.remove(before.start);
                self.index(state, compilation)?;
            }
        }
        Ok(())
    }

    fn register(
        &self,
        state: &mut RegistryState,
        compilation: Arc<CompiledMethod>,
    ) -> Result<(), InspectorError> {
        if compilation.is_allocated() {
            self.index(state, compilation.clone())?;
        } else {
            log::debug!(
                "compilation {} in {} has no allocation yet",
                compilation.id(),
                self.kind
            );
            state.unallocated.push(compilation.clone());
        }
        state.known.insert(compilation.reference(), compilation);
        Ok(())
    }

    fn index(
        &self,
        state: &mut RegistryState,
        compilation: Arc<CompiledMethod>,
    ) -> Result<(), InspectorError> {
        let allocation = compilation.allocation();
        if !state.range.encloses(&allocation) {
            log::error!(
                "compilation {} at {allocation:?} lies outside {} {:?}",
                compilation.id(),
                self.kind,
                state.range
            );
            return Err(InspectorError::OutsideRegion {
                region: self.kind.name().to_string(),
                start: allocation.start,
                length: allocation.length,
            });
        }
        state.index.add(allocation, compilation)
    }

    pub fn write_summary(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        writeln!(
            out,
            "{} {:?}: {} compilations, {} unallocated, {} evictions",
            self.kind,
            state.range,
            state.known.len(),
            state.unallocated.len(),
            state.eviction_count
        )?;
        for (range, compilation) in state.index.iter() {
            writeln!(out, "  {range:?} {}", compilation.name())?;
        }
        Ok(())
    }
}

fn read_records(
    target: &dyn TargetVm,
    references: &[CompilationRef],
) -> Result<Vec<CompilationRecord>, InspectorError> {
    references
        .iter()
        .map(|&reference| target.read_compilation(reference).map_err(Into::into))
        .collect()
}
