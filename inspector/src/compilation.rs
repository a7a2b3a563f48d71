use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::address::{Address, MemoryRange};
use crate::context::InspectorContext;
use crate::error::InspectorError;
use crate::machine_code::{CodeSource, MachineCodeInfo, MachineCodeInfoCache};
use crate::target::{
    CompilationRecord, CompilationRef, DataArrayKind, MethodKey, MethodRef, RegionKind,
    TargetVm,
};

/// Inspector-local identity of a compilation, stable for the lifetime of
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompilationId(pub(crate) u64);

impl fmt::Display for CompilationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct CompilationState {
    record: CompilationRecord,
    evicted: bool,
    last_epoch: u64,
}

/// Local surrogate for one compilation in the target's code cache.
pub struct CompiledMethod {
    ctx: Arc<InspectorContext>,
    id: CompilationId,
    reference: CompilationRef,
    region: RegionKind,
    state: RwLock<CompilationState>,
    key: Mutex<Option<MethodKey>>,
    code: MachineCodeInfoCache,
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("CompiledMethod")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("allocation", &state.record.allocation)
            .field("evicted", &state.evicted)
            .finish()
    }
}

impl CompiledMethod {
    pub(crate) fn new(
        ctx: Arc<InspectorContext>,
        reference: CompilationRef,
        region: RegionKind,
        record: CompilationRecord,
    ) -> Arc<Self> {
        let id = ctx.next_compilation_id();
        log::debug!(
            "discovered compilation {id} at {:?} in {region}",
            record.allocation
        );
        Arc::new(Self {
            ctx,
            id,
            reference,
            region,
            state: RwLock::new(CompilationState {
                record,
                evicted: false,
                last_epoch: 0,
            }),
            key: Mutex::new(None),
            code: MachineCodeInfoCache::new(),
        })
    }

    pub fn id(&self) -> CompilationId {
        self.id
    }

    /// The target's reference to the compilation-metadata record.
    pub fn reference(&self) -> CompilationRef {
        self.reference
    }

    pub fn region(&self) -> RegionKind {
        self.region
    }

    pub fn record(&self) -> CompilationRecord {
        self.state.read().record.clone()
    }

    pub fn method(&self) -> MethodRef {
        self.state.read().record.method
    }

    /// The whole code-cache allocation, data arrays included.
    pub fn allocation(&self) -> MemoryRange {
        self.state.read().record.allocation
    }

    pub fn code_start(&self) -> Address {
        self.state.read().record.code_start
    }

    pub fn code_range(&self) -> MemoryRange {
        let state = self.state.read();
        MemoryRange::new(state.record.code_start, state.record.code_length)
    }

    pub fn is_allocated(&self) -> bool {
        let state = self.state.read();
        !state.record.allocation.start.is_zero() && !state.record.allocation.is_empty()
    }

    pub fn is_evicted(&self) -> bool {
        self.state.read().evicted
    }

    pub fn is_baseline(&self) -> bool {
        self.state.read().record.baseline
    }

    /// Current origin of one of the embedded data arrays. `None` after
    /// eviction or when the compilation has no such array.
    pub fn data_array_origin(&self, kind: DataArrayKind) -> Option<Address> {
        let state = self.state.read();
        if state.evicted {
            return None;
        }
        let origin = state.record.arrays.origin(kind);
        (!origin.is_zero()).then_some(origin)
    }

    /// Address ordinary calls enter through.
    pub fn call_entry_point(&self) -> Address {
        call_entry(&self.state.read().record, self.ctx.target())
    }

    /// Region letter and id, e.g. `O#3`.
    pub fn designator(&self) -> String {
        format!("{}{}", self.region.designator(), self.id)
    }

    /// Key of the compiled method. Needs the target the first time.
    pub fn method_key(&self) -> Result<MethodKey, InspectorError> {
        if let Some(key) = self.key.lock().as_ref() {
            return Ok(key.clone());
        }
        let guard = self.ctx.lock()?;
        let key = guard.target().method_info(self.method())?.key;
        *self.key.lock() = Some(key.clone());
        Ok(key)
    }

    pub fn name(&self) -> String {
        match self.method_key() {
            Ok(key) => format!("{key}[{}]", self.designator()),
            Err(_) => format!("<unknown>[{}]", self.designator()),
        }
    }

    // ── Machine code ──────────────────────────────────────────────────

    /// Current machine code snapshot, reloaded first if it is known to be
    /// stale and the target can be locked.
    pub fn machine_code_info(&self) -> Arc<MachineCodeInfo> {
        self.code.get(&self.ctx, |target| self.load_source(target))
    }

    /// Snapshot in hand, without trying the target.
    pub fn cached_machine_code_info(&self) -> Arc<MachineCodeInfo> {
        self.code.current()
    }

    /// Last snapshot that held code; still there after eviction.
    pub fn last_loaded_machine_code_info(&self) -> Option<Arc<MachineCodeInfo>> {
        self.code.last_loaded()
    }

    pub fn code_version(&self) -> u64 {
        self.code.version()
    }

    pub fn is_code_dirty(&self) -> bool {
        self.code.is_dirty()
    }

    fn load_source(&self, target: &dyn TargetVm) -> Result<CodeSource, InspectorError> {
        let record = target.read_compilation(self.reference)?;
        if record.code_start.is_zero() || record.code_length == 0 {
            return Ok(CodeSource {
                method: Some(record.method),
                ..Default::default()
            });
        }
        let code = target.read_bytes(record.code_start, record.code_length)?;
        let details = target.read_code_details(self.reference)?;
        let info = target.method_info(record.method)?;
        *self.key.lock() = Some(info.key);
        Ok(CodeSource {
            method: Some(record.method),
            bytecodes: info.bytecodes,
            code_start: record.code_start,
            call_entry: call_entry(&record, target),
            code,
            details,
        })
    }

    // ── Refresh ───────────────────────────────────────────────────────

    /// Re-read the metadata record once per epoch, noticing eviction,
    /// relocation and patching.
    pub(crate) fn refresh(&self, epoch: u64) -> Result<(), InspectorError> {
        {
            let state = self.state.read();
            if state.evicted || epoch <= state.last_epoch {
                return Ok(());
            }
        }
        let guard = self.ctx.lock()?;
        let target = guard.target();
        let record = target.read_compilation(self.reference)?;

        let sentinel = target.wiped_code_sentinel();
        if !sentinel.is_zero() && record.arrays.code == sentinel {
            self.state.write().last_epoch = epoch;
            self.mark_evicted();
            return Ok(());
        }
        self.apply_record(record, epoch);

        if self.ctx.settings().detect_patches && !self.code.is_dirty() && self.code.is_loaded() {
            let snapshot = self.code.current();
            let now = target.read_bytes(snapshot.code_start(), snapshot.code().len())?;
            if now != snapshot.code() {
                log::debug!(
                    "PATCHED compilation {} in {} at {:?}",
                    self.id,
                    self.region,
                    snapshot.code_start()
                );
                self.code.mark_dirty();
            }
        }
        Ok(())
    }

    /// Take over a freshly read record, marking the machine code stale if
    /// the code moved or just got its allocation.
    pub(crate) fn apply_record(&self, record: CompilationRecord, epoch: u64) {
        let mut state = self.state.write();
        let old = &state.record;
        if !old.allocation.start.is_zero() && old.allocation.start != record.allocation.start {
            log::debug!(
                "RELOCATED compilation {} in {}: {:?} -> {:?}",
                self.id,
                self.region,
                old.allocation,
                record.allocation
            );
            self.code.mark_dirty();
        } else if old.code_start != record.code_start {
            log::debug!(
                "compilation {} in {} allocated code at {:?}",
                self.id,
                self.region,
                record.code_start
            );
            self.code.mark_dirty();
        }
        state.record = record;
        state.last_epoch = state.last_epoch.max(epoch);
    }

    pub(crate) fn mark_evicted(&self) {
        {
            let mut state = self.state.write();
            if state.evicted {
                return;
            }
            state.evicted = true;
        }
        log::debug!("EVICTED compilation {} from {}", self.id, self.region);
        self.code.mark_evicted();
    }

    /// Whether `address` names a byte of this compilation's live code.
    ///
    /// Asking about an address outside the allocation is an error.
    pub fn is_valid_code_location(&self, address: Address) -> Result<bool, InspectorError> {
        let state = self.state.read();
        if state.evicted {
            return Ok(false);
        }
        if !state.record.allocation.contains(address) {
            return Err(InspectorError::AddressNotInRegion {
                region: self.designator(),
                address,
            });
        }
        let code = MemoryRange::new(state.record.code_start, state.record.code_length);
        Ok(code.contains(address))
    }

    pub fn write_summary(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let key = self.key.lock().clone();
        match key {
            Some(key) => writeln!(out, "code for: {key}")?,
            None => writeln!(out, "code for: {:?}", self.method())?,
        }
        writeln!(
            out,
            "compilation: {} {} {:?}{}",
            self.designator(),
            self.region,
            self.allocation(),
            if self.is_evicted() { " (evicted)" } else { "" }
        )?;
        let info = self.last_loaded_machine_code_info();
        match info {
            Some(info) => writeln!(out, "{}", info.listing()),
            None => writeln!(out, "  <machine code not loaded>"),
        }
    }
}

pub(crate) fn call_entry(record: &CompilationRecord, target: &dyn TargetVm) -> Address {
    if record.code_start.is_zero() {
        return Address::ZERO;
    }
    match record.adapter_offset {
        Some(offset) if target.needs_adapters() => record.code_start.plus(offset),
        _ => record.code_start,
    }
}
