//! Entry point to everything the inspector knows about code in the target.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::address::{Address, MemoryRange};
use crate::compilation::{self, CompiledMethod};
use crate::context::InspectorContext;
use crate::error::InspectorError;
use crate::interval::IntervalIndex;
use crate::location::{CodeLocation, LocationResolver, MachineCodeOwner};
use crate::pointer::{CodePointer, CodePointerManager, DisconnectedCodePointerManager};
use crate::region::{CodeCacheRegion, ExternalCode, NativeLibrary};
use crate::settings::{InspectorCreateInfo, InspectorSettings};
use crate::target::{LibraryInfo, MethodAccess, MethodKey, MethodRef, RegionKind, TargetVm};

struct EpochState {
    last_epoch: u64,
    refreshes: u64,
}

/// Coordinates the boot, baseline and optimized code cache regions,
/// native libraries and external code blocks of one target.
pub struct CodeCacheAccess {
    ctx: Arc<InspectorContext>,
    regions: Vec<CodeCacheRegion>,
    libraries: RwLock<Vec<Arc<NativeLibrary>>>,
    external: RwLock<IntervalIndex<Arc<ExternalCode>>>,
    disconnected: DisconnectedCodePointerManager,
    epoch: Mutex<EpochState>,
}

impl CodeCacheAccess {
    pub fn new(
        target: Arc<dyn TargetVm>,
        info: InspectorCreateInfo,
    ) -> Result<Self, InspectorError> {
        let settings = InspectorSettings::from_info(&info).map_err(InspectorError::Settings)?;
        let ctx = InspectorContext::new(target, settings)?;
        let regions = RegionKind::ALL
            .into_iter()
            .map(|kind| CodeCacheRegion::new(ctx.clone(), kind))
            .collect();
        Ok(Self {
            ctx,
            regions,
            libraries: RwLock::new(Vec::new()),
            external: RwLock::new(IntervalIndex::new()),
            disconnected: DisconnectedCodePointerManager::new(),
            epoch: Mutex::new(EpochState {
                last_epoch: 0,
                refreshes: 0,
            }),
        })
    }

    pub fn context(&self) -> &Arc<InspectorContext> {
        &self.ctx
    }

    pub fn region(&self, kind: RegionKind) -> &CodeCacheRegion {
        let index = match kind {
            RegionKind::Boot => 0,
            RegionKind::Baseline => 1,
            RegionKind::Optimized => 2,
        };
        &self.regions[index]
    }

    pub fn regions(&self) -> &[CodeCacheRegion] {
        &self.regions
    }

    // ── Refresh ───────────────────────────────────────────────────────

    /// Run one refresh epoch. Region memory status is read for every
    /// region before any compilation is looked at.
    ///
    /// A busy target fails with [`InspectorError::Busy`] and the epoch can
    /// be retried. Recoverable per-region failures are logged and skipped.
    pub fn update_cache(&self, epoch: u64) -> Result<(), InspectorError> {
        let mut state = self.epoch.lock();
        if epoch <= state.last_epoch {
            return Ok(());
        }
        let guard = self.ctx.lock()?;
        let target = guard.target();

        for region in &self.regions {
            region.update_memory_status(target)?;
        }
        state.last_epoch = epoch;

        for region in &self.regions {
            match region.refresh(epoch) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log::warn!("refreshing {} failed: {err}", region.kind()),
            }
        }
        match target.native_libraries() {
            Ok(found) => self.update_libraries(found),
            Err(err) => log::warn!("reading native libraries failed: {err}"),
        }
        self.disconnected.set_known_regions(self.known_regions(target));

        state.refreshes += 1;
        if state.refreshes % self.ctx.settings().sweep_interval == 0 {
            let swept = self.sweep();
            log::trace!("epoch {epoch}: swept {swept} unused handles");
        }
        Ok(())
    }

    fn update_libraries(&self, found: Vec<LibraryInfo>) {
        let mut libraries = self.libraries.write();
        for info in found {
            let known = libraries
                .iter()
                .any(|lib| lib.name() == info.name && lib.range() == info.range);
            if !known {
                log::debug!("native library {} at {:?}", info.name, info.range);
                libraries.push(Arc::new(NativeLibrary::new(info.name, info.range)));
            }
        }
    }

    /// Everything some other manager owns, as seen by disconnected code.
    fn known_regions(&self, target: &dyn TargetVm) -> Vec<(String, MemoryRange)> {
        let mut known: Vec<(String, MemoryRange)> = self
            .regions
            .iter()
            .filter(|region| region.is_allocated())
            .map(|region| (region.kind().name().to_string(), region.range()))
            .collect();
        known.extend(
            self.libraries
                .read()
                .iter()
                .map(|lib| (lib.name().to_string(), lib.range())),
        );
        known.extend(
            self.external
                .read()
                .iter()
                .map(|(range, code)| (code.name().to_string(), range)),
        );
        known.extend(target.data_regions());
        known
    }

    /// Drop memo slots for pointers and references nobody holds.
    pub fn sweep(&self) -> usize {
        let regions: usize = self.regions.iter().map(CodeCacheRegion::sweep).sum();
        let libraries: usize = self
            .libraries
            .read()
            .iter()
            .map(|lib| lib.pointers().sweep())
            .sum();
        let external: usize = self
            .external
            .read()
            .iter()
            .map(|(_, code)| code.pointers().sweep())
            .sum();
        regions + libraries + external + self.disconnected.sweep()
    }

    // ── Lookup ────────────────────────────────────────────────────────

    /// The compilation whose allocation contains `address`.
    pub fn find_compiled_code(&self, address: Address) -> Option<Arc<CompiledMethod>> {
        self.regions
            .iter()
            .filter(|region| region.contains(address))
            .find_map(|region| region.find_compilation(address))
    }

    pub fn find_external_code(&self, address: Address) -> Option<Arc<ExternalCode>> {
        self.external
            .read()
            .find(address)
            .map(|(_, code)| code.clone())
    }

    pub fn find_native_library(&self, address: Address) -> Option<Arc<NativeLibrary>> {
        self.libraries
            .read()
            .iter()
            .find(|lib| lib.range().contains(address))
            .cloned()
    }

    fn is_data(&self, address: Address) -> bool {
        self.ctx
            .target()
            .data_regions()
            .iter()
            .any(|(_, range)| range.contains(address))
    }

    /// The canonical pointer for the code byte at `address`, from whichever
    /// manager owns it. `None` when the owning region has no code there.
    pub fn make_code_pointer(
        &self,
        address: Address,
    ) -> Result<Option<Arc<CodePointer>>, InspectorError> {
        if address.is_zero() || self.is_data(address) {
            return Err(InspectorError::InvalidAddress(address));
        }
        if let Some(region) = self.regions.iter().find(|region| region.contains(address)) {
            return region.pointers().make_code_pointer(address);
        }
        if let Some(code) = self.find_external_code(address) {
            return code.pointers().make_code_pointer(address);
        }
        if let Some(lib) = self.find_native_library(address) {
            return lib.pointers().make_code_pointer(address);
        }
        self.disconnected.make_code_pointer(address)
    }

    /// Register a block of native code by hand. Without a length, the
    /// configured guess is used.
    pub fn register_external_code(
        &self,
        address: Address,
        length: Option<usize>,
        name: impl Into<String>,
    ) -> Result<Arc<ExternalCode>, InspectorError> {
        if address.is_zero()
            || self.is_data(address)
            || self.regions.iter().any(|region| region.contains(address))
        {
            return Err(InspectorError::InvalidAddress(address));
        }
        let length = length.unwrap_or(self.ctx.settings().external_code_guess);
        let range = MemoryRange::new(address, length);
        let code = Arc::new(ExternalCode::new(self.ctx.clone(), name, range));
        self.external.write().add(range, code.clone())?;
        log::debug!("external code {} at {range:?}", code.name());
        Ok(code)
    }

    // ── Locations ─────────────────────────────────────────────────────

    pub fn create_machine_code_location(
        &self,
        address: Address,
        description: impl Into<String>,
    ) -> Result<CodeLocation, InspectorError> {
        if address.is_zero() {
            return Err(InspectorError::InvalidAddress(address));
        }
        Ok(CodeLocation::machine(address, description))
    }

    /// A machine location with its bytecode filled in from the owning
    /// compilation, falling back to a plain machine location.
    pub fn create_compiled_location(
        &self,
        address: Address,
        description: impl Into<String>,
    ) -> Result<CodeLocation, InspectorError> {
        if address.is_zero() {
            return Err(InspectorError::InvalidAddress(address));
        }
        Ok(match self.owner_of_code(address) {
            Ok(Some(owner)) => {
                CodeLocation::compiled(owner.method, owner.bci, address, description)
            }
            Ok(None) | Err(InspectorError::Busy) => CodeLocation::machine(address, description),
            Err(err) => return Err(err),
        })
    }

    pub fn create_bytecode_location_for_key(
        &self,
        key: MethodKey,
        description: impl Into<String>,
    ) -> CodeLocation {
        CodeLocation::for_key(key, description)
    }

    pub fn create_bytecode_location(
        &self,
        method: MethodRef,
        bci: i32,
        description: impl Into<String>,
    ) -> CodeLocation {
        CodeLocation::bytecode(method, bci, description)
    }

    pub fn create_method_access_location(
        &self,
        access: MethodAccess,
        description: impl Into<String>,
    ) -> CodeLocation {
        CodeLocation::method_access(access, description)
    }

    pub fn write_summary(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for region in &self.regions {
            region.write_summary(out)?;
        }
        for lib in self.libraries.read().iter() {
            writeln!(out, "native library {} {:?}", lib.name(), lib.range())?;
        }
        for (range, code) in self.external.read().iter() {
            writeln!(out, "external code {} {range:?}", code.name())?;
        }
        writeln!(
            out,
            "{} {} pointers ({} live)",
            self.disconnected.region_name(),
            self.disconnected.total_pointer_count(),
            self.disconnected.active_pointer_count()
        )
    }
}

impl LocationResolver for CodeCacheAccess {
    fn method_for_key(&self, key: &MethodKey) -> Result<Option<MethodRef>, InspectorError> {
        let guard = self.ctx.lock()?;
        Ok(guard.target().find_method(key)?)
    }

    fn key_of(&self, method: MethodRef) -> Result<Option<MethodKey>, InspectorError> {
        let guard = self.ctx.lock()?;
        Ok(Some(guard.target().method_info(method)?.key))
    }

    fn owner_of_code(
        &self,
        address: Address,
    ) -> Result<Option<MachineCodeOwner>, InspectorError> {
        let Some(compiled) = self.find_compiled_code(address) else {
            return Ok(None);
        };
        if compiled.is_evicted() {
            return Ok(None);
        }
        let info = compiled.machine_code_info();
        // Without a clean snapshot the absence of debug info means nothing.
        if compiled.is_code_dirty() || !info.is_loaded() {
            return Err(InspectorError::Busy);
        }
        let frame = info
            .find_instruction_index(address)
            .and_then(|index| info.debug_info(index).ok().flatten())
            .and_then(|debug| debug.top().copied());
        Ok(Some(match frame {
            Some(frame) => MachineCodeOwner {
                method: frame.method,
                bci: frame.bci.max(0),
            },
            None => MachineCodeOwner {
                method: compiled.method(),
                bci: 0,
            },
        }))
    }

    fn first_call_entry(&self, method: MethodRef) -> Result<Option<Address>, InspectorError> {
        let guard = self.ctx.lock()?;
        let target = guard.target();
        let Some(&first) = target.compilations_of(method)?.first() else {
            return Ok(None);
        };
        let known = self
            .regions
            .iter()
            .find_map(|region| region.registry().get(first));
        let entry = match known {
            Some(compiled) => compiled.call_entry_point(),
            None => compilation::call_entry(&target.read_compilation(first)?, target),
        };
        Ok((!entry.is_zero()).then_some(entry))
    }

    fn well_known_method(
        &self,
        access: &MethodAccess,
    ) -> Result<Option<MethodRef>, InspectorError> {
        let guard = self.ctx.lock()?;
        Ok(guard.target().well_known_method(access)?)
    }
}
