use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, MemoryRange};
use crate::compilation::CompiledMethod;
use crate::context::InspectorContext;
use crate::error::InspectorError;
use crate::machine_code::{CodeSource, MachineCodeInfo, MachineCodeInfoCache};
use crate::pointer::{
    CodePointerManager, ManagedCodePointerManager, NativeCodePointerManager,
    UnmanagedCodePointerManager,
};
use crate::reference::RemoteReferenceManager;
use crate::registry::CompiledCodeRegistry;
use crate::target::{RegionKind, RegionStatus, TargetVm};

// ── Code cache regions ────────────────────────────────────────────────

/// One of the target's code cache regions with everything the inspector
/// keeps about it.
pub struct CodeCacheRegion {
    kind: RegionKind,
    registry: Arc<CompiledCodeRegistry>,
    pointers: Box<dyn CodePointerManager>,
    references: RemoteReferenceManager,
    status: Mutex<RegionStatus>,
}

impl CodeCacheRegion {
    pub fn new(ctx: Arc<InspectorContext>, kind: RegionKind) -> Self {
        let registry = Arc::new(CompiledCodeRegistry::new(ctx, kind));
        let pointers: Box<dyn CodePointerManager> = if kind.is_managed() {
            Box::new(ManagedCodePointerManager::new(registry.clone()))
        } else {
            Box::new(UnmanagedCodePointerManager::new(registry.clone()))
        };
        Self {
            kind,
            references: RemoteReferenceManager::new(registry.clone()),
            registry,
            pointers,
            status: Mutex::new(RegionStatus::default()),
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<CompiledCodeRegistry> {
        &self.registry
    }

    pub fn pointers(&self) -> &dyn CodePointerManager {
        self.pointers.as_ref()
    }

    pub fn references(&self) -> &RemoteReferenceManager {
        &self.references
    }

    /// Target-side status as of the last memory-status update.
    pub fn status(&self) -> RegionStatus {
        *self.status.lock()
    }

    pub fn range(&self) -> MemoryRange {
        self.status.lock().range
    }

    pub fn is_allocated(&self) -> bool {
        self.status.lock().allocated
    }

    pub fn contains(&self, address: Address) -> bool {
        let status = self.status.lock();
        status.allocated && status.range.contains(address)
    }

    pub fn eviction_count(&self) -> u64 {
        self.status.lock().eviction_count
    }

    pub fn is_eviction_in_progress(&self) -> bool {
        self.status.lock().eviction_in_progress
    }

    /// First half of an epoch: must run for every region before any
    /// region refreshes its compilations.
    pub(crate) fn update_memory_status(
        &self,
        target: &dyn TargetVm,
    ) -> Result<(), InspectorError> {
        let status = target.region_status(self.kind)?;
        log::trace!(
            "{}: {:?} allocated={} evictions={}",
            self.kind,
            status.range,
            status.allocated,
            status.eviction_count
        );
        *self.status.lock() = status;
        Ok(())
    }

    pub(crate) fn refresh(&self, epoch: u64) -> Result<(), InspectorError> {
        let status = self.status();
        self.registry.refresh(epoch, &status)
    }

    pub fn find_compilation(&self, address: Address) -> Option<Arc<CompiledMethod>> {
        self.registry.find(address)
    }

    pub(crate) fn sweep(&self) -> usize {
        self.pointers.sweep() + self.references.sweep()
    }

    pub fn write_summary(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.registry.write_summary(out)?;
        writeln!(
            out,
            "  {} code pointers ({} live), {} references ({} live)",
            self.pointers.total_pointer_count(),
            self.pointers.active_pointer_count(),
            self.references.total_count(),
            self.references.live_count()
        )
    }
}

// ── Native libraries ──────────────────────────────────────────────────

pub struct NativeLibrary {
    name: String,
    pointers: NativeCodePointerManager,
}

impl NativeLibrary {
    pub fn new(name: impl Into<String>, range: MemoryRange) -> Self {
        let name = name.into();
        Self {
            pointers: NativeCodePointerManager::new(name.clone(), range),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> MemoryRange {
        self.pointers.range()
    }

    pub fn pointers(&self) -> &NativeCodePointerManager {
        &self.pointers
    }
}

// ── External code ─────────────────────────────────────────────────────

/// A block of native code registered by hand, with a best-effort
/// disassembly.
pub struct ExternalCode {
    ctx: Arc<InspectorContext>,
    name: String,
    pointers: NativeCodePointerManager,
    code: MachineCodeInfoCache,
}

impl ExternalCode {
    pub fn new(ctx: Arc<InspectorContext>, name: impl Into<String>, range: MemoryRange) -> Self {
        let name = name.into();
        Self {
            ctx,
            pointers: NativeCodePointerManager::new(name.clone(), range),
            name,
            code: MachineCodeInfoCache::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> MemoryRange {
        self.pointers.range()
    }

    pub fn pointers(&self) -> &NativeCodePointerManager {
        &self.pointers
    }

    pub fn machine_code_info(&self) -> Arc<MachineCodeInfo> {
        let range = self.range();
        self.code.get(&self.ctx, |target| {
            let code = target.read_bytes(range.start, range.length)?;
            Ok(CodeSource {
                code_start: range.start,
                call_entry: range.start,
                code,
                ..Default::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::MethodKey;
    use crate::testing::{FakeVm, x64_context};

    #[test]
    fn region_picks_pointer_flavour_by_kind() {
        let vm = Arc::new(FakeVm::new());
        vm.add_region(RegionKind::Baseline, 0x2000_0000, 0x1_0000);
        let method = vm.add_method(MethodKey::new("A", "f", "()V"), vec![0xB1]);
        vm.add_compilation(RegionKind::Baseline, method, 0x2000_0000, &[0xC3]);
        let region = CodeCacheRegion::new(x64_context(&vm), RegionKind::Baseline);

        assert!(!region.contains(Address::new(0x2000_0020)));
        region.update_memory_status(vm.as_ref()).expect("status");
        region.refresh(1).expect("refresh");
        assert!(region.contains(Address::new(0x2000_0020)));
        assert_eq!(region.pointers().region_name(), "baseline code cache");

        let pointer = region
            .pointers()
            .make_code_pointer(Address::new(0x2000_0020))
            .expect("in region")
            .expect("code");
        assert!(pointer.is_tracking());
        assert!(region.find_compilation(Address::new(0x2000_0020)).is_some());

        let mut out = String::new();
        region.write_summary(&mut out).expect("write");
        assert!(out.contains("baseline code cache"));
        assert!(out.contains("1 compilations"));
        assert!(out.contains("A.f()V"));
    }

    #[test]
    fn external_code_disassembles_best_effort() {
        let vm = Arc::new(FakeVm::new());
        vm.write_bytes(Address::new(0x9000), &[0x90, 0xC3]);
        let external = ExternalCode::new(
            x64_context(&vm),
            "stub",
            MemoryRange::new(Address::new(0x9000), 2),
        );
        let info = external.machine_code_info();
        assert_eq!(info.version(), 1);
        assert_eq!(info.instruction_count(), 2);
        assert_eq!(info.instruction(1).expect("index").mnemonic, "ret");
        assert!(external.pointers().make_code_pointer(Address::new(0x9001)).is_ok());
    }
}
