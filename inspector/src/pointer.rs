//! Stable handles to machine-code bytes.
//!
//! Every region hands out its own pointers and memoizes them, so two
//! requests for the same logical location get the same `Arc` while anyone
//! still holds it.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::{Address, MemoryRange};
use crate::compilation::{CompilationId, CompiledMethod};
use crate::error::InspectorError;
use crate::memo::MemoTable;
use crate::registry::CompiledCodeRegistry;

enum PointerTarget {
    /// Code that never moves.
    Constant(Address),
    /// Code that moves with its compilation; `offset` is from the start of
    /// the allocation.
    Tracking {
        compilation: Arc<CompiledMethod>,
        offset: usize,
    },
}

/// "The machine-code byte currently at some evolving address."
pub struct CodePointer {
    target: PointerTarget,
}

impl CodePointer {
    fn constant(address: Address) -> Self {
        Self {
            target: PointerTarget::Constant(address),
        }
    }

    fn tracking(compilation: Arc<CompiledMethod>, offset: usize) -> Self {
        Self {
            target: PointerTarget::Tracking {
                compilation,
                offset,
            },
        }
    }

    /// Current address, or `None` once the code is gone.
    ///
    /// Tracking pointers look at their compilation on every call.
    pub fn resolve(&self) -> Option<Address> {
        match &self.target {
            PointerTarget::Constant(address) => Some(*address),
            PointerTarget::Tracking {
                compilation,
                offset,
            } => {
                if compilation.is_evicted() {
                    return None;
                }
                Some(compilation.allocation().start.plus(*offset))
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.resolve().is_some()
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.target, PointerTarget::Tracking { .. })
    }

    pub fn compilation(&self) -> Option<&Arc<CompiledMethod>> {
        match &self.target {
            PointerTarget::Constant(_) => None,
            PointerTarget::Tracking { compilation, .. } => Some(compilation),
        }
    }
}

impl fmt::Debug for CodePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            PointerTarget::Constant(address) => write!(f, "CodePointer({address:?})"),
            PointerTarget::Tracking {
                compilation,
                offset,
            } => write!(
                f,
                "CodePointer({}+0x{offset:x} -> {:?})",
                compilation.designator(),
                self.resolve()
            ),
        }
    }
}

pub trait CodePointerManager: Send + Sync {
    fn region_name(&self) -> &str;

    /// Whether `address` currently names a byte of code in this region.
    ///
    /// Fails for addresses outside the region.
    fn is_valid_code_pointer(&self, address: Address) -> Result<bool, InspectorError>;

    /// The canonical pointer for `address`, or `None` when no code lives
    /// there. Fails for addresses outside the region.
    fn make_code_pointer(&self, address: Address)
    -> Result<Option<Arc<CodePointer>>, InspectorError>;

    /// Pointers some caller still holds.
    fn active_pointer_count(&self) -> usize;

    /// Pointers still in the memo table.
    fn total_pointer_count(&self) -> usize;

    /// Forget pointers no caller holds.
    fn sweep(&self) -> usize;
}

fn not_in_region(region: &str, address: Address) -> InspectorError {
    InspectorError::AddressNotInRegion {
        region: region.to_string(),
        address,
    }
}

// ── Native libraries and external code ────────────────────────────────

/// Constant pointers into a fixed range whose bytes are all code.
pub struct NativeCodePointerManager {
    name: String,
    range: MemoryRange,
    pointers: MemoTable<Address, CodePointer>,
}

impl NativeCodePointerManager {
    pub fn new(name: impl Into<String>, range: MemoryRange) -> Self {
        Self {
            name: name.into(),
            range,
            pointers: MemoTable::new(),
        }
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }
}

impl CodePointerManager for NativeCodePointerManager {
    fn region_name(&self) -> &str {
        &self.name
    }

    fn is_valid_code_pointer(&self, address: Address) -> Result<bool, InspectorError> {
        if !self.range.contains(address) {
            return Err(not_in_region(&self.name, address));
        }
        Ok(true)
    }

    fn make_code_pointer(
        &self,
        address: Address,
    ) -> Result<Option<Arc<CodePointer>>, InspectorError> {
        self.is_valid_code_pointer(address)?;
        Ok(Some(
            self.pointers
                .get_or_add(address, || CodePointer::constant(address)),
        ))
    }

    fn active_pointer_count(&self) -> usize {
        self.pointers.live_count()
    }

    fn total_pointer_count(&self) -> usize {
        self.pointers.total_count()
    }

    fn sweep(&self) -> usize {
        self.pointers.sweep()
    }
}

// ── Unmanaged code cache regions ──────────────────────────────────────

/// Constant pointers into a code cache region whose code never moves.
pub struct UnmanagedCodePointerManager {
    registry: Arc<CompiledCodeRegistry>,
    pointers: MemoTable<Address, CodePointer>,
}

impl UnmanagedCodePointerManager {
    pub fn new(registry: Arc<CompiledCodeRegistry>) -> Self {
        Self {
            registry,
            pointers: MemoTable::new(),
        }
    }
}

impl CodePointerManager for UnmanagedCodePointerManager {
    fn region_name(&self) -> &str {
        self.registry.kind().name()
    }

    fn is_valid_code_pointer(&self, address: Address) -> Result<bool, InspectorError> {
        if !self.registry.range().contains(address) {
            return Err(not_in_region(self.region_name(), address));
        }
        match self.registry.find(address) {
            Some(compilation) => compilation.is_valid_code_location(address),
            None => Ok(false),
        }
    }

    fn make_code_pointer(
        &self,
        address: Address,
    ) -> Result<Option<Arc<CodePointer>>, InspectorError> {
        if !self.registry.range().contains(address) {
            return Err(not_in_region(self.region_name(), address));
        }
        if self.registry.find(address).is_none() {
            return Ok(None);
        }
        Ok(Some(
            self.pointers
                .get_or_add(address, || CodePointer::constant(address)),
        ))
    }

    fn active_pointer_count(&self) -> usize {
        self.pointers.live_count()
    }

    fn total_pointer_count(&self) -> usize {
        self.pointers.total_count()
    }

    fn sweep(&self) -> usize {
        self.pointers.sweep()
    }
}

// ── Managed code cache regions ────────────────────────────────────────

/// Tracking pointers that follow their compilation through relocation
/// and die with it on eviction.
pub struct ManagedCodePointerManager {
    registry: Arc<CompiledCodeRegistry>,
    pointers: MemoTable<(CompilationId, usize), CodePointer>,
}

impl ManagedCodePointerManager {
    pub fn new(registry: Arc<CompiledCodeRegistry>) -> Self {
        Self {
            registry,
            pointers: MemoTable::new(),
        }
    }
}

impl CodePointerManager for ManagedCodePointerManager {
    fn region_name(&self) -> &str {
        self.registry.kind().name()
    }

    fn is_valid_code_pointer(&self, address: Address) -> Result<bool, InspectorError> {
        if !self.registry.range().contains(address) {
            return Err(not_in_region(self.region_name(), address));
        }
        match self.registry.find(address) {
            Some(compilation) => compilation.is_valid_code_location(address),
            None => Ok(false),
        }
    }

    fn make_code_pointer(
        &self,
        address: Address,
    ) -> Result<Option<Arc<CodePointer>>, InspectorError> {
        if !self.registry.range().contains(address) {
            return Err(not_in_region(self.region_name(), address));
        }
        let Some(compilation) = self.registry.find(address) else {
            return Ok(None);
        };
        let Some(offset) = address.offset_from(compilation.allocation().start) else {
            return Ok(None);
        };
        Ok(Some(self.pointers.get_or_add(
            (compilation.id(), offset),
            || CodePointer::tracking(compilation, offset),
        )))
    }

    fn active_pointer_count(&self) -> usize {
        self.pointers.live_count()
    }

    fn total_pointer_count(&self) -> usize {
        self.pointers.total_count()
    }

    fn sweep(&self) -> usize {
        self.pointers.sweep()
    }
}

// ── Disconnected code ─────────────────────────────────────────────────

/// Code found nowhere the inspector knows about.
///
/// Validity only means "not inside any other known memory".
pub struct DisconnectedCodePointerManager {
    known: RwLock<Vec<(String, MemoryRange)>>,
    pointers: MemoTable<Address, CodePointer>,
}

impl Default for DisconnectedCodePointerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DisconnectedCodePointerManager {
    pub const REGION_NAME: &'static str = "disconnected code";

    pub fn new() -> Self {
        Self {
            known: RwLock::new(Vec::new()),
            pointers: MemoTable::new(),
        }
    }

    /// Replace the set of regions owned by someone else.
    pub fn set_known_regions(&self, regions: Vec<(String, MemoryRange)>) {
        *self.known.write() = regions;
    }

    fn owner_of(&self, address: Address) -> Option<String> {
        self.known
            .read()
            .iter()
            .find(|(_, range)| range.contains(address))
            .map(|(name, _)| name.clone())
    }
}

impl CodePointerManager for DisconnectedCodePointerManager {
    fn region_name(&self) -> &str {
        Self::REGION_NAME
    }

    fn is_valid_code_pointer(&self, address: Address) -> Result<bool, InspectorError> {
        Ok(!address.is_zero() && self.owner_of(address).is_none())
    }

    fn make_code_pointer(
        &self,
        address: Address,
    ) -> Result<Option<Arc<CodePointer>>, InspectorError> {
        if let Some(owner) = self.owner_of(address) {
            log::trace!("{address:?} belongs to {owner}, not disconnected code");
            return Err(not_in_region(Self::REGION_NAME, address));
        }
        Ok(Some(
            self.pointers
                .get_or_add(address, || CodePointer::constant(address)),
        ))
    }

    fn active_pointer_count(&self) -> usize {
        self.pointers.live_count()
    }

    fn total_pointer_count(&self) -> usize {
        self.pointers.total_count()
    }

    fn sweep(&self) -> usize {
        self.pointers.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{MethodKey, RegionKind};
    use crate::testing::{CODE_OFFSET, FakeVm, x64_context};

    const CODE: [u8; 3] = [0x55, 0x5D, 0xC3];

    fn region(vm: &Arc<FakeVm>, kind: RegionKind, start: u64) -> Arc<CompiledCodeRegistry> {
        vm.add_region(kind, start, 0x1_0000);
        let method = vm.add_method(MethodKey::new("A", "f", "()V"), vec![0xB1]);
        vm.add_compilation(kind, method, start, &CODE);
        let registry = Arc::new(CompiledCodeRegistry::new(x64_context(vm), kind));
        registry.refresh(1, &vm.region(kind)).expect("refresh");
        registry
    }

    #[test]
    fn unmanaged_pointers_are_canonical_and_constant() {
        let vm = Arc::new(FakeVm::new());
        let registry = region(&vm, RegionKind::Boot, 0x1000_0000);
        let manager = UnmanagedCodePointerManager::new(registry);
        let address = Address::new(0x1000_0000 + CODE_OFFSET as u64 + 1);

        let a = manager.make_code_pointer(address).expect("ok").expect("code");
        let b = manager.make_code_pointer(address).expect("ok").expect("code");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.resolve(), Some(address));
        assert_eq!(b.resolve(), Some(address));
        assert!(!a.is_tracking());

        let other = manager
            .make_code_pointer(address.plus(1))
            .expect("ok")
            .expect("code");
        assert_eq!(manager.active_pointer_count(), 2);
        drop(other);
        assert_eq!(manager.active_pointer_count(), 1);
        assert_eq!(manager.total_pointer_count(), 2);
        assert_eq!(manager.sweep(), 1);
        assert_eq!(manager.total_pointer_count(), 1);
        drop(b);
        assert_eq!(manager.active_pointer_count(), 1);
    }

    #[test]
    fn missing_code_is_no_pointer_but_foreign_address_is_an_error() {
        let vm = Arc::new(FakeVm::new());
        let registry = region(&vm, RegionKind::Boot, 0x1000_0000);
        let manager = UnmanagedCodePointerManager::new(registry);

        let empty = Address::new(0x1000_8000);
        assert!(manager.make_code_pointer(empty).expect("in region").is_none());
        assert!(!manager.is_valid_code_pointer(empty).expect("in region"));
        assert!(manager.is_valid_code_pointer(Address::new(0x1000_0020)).expect("code"));
        // data arrays are inside the allocation but are not code
        assert!(!manager.is_valid_code_pointer(Address::new(0x1000_0000)).expect("data"));

        let err = manager
            .make_code_pointer(Address::new(0x2000_0000))
            .expect_err("outside");
        assert!(matches!(err, InspectorError::AddressNotInRegion { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn managed_pointers_follow_relocation_and_die_on_eviction() {
        let vm = Arc::new(FakeVm::new());
        let registry = region(&vm, RegionKind::Baseline, 0x2000_0000);
        let manager = ManagedCodePointerManager::new(registry.clone());
        let address = Address::new(0x2000_0000 + CODE_OFFSET as u64);

        let pointer = manager.make_code_pointer(address).expect("ok").expect("code");
        assert!(pointer.is_tracking());
        assert!(pointer.is_live());
        assert_eq!(pointer.resolve(), Some(address));
        let again = manager.make_code_pointer(address).expect("ok").expect("code");
        assert!(Arc::ptr_eq(&pointer, &again));

        let compilation = pointer.compilation().expect("tracking").clone();
        vm.relocate(compilation.reference(), 0x2000_4000);
        vm.evict(RegionKind::Baseline, &[compilation.reference()]);
        registry.refresh(2, &vm.region(RegionKind::Baseline)).expect("refresh");
        assert_eq!(
            pointer.resolve(),
            Some(Address::new(0x2000_4000 + CODE_OFFSET as u64))
        );

        vm.evict(RegionKind::Baseline, &[]);
        registry.refresh(3, &vm.region(RegionKind::Baseline)).expect("refresh");
        assert!(!pointer.is_live());
        assert_eq!(pointer.resolve(), None);
        assert_eq!(pointer.resolve(), None);
    }

    #[test]
    fn native_pointers_cover_their_range() {
        let range = MemoryRange::new(Address::new(0x7f00_0000), 0x1000);
        let manager = NativeCodePointerManager::new("libc.so", range);
        assert_eq!(manager.region_name(), "libc.so");
        let pointer = manager
            .make_code_pointer(Address::new(0x7f00_0010))
            .expect("ok")
            .expect("code");
        assert!(pointer.is_live());
        assert!(manager.is_valid_code_pointer(Address::new(0x7f00_0fff)).expect("inside"));
        assert!(manager.make_code_pointer(Address::new(0x7f00_1000)).is_err());
    }

    #[test]
    fn disconnected_pointers_avoid_known_memory() {
        let manager = DisconnectedCodePointerManager::new();
        manager.set_known_regions(vec![(
            "heap".to_string(),
            MemoryRange::new(Address::new(0x1000), 0x1000),
        )]);
        assert!(!manager.is_valid_code_pointer(Address::new(0x1800)).expect("check"));
        assert!(!manager.is_valid_code_pointer(Address::ZERO).expect("check"));
        assert!(manager.is_valid_code_pointer(Address::new(0x9000)).expect("check"));
        assert!(manager.make_code_pointer(Address::new(0x1800)).is_err());
        let pointer = manager
            .make_code_pointer(Address::new(0x9000))
            .expect("ok")
            .expect("code");
        assert_eq!(pointer.resolve(), Some(Address::new(0x9000)));
        assert_eq!(manager.active_pointer_count(), 1);
    }
}
