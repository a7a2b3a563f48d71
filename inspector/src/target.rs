//! What the inspector needs from the process-access layer.
//!
//! The target is one shared resource. Everything that touches its memory
//! or metadata runs under [`TargetGuard`], which is only ever obtained by
//! a non-blocking try-lock: when the target is busy the caller gets `None`
//! and serves whatever it cached before.

use std::fmt;

use bitflags::bitflags;
use disassembler::InlineDataKind;

use crate::address::{Address, MemoryRange};
use crate::error::DataIoError;

// ── Identities ────────────────────────────────────────────────────────

/// The target's own reference to a compilation-metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompilationRef(pub Address);

/// The target's reference to a method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef(pub Address);

/// Names a method independently of whether its class is loaded yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub holder: String,
    pub name: String,
    pub signature: String,
}

impl MethodKey {
    pub fn new(
        holder: impl Into<String>,
        name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            holder: holder.into(),
            name: name.into(),
            signature: signature.into(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.holder, self.name, self.signature)
    }
}

/// A well-known VM method located by name rather than by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodAccess {
    pub holder: &'static str,
    pub name: &'static str,
}

impl MethodAccess {
    pub const VM_RUN: Self = Self {
        holder: "MaxineVM",
        name: "run",
    };
}

impl fmt::Display for MethodAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.holder, self.name)
    }
}

// ── Code cache regions ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionKind {
    /// Code from the boot image; never moves, never grows after start-up.
    Boot,
    /// Baseline code in a semi-space region that relocates and evicts.
    Baseline,
    /// Optimized code; never moves but keeps growing.
    Optimized,
}

impl RegionKind {
    pub const ALL: [RegionKind; 3] = [Self::Boot, Self::Baseline, Self::Optimized];

    pub fn name(self) -> &'static str {
        match self {
            Self::Boot => "boot code cache",
            Self::Baseline => "baseline code cache",
            Self::Optimized => "optimized code cache",
        }
    }

    /// One-letter tag used in compilation designators.
    pub fn designator(self) -> char {
        match self {
            Self::Boot => 'B',
            Self::Baseline => 'T',
            Self::Optimized => 'O',
        }
    }

    pub fn is_managed(self) -> bool {
        matches!(self, Self::Baseline)
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The target-side descriptor of one code cache region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionStatus {
    pub range: MemoryRange,
    /// The region has real backing memory yet.
    pub allocated: bool,
    /// Completed evictions; only ever changes for managed regions.
    pub eviction_count: u64,
    pub eviction_in_progress: bool,
    /// Length of the region's compilation list.
    pub compilation_count: usize,
}

// ── Compilations ──────────────────────────────────────────────────────

/// Data arrays embedded in one compilation's code-cache allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataArrayKind {
    ScalarLiterals,
    ReferenceLiterals,
    Code,
}

impl DataArrayKind {
    pub const ALL: [DataArrayKind; 3] =
        [Self::ScalarLiterals, Self::ReferenceLiterals, Self::Code];

    pub fn name(self) -> &'static str {
        match self {
            Self::ScalarLiterals => "scalar literals",
            Self::ReferenceLiterals => "reference literals",
            Self::Code => "code",
        }
    }
}

/// Origins of a compilation's data arrays; zero when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataArrays {
    pub scalar_literals: Address,
    pub reference_literals: Address,
    pub code: Address,
}

impl DataArrays {
    pub fn origin(&self, kind: DataArrayKind) -> Address {
        match kind {
            DataArrayKind::ScalarLiterals => self.scalar_literals,
            DataArrayKind::ReferenceLiterals => self.reference_literals,
            DataArrayKind::Code => self.code,
        }
    }
}

/// A copy of the fields of a compilation-metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationRecord {
    pub method: MethodRef,
    /// Whole code-cache allocation; starts at zero until allocated.
    pub allocation: MemoryRange,
    pub code_start: Address,
    pub code_length: usize,
    pub arrays: DataArrays,
    /// Offset of the call entry point when calling-convention adapters
    /// are in use.
    pub adapter_offset: Option<usize>,
    pub baseline: bool,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SafepointFlags: u8 {
        const DIRECT_CALL = 1 << 0;
        const INDIRECT_CALL = 1 << 1;
        const NATIVE_CALL = 1 << 2;
    }
}

impl SafepointFlags {
    pub fn is_call(self) -> bool {
        self.intersects(Self::DIRECT_CALL | Self::INDIRECT_CALL | Self::NATIVE_CALL)
    }
}

/// One frame of debug info: a method and a bytecode index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub method: MethodRef,
    pub bci: i32,
}

/// Frames at one code position, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub frames: Vec<Frame>,
}

impl DebugInfo {
    pub fn single(method: MethodRef, bci: i32) -> Self {
        Self {
            frames: vec![Frame { method, bci }],
        }
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Safepoint {
    /// Byte offset from the start of the code.
    pub position: usize,
    pub flags: SafepointFlags,
    pub debug_info: Option<DebugInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineData {
    pub position: usize,
    pub length: usize,
    pub kind: InlineDataKind,
}

/// Per-compilation tables the target keeps beside the code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeDetails {
    pub safepoints: Vec<Safepoint>,
    /// Indexed by bytecode index, one entry past the last bytecode.
    pub bci_to_pos: Option<Vec<Option<usize>>>,
    pub inline_data: Vec<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub key: MethodKey,
    pub bytecodes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInfo {
    pub name: String,
    pub range: MemoryRange,
}

// ── The target ────────────────────────────────────────────────────────

/// The process-access layer, as seen from the code cache.
///
/// `try_lock` must be re-entrant for the thread that already holds the
/// lock and must never block.
pub trait TargetVm: Send + Sync {
    fn try_lock(&self) -> bool;
    fn unlock(&self);

    fn read_bytes(&self, address: Address, length: usize)
    -> Result<Vec<u8>, DataIoError>;

    /// Compiled code is entered through calling-convention adapters.
    fn needs_adapters(&self) -> bool;

    /// Value the target stores in an evicted compilation's code-array field.
    fn wiped_code_sentinel(&self) -> Address;

    fn region_status(&self, region: RegionKind) -> Result<RegionStatus, DataIoError>;

    /// Compilations listed for `region`, starting at list index `from`.
    fn compilation_refs(
        &self,
        region: RegionKind,
        from: usize,
    ) -> Result<Vec<CompilationRef>, DataIoError>;

    fn read_compilation(
        &self,
        compilation: CompilationRef,
    ) -> Result<CompilationRecord, DataIoError>;

    fn read_code_details(
        &self,
        compilation: CompilationRef,
    ) -> Result<CodeDetails, DataIoError>;

    fn method_info(&self, method: MethodRef) -> Result<MethodInfo, DataIoError>;

    /// `None` while the holder class is not loaded.
    fn find_method(&self, key: &MethodKey) -> Result<Option<MethodRef>, DataIoError>;

    /// Resolve the method-ref constant `cp_index` of `caller`'s pool.
    fn resolve_callee(
        &self,
        caller: MethodRef,
        cp_index: u16,
    ) -> Result<Option<MethodRef>, DataIoError>;

    /// Compilations of `method`, oldest first.
    fn compilations_of(
        &self,
        method: MethodRef,
    ) -> Result<Vec<CompilationRef>, DataIoError>;

    fn well_known_method(
        &self,
        access: &MethodAccess,
    ) -> Result<Option<MethodRef>, DataIoError>;

    fn native_libraries(&self) -> Result<Vec<LibraryInfo>, DataIoError>;

    /// Known memory that never holds code (heaps, stacks).
    fn data_regions(&self) -> Vec<(String, MemoryRange)>;
}

/// Holds the target lock until dropped.
pub struct TargetGuard<'a> {
    target: &'a dyn TargetVm,
}

impl<'a> TargetGuard<'a> {
    #[must_use]
    pub fn try_acquire(target: &'a dyn TargetVm) -> Option<Self> {
        target.try_lock().then_some(Self { target })
    }

    pub fn target(&self) -> &'a dyn TargetVm {
        self.target
    }
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        self.target.unlock();
    }
}
