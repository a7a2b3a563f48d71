//! In-memory target used by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use disassembler::Isa;
use parking_lot::Mutex;

use crate::address::{Address, MemoryRange};
use crate::context::InspectorContext;
use crate::error::DataIoError;
use crate::settings::{InspectorCreateInfo, InspectorSettings};
use crate::target::{
    CodeDetails, CompilationRecord, CompilationRef, DataArrays, LibraryInfo, MethodAccess,
    MethodInfo, MethodKey, MethodRef, RegionKind, RegionStatus, TargetVm,
};

pub const WIPED: Address = Address::new(0xDEAD_0000);

/// Header bytes in front of the code inside one allocation: scalar
/// literals at +0, reference literals at +0x10, code array at +0x18.
pub const CODE_OFFSET: usize = 0x20;

#[derive(Default)]
struct FakeState {
    memory: BTreeMap<u64, u8>,
    failing: Vec<MemoryRange>,
    regions: HashMap<RegionKind, RegionStatus>,
    lists: HashMap<RegionKind, Vec<CompilationRef>>,
    records: HashMap<CompilationRef, CompilationRecord>,
    details: HashMap<CompilationRef, CodeDetails>,
    methods: HashMap<MethodRef, MethodInfo>,
    callees: HashMap<(MethodRef, u16), MethodRef>,
    well_known: HashMap<MethodAccess, MethodRef>,
    libraries: Vec<LibraryInfo>,
    data_regions: Vec<(String, MemoryRange)>,
    needs_adapters: bool,
    next_method: u64,
    next_compilation: u64,
}

pub struct FakeVm {
    state: Mutex<FakeState>,
    owner: Mutex<(Option<ThreadId>, usize)>,
    busy: AtomicBool,
}

impl Default for FakeVm {
    fn default() -> Self {
        Self::new()
    }
}

fn laid_out(
    allocation_start: u64,
    code_length: usize,
    method: MethodRef,
    baseline: bool,
) -> CompilationRecord {
    let start = Address::new(allocation_start);
    CompilationRecord {
        method,
        allocation: MemoryRange::new(start, CODE_OFFSET + code_length),
        code_start: start.plus(CODE_OFFSET),
        code_length,
        arrays: DataArrays {
            scalar_literals: start,
            reference_literals: start.plus(0x10),
            code: start.plus(0x18),
        },
        adapter_offset: None,
        baseline,
    }
}

impl FakeVm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            owner: Mutex::new((None, 0)),
            busy: AtomicBool::new(false),
        }
    }

    pub fn lock_depth(&self) -> usize {
        self.owner.lock().1
    }

    /// Simulate another thread (the process controller) holding the lock.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn write_bytes(&self, address: Address, bytes: &[u8]) {
        let mut state = self.state.lock();
        for (i, byte) in bytes.iter().enumerate() {
            state.memory.insert(address.raw() + i as u64, *byte);
        }
    }

    pub fn fail_reads(&self, range: MemoryRange) {
        self.state.lock().failing.push(range);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    // ── Methods ──

    pub fn add_method(&self, key: MethodKey, bytecodes: Vec<u8>) -> MethodRef {
        let mut state = self.state.lock();
        state.next_method += 1;
        let method = MethodRef(Address::new(0x6000_0000 + state.next_method * 0x40));
        state.methods.insert(
            method,
            MethodInfo {
                key,
                bytecodes: Some(bytecodes),
            },
        );
        method
    }

    pub fn set_callee(&self, caller: MethodRef, cp_index: u16, callee: MethodRef) {
        self.state.lock().callees.insert((caller, cp_index), callee);
    }

    pub fn set_well_known(&self, access: MethodAccess, method: MethodRef) {
        self.state.lock().well_known.insert(access, method);
    }

    // ── Regions ──

    pub fn add_region(&self, kind: RegionKind, start: u64, length: usize) {
        self.state.lock().regions.insert(
            kind,
            RegionStatus {
                range: MemoryRange::new(Address::new(start), length),
                allocated: true,
                ..Default::default()
            },
        );
    }

    pub fn set_allocated(&self, kind: RegionKind, allocated: bool) {
        if let Some(status) = self.state.lock().regions.get_mut(&kind) {
            status.allocated = allocated;
        }
    }

    pub fn set_eviction_in_progress(&self, kind: RegionKind, in_progress: bool) {
        if let Some(status) = self.state.lock().regions.get_mut(&kind) {
            status.eviction_in_progress = in_progress;
        }
    }

    pub fn set_eviction_count(&self, kind: RegionKind, count: u64) {
        if let Some(status) = self.state.lock().regions.get_mut(&kind) {
            status.eviction_count = count;
        }
    }

    pub fn region(&self, kind: RegionKind) -> RegionStatus {
        self.state.lock().regions.get(&kind).copied().unwrap_or_default()
    }

    pub fn add_native_library(&self, name: &str, start: u64, length: usize) {
        self.state.lock().libraries.push(LibraryInfo {
            name: name.to_string(),
            range: MemoryRange::new(Address::new(start), length),
        });
    }

    pub fn add_data_region(&self, name: &str, start: u64, length: usize) {
        self.state
            .lock()
            .data_regions
            .push((name.to_string(), MemoryRange::new(Address::new(start), length)));
    }

    pub fn set_needs_adapters(&self, needs: bool) {
        self.state.lock().needs_adapters = needs;
    }

    // ── Compilations ──

    fn list(state: &mut FakeState, kind: RegionKind, reference: CompilationRef) {
        state.lists.entry(kind).or_default().push(reference);
        let count = state.lists[&kind].len();
        if let Some(status) = state.regions.get_mut(&kind) {
            status.compilation_count = count;
        }
    }

    fn next_reference(state: &mut FakeState) -> CompilationRef {
        state.next_compilation += 1;
        CompilationRef(Address::new(0x7000_0000 + state.next_compilation * 0x100))
    }

    /// Append a compilation whose allocation starts at `start` and whose
    /// code follows the data arrays.
    pub fn add_compilation(
        &self,
        kind: RegionKind,
        method: MethodRef,
        start: u64,
        code: &[u8],
    ) -> CompilationRef {
        let record = laid_out(start, code.len(), method, kind == RegionKind::Baseline);
        self.write_bytes(record.code_start, code);
        let mut state = self.state.lock();
        let reference = Self::next_reference(&mut state);
        state.records.insert(reference, record);
        Self::list(&mut state, kind, reference);
        reference
    }

    /// Append a compilation that has no code-cache allocation yet.
    pub fn add_unallocated(&self, kind: RegionKind, method: MethodRef) -> CompilationRef {
        let mut state = self.state.lock();
        let reference = Self::next_reference(&mut state);
        state.records.insert(
            reference,
            CompilationRecord {
                method,
                allocation: MemoryRange::EMPTY,
                code_start: Address::ZERO,
                code_length: 0,
                arrays: DataArrays::default(),
                adapter_offset: None,
                baseline: kind == RegionKind::Baseline,
            },
        );
        Self::list(&mut state, kind, reference);
        reference
    }

    pub fn allocate(&self, reference: CompilationRef, start: u64, code: &[u8]) {
        let mut record = self.record(reference);
        let fresh = laid_out(start, code.len(), record.method, record.baseline);
        self.write_bytes(fresh.code_start, code);
        record.allocation = fresh.allocation;
        record.code_start = fresh.code_start;
        record.code_length = fresh.code_length;
        record.arrays = fresh.arrays;
        self.state.lock().records.insert(reference, record);
    }

    /// Move a compilation, code bytes included, to a new allocation start.
    pub fn relocate(&self, reference: CompilationRef, new_start: u64) {
        let record = self.record(reference);
        let code = self
            .read_bytes(record.code_start, record.code_length)
            .expect("readable code");
        self.allocate(reference, new_start, &code);
    }

    pub fn wipe(&self, reference: CompilationRef) {
        if let Some(record) = self.state.lock().records.get_mut(&reference) {
            record.arrays.code = WIPED;
        }
    }

    /// Complete one eviction cycle: everything not in `survivors` is wiped
    /// and the list is replaced by `survivors`.
    pub fn evict(&self, kind: RegionKind, survivors: &[CompilationRef]) {
        let victims: Vec<CompilationRef> = {
            let state = self.state.lock();
            state.lists.get(&kind).cloned().unwrap_or_default()
        }
        .into_iter()
        .filter(|reference| !survivors.contains(reference))
        .collect();
        for victim in victims {
            self.wipe(victim);
        }
        let mut state = self.state.lock();
        state.lists.insert(kind, survivors.to_vec());
        if let Some(status) = state.regions.get_mut(&kind) {
            status.eviction_count += 1;
            status.compilation_count = survivors.len();
        }
    }

    pub fn record(&self, reference: CompilationRef) -> CompilationRecord {
        self.state.lock().records[&reference].clone()
    }

    pub fn set_details(&self, reference: CompilationRef, details: CodeDetails) {
        self.state.lock().details.insert(reference, details);
    }

    pub fn set_adapter_offset(&self, reference: CompilationRef, offset: usize) {
        if let Some(record) = self.state.lock().records.get_mut(&reference) {
            record.adapter_offset = Some(offset);
        }
    }
}

impl TargetVm for FakeVm {
    fn try_lock(&self) -> bool {
        if self.busy.load(Ordering::SeqCst) {
            return false;
        }
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        match owner.0 {
            Some(id) if id != me => false,
            _ => {
                owner.0 = Some(me);
                owner.1 += 1;
                true
            }
        }
    }

    fn unlock(&self) {
        let mut owner = self.owner.lock();
        owner.1 = owner.1.saturating_sub(1);
        if owner.1 == 0 {
            owner.0 = None;
        }
    }

    fn read_bytes(&self, address: Address, length: usize) -> Result<Vec<u8>, DataIoError> {
        let state = self.state.lock();
        let range = MemoryRange::new(address, length);
        let err = DataIoError { address, length };
        if state.failing.iter().any(|bad| bad.overlaps(&range)) {
            return Err(err);
        }
        (0..length as u64)
            .map(|i| state.memory.get(&(address.raw() + i)).copied().ok_or(err))
            .collect()
    }

    fn needs_adapters(&self) -> bool {
        self.state.lock().needs_adapters
    }

    fn wiped_code_sentinel(&self) -> Address {
        WIPED
    }

    fn region_status(&self, region: RegionKind) -> Result<RegionStatus, DataIoError> {
        Ok(self.region(region))
    }

    fn compilation_refs(
        &self,
        region: RegionKind,
        from: usize,
    ) -> Result<Vec<CompilationRef>, DataIoError> {
        let state = self.state.lock();
        let list = state.lists.get(&region).map(Vec::as_slice).unwrap_or(&[]);
        Ok(list.get(from..).unwrap_or(&[]).to_vec())
    }

    fn read_compilation(
        &self,
        compilation: CompilationRef,
    ) -> Result<CompilationRecord, DataIoError> {
        let state = self.state.lock();
        if state.failing.iter().any(|bad| bad.contains(compilation.0)) {
            return Err(DataIoError { address: compilation.0, length: 0 });
        }
        state.records.get(&compilation).cloned().ok_or(DataIoError {
            address: compilation.0,
            length: 0,
        })
    }

    fn read_code_details(
        &self,
        compilation: CompilationRef,
    ) -> Result<CodeDetails, DataIoError> {
        Ok(self
            .state
            .lock()
            .details
            .get(&compilation)
            .cloned()
            .unwrap_or_default())
    }

    fn method_info(&self, method: MethodRef) -> Result<MethodInfo, DataIoError> {
        self.state.lock().methods.get(&method).cloned().ok_or(DataIoError {
            address: method.0,
            length: 0,
        })
    }

    fn find_method(&self, key: &MethodKey) -> Result<Option<MethodRef>, DataIoError> {
        Ok(self
            .state
            .lock()
            .methods
            .iter()
            .find(|(_, info)| &info.key == key)
            .map(|(method, _)| *method))
    }

    fn resolve_callee(
        &self,
        caller: MethodRef,
        cp_index: u16,
    ) -> Result<Option<MethodRef>, DataIoError> {
        Ok(self.state.lock().callees.get(&(caller, cp_index)).copied())
    }

    fn compilations_of(&self, method: MethodRef) -> Result<Vec<CompilationRef>, DataIoError> {
        let state = self.state.lock();
        let mut found: Vec<CompilationRef> = state
            .records
            .iter()
            .filter(|(_, record)| record.method == method)
            .map(|(reference, _)| *reference)
            .collect();
        found.sort();
        Ok(found)
    }

    fn well_known_method(
        &self,
        access: &MethodAccess,
    ) -> Result<Option<MethodRef>, DataIoError> {
        Ok(self.state.lock().well_known.get(access).copied())
    }

    fn native_libraries(&self) -> Result<Vec<LibraryInfo>, DataIoError> {
        Ok(self.state.lock().libraries.clone())
    }

    fn data_regions(&self) -> Vec<(String, MemoryRange)> {
        self.state.lock().data_regions.clone()
    }
}

pub fn context_with(vm: &Arc<FakeVm>, info: InspectorCreateInfo) -> Arc<InspectorContext> {
    let settings = InspectorSettings::from_info(&info).expect("settings");
    let target: Arc<dyn TargetVm> = vm.clone();
    InspectorContext::new(target, settings).expect("context")
}

pub fn x64_context(vm: &Arc<FakeVm>) -> Arc<InspectorContext> {
    context_with(
        vm,
        InspectorCreateInfo {
            isa: Some(Isa::X64),
            ..Default::default()
        },
    )
}
