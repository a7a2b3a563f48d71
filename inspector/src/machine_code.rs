//! Snapshots of a compilation's machine code and everything derived from
//! it, and the per-compilation cache that replaces them.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use disassembler::{Disassembler, InlineDataDecoder, Instruction, render_listing};
use parking_lot::RwLock;

use crate::address::{Address, MemoryRange};
use crate::bytecode::BytecodeScanner;
use crate::context::InspectorContext;
use crate::error::InspectorError;
use crate::target::{
    CodeDetails, DebugInfo, Frame, MethodRef, Safepoint, SafepointFlags, TargetVm,
};

/// What an instruction starts, in terms of the method's bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytecodeBoundary {
    /// First instruction of the code implementing the bytecode at `bci`.
    /// `opcode` is unknown when the bytecodes could not be read.
    Bytecode { bci: usize, opcode: Option<u8> },
    /// First instruction after the code for the last bytecode.
    MethodEnd,
}

/// Raw material for one snapshot, copied out of the target under lock.
#[derive(Debug, Clone, Default)]
pub struct CodeSource {
    pub method: Option<MethodRef>,
    pub bytecodes: Option<Vec<u8>>,
    pub code_start: Address,
    pub call_entry: Address,
    pub code: Vec<u8>,
    pub details: CodeDetails,
}

// ── Snapshot ──────────────────────────────────────────────────────────

/// Machine code of one compilation as of one instant.
///
/// Never mutated once built; every per-index table has one entry per
/// instruction and was derived from the same byte copy.
#[derive(Debug)]
pub struct MachineCodeInfo {
    version: u64,
    code_start: Address,
    call_entry: Address,
    code: Vec<u8>,
    instructions: Vec<Instruction>,
    safepoints: Vec<Option<SafepointFlags>>,
    debug_infos: Vec<Option<DebugInfo>>,
    boundaries: Vec<Option<BytecodeBoundary>>,
    callees: Vec<Option<MethodRef>>,
    labels: Vec<usize>,
    bci_to_pos: Option<Vec<Option<usize>>>,
}

/// Walks a bci→position map in step with instructions in position order.
struct BoundaryCursor<'a> {
    map: &'a [Option<usize>],
    bci: usize,
}

impl<'a> BoundaryCursor<'a> {
    fn new(map: &'a [Option<usize>]) -> Self {
        let bci = map.iter().position(Option::is_some).unwrap_or(map.len());
        Self { map, bci }
    }

    /// Bytecode index of the method end entry.
    fn end(&self) -> usize {
        self.map.len().saturating_sub(1)
    }

    fn at(&self, pos: usize) -> bool {
        self.bci < self.map.len() && self.map[self.bci] == Some(pos)
    }

    /// Step past `bci` and every following entry that has no code of its
    /// own or shares the code at `pos`.
    fn advance(&mut self, pos: usize) {
        loop {
            self.bci += 1;
            if self.bci >= self.map.len() {
                break;
            }
            match self.map[self.bci] {
                None => continue,
                Some(p) if p == pos => continue,
                Some(_) => break,
            }
        }
    }
}

impl MachineCodeInfo {
    /// A snapshot with no code: version 0 is "not loaded yet".
    pub fn empty(version: u64) -> Self {
        Self {
            version,
            code_start: Address::ZERO,
            call_entry: Address::ZERO,
            code: Vec::new(),
            instructions: Vec::new(),
            safepoints: Vec::new(),
            debug_infos: Vec::new(),
            boundaries: Vec::new(),
            callees: Vec::new(),
            labels: Vec::new(),
            bci_to_pos: None,
        }
    }

    pub(crate) fn build(
        version: u64,
        source: &CodeSource,
        disassembler: &Disassembler,
        target: &dyn TargetVm,
    ) -> Self {
        let code_length = source.code.len();
        if code_length == 0 {
            return Self::empty(version);
        }

        let inline_data = (!source.details.inline_data.is_empty()).then(|| {
            let mut decoder = InlineDataDecoder::new();
            for data in &source.details.inline_data {
                decoder.add(data.position, data.length, data.kind);
            }
            decoder
        });
        let instructions = disassembler.decode(
            source.code_start.raw(),
            &source.code,
            inline_data.as_ref(),
        );
        let count = instructions.len();

        let mut pos_to_safepoint: Vec<Option<&Safepoint>> = vec![None; code_length];
        let mut pos_to_debug: Vec<Option<DebugInfo>> = vec![None; code_length];
        for safepoint in &source.details.safepoints {
            let Some(slot) = pos_to_safepoint.get_mut(safepoint.position) else {
                log::warn!(
                    "safepoint at position {} lies outside {code_length} bytes of code at {:?}",
                    safepoint.position,
                    source.code_start
                );
                continue;
            };
            *slot = Some(safepoint);
            pos_to_debug[safepoint.position] = safepoint.debug_info.clone();
        }

        let bci_to_pos = source.details.bci_to_pos.clone();
        if let (Some(map), Some(method)) = (bci_to_pos.as_deref(), source.method) {
            let mut cursor = BoundaryCursor::new(map);
            for insn in &instructions {
                let pos = insn.position;
                if pos < code_length && cursor.at(pos) {
                    if cursor.bci < cursor.end() && pos_to_debug[pos].is_none() {
                        pos_to_debug[pos] = Some(DebugInfo::single(method, cursor.bci as i32));
                    }
                    cursor.advance(pos);
                }
            }
        }

        let scanner = source.bytecodes.as_deref().map(BytecodeScanner::new);
        let mut safepoints = vec![None; count];
        let mut debug_infos = vec![None; count];
        let mut boundaries = vec![None; count];
        let mut callees = vec![None; count];
        let mut labels = Vec::new();
        let mut cursor = bci_to_pos.as_deref().map(BoundaryCursor::new);

        for (index, insn) in instructions.iter().enumerate() {
            if insn.label.is_some() {
                labels.push(index);
            }
            let pos = insn.position;
            if pos >= code_length {
                log::warn!(
                    "skipping instruction {index} at wild position {pos} in code at {:?}",
                    source.code_start
                );
                continue;
            }
            debug_infos[index] = pos_to_debug[pos].clone();

            if let Some(safepoint) = pos_to_safepoint[pos] {
                safepoints[index] = Some(safepoint.flags);
                // The safepoint follows the call it belongs to.
                if index > 0 {
                    let frame = debug_infos[index].as_ref().and_then(DebugInfo::top);
                    if let Some(frame) = frame.filter(|frame| frame.bci >= 0) {
                        callees[index - 1] = resolve_callee(target, source, frame);
                    }
                }
            }

            if let Some(cursor) = cursor.as_mut().filter(|cursor| cursor.at(pos)) {
                if cursor.bci == cursor.end() {
                    boundaries[index] = Some(BytecodeBoundary::MethodEnd);
                } else {
                    let opcode = scanner.as_ref().and_then(|s| s.opcode_at(cursor.bci));
                    boundaries[index] = Some(BytecodeBoundary::Bytecode {
                        bci: cursor.bci,
                        opcode,
                    });
                    cursor.advance(pos);
                }
            }
        }

        Self {
            version,
            code_start: source.code_start,
            call_entry: source.call_entry,
            code: source.code.clone(),
            instructions,
            safepoints,
            debug_infos,
            boundaries,
            callees,
            labels,
            bci_to_pos,
        }
    }

    #[inline]
    fn check(&self, index: usize) -> Result<(), InspectorError> {
        if index >= self.instructions.len() {
            return Err(InspectorError::IndexOutOfRange {
                index,
                count: self.instructions.len(),
            });
        }
        Ok(())
    }

    /// Rebuild count; 0 before the first load.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_loaded(&self) -> bool {
        !self.code.is_empty()
    }

    pub fn code_start(&self) -> Address {
        self.code_start
    }

    pub fn call_entry_point(&self) -> Address {
        self.call_entry
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_range(&self) -> MemoryRange {
        MemoryRange::new(self.code_start, self.code.len())
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn instruction(&self, index: usize) -> Result<&Instruction, InspectorError> {
        self.check(index)?;
        Ok(&self.instructions[index])
    }

    /// Index of the instruction containing `address`, or the closest one
    /// before it. `None` before the first instruction or past the end of
    /// the last.
    pub fn find_instruction_index(&self, address: Address) -> Option<usize> {
        let after = self
            .instructions
            .partition_point(|insn| insn.address <= address.raw());
        let index = after.checked_sub(1)?;
        if index + 1 == self.instructions.len()
            && address.raw() >= self.instructions[index].end_address()
        {
            return None;
        }
        Some(index)
    }

    pub fn is_safepoint(&self, index: usize) -> Result<bool, InspectorError> {
        self.check(index)?;
        Ok(self.safepoints[index].is_some())
    }

    pub fn safepoint_flags(
        &self,
        index: usize,
    ) -> Result<Option<SafepointFlags>, InspectorError> {
        self.check(index)?;
        Ok(self.safepoints[index])
    }

    /// Flags of the safepoint recorded just after instruction `index`.
    fn following_safepoint(&self, index: usize) -> Option<SafepointFlags> {
        self.safepoints.get(index + 1).copied().flatten()
    }

    pub fn is_call(&self, index: usize) -> Result<bool, InspectorError> {
        self.check(index)?;
        Ok(self.following_safepoint(index).is_some_and(SafepointFlags::is_call))
    }

    pub fn is_native_call(&self, index: usize) -> Result<bool, InspectorError> {
        self.check(index)?;
        Ok(self
            .following_safepoint(index)
            .is_some_and(|flags| flags.contains(SafepointFlags::NATIVE_CALL)))
    }

    pub fn is_bytecode_boundary(&self, index: usize) -> Result<bool, InspectorError> {
        self.check(index)?;
        Ok(self.boundaries[index].is_some())
    }

    pub fn bytecode_boundary(
        &self,
        index: usize,
    ) -> Result<Option<BytecodeBoundary>, InspectorError> {
        self.check(index)?;
        Ok(self.boundaries[index])
    }

    pub fn debug_info(&self, index: usize) -> Result<Option<&DebugInfo>, InspectorError> {
        self.check(index)?;
        Ok(self.debug_infos[index].as_ref())
    }

    pub fn callee(&self, index: usize) -> Result<Option<MethodRef>, InspectorError> {
        self.check(index)?;
        Ok(self.callees[index])
    }

    pub fn label_indexes(&self) -> &[usize] {
        &self.labels
    }

    pub fn bci_to_pos_map(&self) -> Option<&[Option<usize>]> {
        self.bci_to_pos.as_deref()
    }

    pub fn listing(&self) -> String {
        render_listing(&self.instructions)
    }
}

fn resolve_callee(
    target: &dyn TargetVm,
    source: &CodeSource,
    frame: &Frame,
) -> Option<MethodRef> {
    let bci = usize::try_from(frame.bci).ok()?;
    let cp_index = if Some(frame.method) == source.method {
        let bytecodes = source.bytecodes.as_deref()?;
        BytecodeScanner::new(bytecodes).method_ref_index(bci)?
    } else {
        // Inlined frame: the call site lives in another method's bytecode.
        let info = match target.method_info(frame.method) {
            Ok(info) => info,
            Err(err) => {
                log::warn!("no bytecodes for inlined {:?}: {err}", frame.method);
                return None;
            }
        };
        BytecodeScanner::new(info.bytecodes.as_deref()?).method_ref_index(bci)?
    };
    match target.resolve_callee(frame.method, cp_index) {
        Ok(callee) => callee,
        Err(err) => {
            log::warn!("failed to resolve callee #{cp_index} of {:?}: {err}", frame.method);
            None
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────────────

struct CacheState {
    current: Arc<MachineCodeInfo>,
    last_loaded: Option<Arc<MachineCodeInfo>>,
    evicted: bool,
}

/// Holds the current snapshot of one compilation.
///
/// Reading while clean never touches the target. Reading while dirty tries
/// the target lock and rebuilds; a busy target or failed read keeps the
/// stale snapshot and leaves the cache dirty.
pub struct MachineCodeInfoCache {
    state: RwLock<CacheState>,
    dirty: AtomicBool,
}

impl Default for MachineCodeInfoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineCodeInfoCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState {
                current: Arc::new(MachineCodeInfo::empty(0)),
                last_loaded: None,
                evicted: false,
            }),
            dirty: AtomicBool::new(true),
        }
    }

    pub fn current(&self) -> Arc<MachineCodeInfo> {
        self.state.read().current.clone()
    }

    /// Most recent snapshot that actually held code.
    pub fn last_loaded(&self) -> Option<Arc<MachineCodeInfo>> {
        self.state.read().last_loaded.clone()
    }

    pub fn version(&self) -> u64 {
        self.state.read().current.version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().current.is_loaded()
    }

    pub fn is_evicted(&self) -> bool {
        self.state.read().evicted
    }

    pub fn mark_dirty(&self) {
        if !self.is_evicted() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Current snapshot, rebuilt through `load` first if dirty and the
    /// target can be locked.
    pub fn get(
        &self,
        ctx: &InspectorContext,
        load: impl FnOnce(&dyn TargetVm) -> Result<CodeSource, InspectorError>,
    ) -> Arc<MachineCodeInfo> {
        if !self.is_dirty() {
            return self.current();
        }
        let Some(guard) = ctx.try_lock() else {
            log::trace!("target busy, serving machine code version {}", self.version());
            return self.current();
        };
        let mut state = self.state.write();
        if state.evicted || !self.is_dirty() {
            return state.current.clone();
        }
        match load(guard.target()) {
            Ok(source) => {
                let version = state.current.version + 1;
                let info = Arc::new(MachineCodeInfo::build(
                    version,
                    &source,
                    ctx.disassembler(),
                    guard.target(),
                ));
                // No code start yet means the compilation is mid-flight.
                if !info.code_start.is_zero() {
                    self.dirty.store(false, Ordering::Release);
                }
                if info.is_loaded() {
                    state.last_loaded = Some(info.clone());
                }
                log::trace!(
                    "machine code at {:?} now version {version} ({} instructions)",
                    info.code_start,
                    info.instruction_count()
                );
                state.current = info;
            }
            Err(err) if err.is_fatal() => {
                log::error!("rebuilding machine code failed: {err}");
            }
            Err(err) => {
                log::warn!(
                    "keeping stale machine code version {}: {err}",
                    state.current.version
                );
            }
        }
        state.current.clone()
    }

    /// Install the final, empty snapshot of an evicted compilation. The
    /// last loaded one stays available through
    /// [`MachineCodeInfoCache::last_loaded`].
    pub fn mark_evicted(&self) {
        let mut state = self.state.write();
        if state.evicted {
            return;
        }
        state.evicted = true;
        let version = state.current.version + 1;
        state.current = Arc::new(MachineCodeInfo::empty(version));
        self.dirty.store(false, Ordering::Release);
    }
}
