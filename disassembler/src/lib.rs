//! Structured disassembly of machine code copied out of another process.
//!
//! A [`Disassembler`] is built once per instruction-set family and turns a
//! byte buffer plus the address it was loaded from into a list of
//! [`Instruction`]s carrying absolute branch targets and literal-load
//! sources. Families other than x64 and aarch64 are rejected when the
//! disassembler is created.

mod aarch64;
mod x64;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub use aarch64::AArch64;
pub use x64::X64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    X64,
    AArch64,
    Arm32,
    Riscv64,
}

impl Isa {
    /// The family of the machine running the inspector.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::AArch64
        } else if cfg!(target_arch = "arm") {
            Self::Arm32
        } else if cfg!(target_arch = "riscv64") {
            Self::Riscv64
        } else {
            Self::X64
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::AArch64 => "aarch64",
            Self::Arm32 => "arm32",
            Self::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Isa {
    type Err = DisasmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x64" | "amd64" | "x86_64" => Ok(Self::X64),
            "aarch64" | "arm64" => Ok(Self::AArch64),
            "arm32" | "arm" => Ok(Self::Arm32),
            "riscv64" => Ok(Self::Riscv64),
            _ => Err(DisasmError::UnknownIsa),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasmError {
    UnexpectedEof { offset: usize },
    UnsupportedOpcode { offset: usize, opcode: u8 },
    UnsupportedInstruction { offset: usize, insn: u32 },
    UnsupportedAddressing { offset: usize },
    InvalidRelativeTarget { offset: usize, target: i128 },
    UnsupportedIsa { isa: Isa },
    UnknownIsa,
}

impl fmt::Display for DisasmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { offset } => {
                write!(f, "unexpected EOF at byte offset {offset}")
            }
            Self::UnsupportedOpcode { offset, opcode } => {
                write!(
                    f,
                    "unsupported opcode 0x{opcode:02x} at byte offset {offset}"
                )
            }
            Self::UnsupportedInstruction { offset, insn } => {
                write!(
                    f,
                    "unsupported instruction 0x{insn:08x} at byte offset {offset}"
                )
            }
            Self::UnsupportedAddressing { offset } => {
                write!(f, "unsupported addressing mode at byte offset {offset}")
            }
            Self::InvalidRelativeTarget { offset, target } => {
                write!(
                    f,
                    "invalid relative target {target} at byte offset {offset}"
                )
            }
            Self::UnsupportedIsa { isa } => {
                write!(f, "disassembly for {isa} is not implemented")
            }
            Self::UnknownIsa => write!(f, "unknown instruction set"),
        }
    }
}

impl std::error::Error for DisasmError {}

// ── Decoded form ──────────────────────────────────────────────────────

/// A register-relative or pc-relative memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Option<&'static str>,
    pub index: Option<(&'static str, u8)>,
    pub displacement: i64,
    /// Displacement is measured from the program counter. x64 leaves `base`
    /// empty and renders `rip`.
    pub pc_relative: bool,
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.pc_relative && self.base.is_none() {
            parts.push("rip".to_string());
        }
        if let Some(base) = self.base {
            parts.push(base.to_string());
        }
        if let Some((index, scale)) = self.index {
            parts.push(format!("{index}*{scale}"));
        }
        let mut out = format!("[{}", parts.join("+"));
        if self.displacement < 0 {
            out.push_str(&format!("-0x{:x}", self.displacement.unsigned_abs()));
        } else if self.displacement > 0 || parts.is_empty() {
            if !parts.is_empty() {
                out.push('+');
            }
            out.push_str(&format!("0x{:x}", self.displacement));
        }
        out.push(']');
        f.write_str(&out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(&'static str),
    Imm(i64),
    Shifted { imm: u32, shift: u32 },
    /// Absolute address of a branch or call destination.
    Target(u64),
    Mem(MemoryOperand),
    /// Absolute address produced by an address computation (adr, lea).
    Address(u64),
}

/// One instruction as produced by a family decoder, before labels are
/// assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub length: usize,
    pub mnemonic: &'static str,
    pub operands: Vec<Operand>,
    /// Direct branch or call destination.
    pub target: Option<u64>,
    /// Memory operand of the instruction if it has one.
    pub memory: Option<MemoryOperand>,
}

impl DecodedInstruction {
    pub(crate) fn new(
        length: usize,
        mnemonic: &'static str,
        operands: Vec<Operand>,
    ) -> Self {
        let target = operands.iter().find_map(|op| match op {
            Operand::Target(t) => Some(*t),
            _ => None,
        });
        let memory = operands.iter().find_map(|op| match op {
            Operand::Mem(m) => Some(*m),
            _ => None,
        });
        Self {
            length,
            mnemonic,
            operands,
            target,
            memory,
        }
    }
}

/// Decodes single instructions of one instruction-set family.
pub trait InstructionDecoder: Send + Sync {
    /// Decode the instruction starting at `offset` of `bytes`, where
    /// `bytes[0]` was loaded at `load_address`.
    fn decode_at(
        &self,
        bytes: &[u8],
        offset: usize,
        load_address: u64,
    ) -> Result<DecodedInstruction, DisasmError>;
}

/// Recognizes instructions that load a value from a pc-relative literal.
pub trait LiteralLoadRecognizer: Send + Sync {
    /// Absolute address of the literal read by `insn`, which starts at
    /// `address`, or `None` if `insn` is not a literal load.
    fn literal_source(
        &self,
        insn: &DecodedInstruction,
        address: u64,
    ) -> Option<u64>;
}

// ── Inline data ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineDataKind {
    JumpTable,
    LiteralPool,
    Padding,
}

impl InlineDataKind {
    fn mnemonic(self) -> &'static str {
        match self {
            Self::JumpTable => ".jumptable",
            Self::LiteralPool => ".literals",
            Self::Padding => ".align",
        }
    }
}

/// Byte ranges of a code buffer that hold data rather than instructions.
#[derive(Debug, Clone, Default)]
pub struct InlineDataDecoder {
    ranges: BTreeMap<usize, (usize, InlineDataKind)>,
}

impl InlineDataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, position: usize, length: usize, kind: InlineDataKind) {
        if length > 0 {
            self.ranges.insert(position, (length, kind));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn at(&self, position: usize) -> Option<(usize, InlineDataKind)> {
        self.ranges.get(&position).copied()
    }
}

// ── Instructions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: String,
    /// Byte offset from the start of the decoded buffer.
    pub position: usize,
    pub address: u64,
    pub label: Option<String>,
    pub bytes: Vec<u8>,
    pub operands: String,
    pub target_address: Option<u64>,
    pub literal_source_address: Option<u64>,
}

impl Instruction {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// First address past this instruction.
    pub fn end_address(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}: {}", self.address, self.mnemonic)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands)?;
        }
        Ok(())
    }
}

/// Render a listing in the style `L0:` / `0004: op operands`.
pub fn render_listing(instructions: &[Instruction]) -> String {
    let mut out = Vec::new();
    for insn in instructions {
        if let Some(label) = &insn.label {
            out.push(format!("{label}:"));
        }
        let bytes: Vec<String> =
            insn.bytes.iter().map(|b| format!("{b:02x}")).collect();
        let mut line =
            format!("{:04x}: {:<24} {}", insn.position, bytes.join(" "), insn.mnemonic);
        if !insn.operands.is_empty() {
            line.push(' ');
            line.push_str(&insn.operands);
        }
        if let Some(literal) = insn.literal_source_address {
            line.push_str(&format!("    ; literal @ 0x{literal:x}"));
        }
        out.push(line);
    }
    out.join("\n")
}

// ── Disassembler ──────────────────────────────────────────────────────

pub struct Disassembler {
    isa: Isa,
    decoder: Box<dyn InstructionDecoder>,
    literals: Box<dyn LiteralLoadRecognizer>,
}

impl fmt::Debug for Disassembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disassembler").field("isa", &self.isa).finish()
    }
}

struct Scanned {
    position: usize,
    length: usize,
    mnemonic: &'static str,
    operands: Vec<Operand>,
    target: Option<u64>,
    literal: Option<u64>,
}

impl Disassembler {
    pub fn new(isa: Isa) -> Result<Self, DisasmError> {
        match isa {
            Isa::X64 => Ok(Self::with_family(isa, X64, X64)),
            Isa::AArch64 => Ok(Self::with_family(isa, AArch64, AArch64)),
            Isa::Arm32 | Isa::Riscv64 => {
                Err(DisasmError::UnsupportedIsa { isa })
            }
        }
    }

    pub fn with_family(
        isa: Isa,
        decoder: impl InstructionDecoder + 'static,
        literals: impl LiteralLoadRecognizer + 'static,
    ) -> Self {
        Self {
            isa,
            decoder: Box::new(decoder),
            literals: Box::new(literals),
        }
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    /// Decode the whole buffer, failing on the first undecodable
    /// instruction.
    pub fn try_decode(
        &self,
        load_address: u64,
        bytes: &[u8],
        inline_data: Option<&InlineDataDecoder>,
    ) -> Result<Vec<Instruction>, DisasmError> {
        let (scanned, error) = self.scan(load_address, bytes, inline_data);
        match error {
            Some(err) => Err(err),
            None => Ok(finish(load_address, bytes, scanned)),
        }
    }

    /// Decode as much of the buffer as possible.
    ///
    /// If full decoding fails, the instructions scanned before the failure
    /// are returned.
    pub fn decode(
        &self,
        load_address: u64,
        bytes: &[u8],
        inline_data: Option<&InlineDataDecoder>,
    ) -> Vec<Instruction> {
        let (scanned, error) = self.scan(load_address, bytes, inline_data);
        if let Some(err) = error {
            let stopped = scanned.last().map_or(0, |insn| insn.position + insn.length);
            log::warn!(
                "{} disassembly of {} bytes at 0x{load_address:x} failed: {err}; \
                 keeping {} instructions scanned before 0x{:x}",
                self.isa,
                bytes.len(),
                scanned.len(),
                load_address + stopped as u64,
            );
        }
        finish(load_address, bytes, scanned)
    }

    fn scan(
        &self,
        load_address: u64,
        bytes: &[u8],
        inline_data: Option<&InlineDataDecoder>,
    ) -> (Vec<Scanned>, Option<DisasmError>) {
        let mut scanned = Vec::new();
        let mut pc = 0usize;
        while pc < bytes.len() {
            match self.scan_at(load_address, bytes, pc, inline_data) {
                Ok(insn) => {
                    pc += insn.length;
                    scanned.push(insn);
                }
                Err(err) => return (scanned, Some(err)),
            }
        }
        (scanned, None)
    }

    fn scan_at(
        &self,
        load_address: u64,
        bytes: &[u8],
        pc: usize,
        inline_data: Option<&InlineDataDecoder>,
    ) -> Result<Scanned, DisasmError> {
        if let Some((length, kind)) = inline_data.and_then(|d| d.at(pc)) {
            let length = length.min(bytes.len() - pc);
            return Ok(Scanned {
                position: pc,
                length,
                mnemonic: kind.mnemonic(),
                operands: vec![Operand::Imm(length as i64)],
                target: None,
                literal: None,
            });
        }
        let decoded = self.decoder.decode_at(bytes, pc, load_address)?;
        if decoded.length == 0 || pc + decoded.length > bytes.len() {
            return Err(DisasmError::UnexpectedEof { offset: pc });
        }
        let address = load_address + pc as u64;
        let literal = self.literals.literal_source(&decoded, address);
        Ok(Scanned {
            position: pc,
            length: decoded.length,
            mnemonic: decoded.mnemonic,
            target: decoded.target,
            operands: decoded.operands,
            literal,
        })
    }
}

fn finish(load_address: u64, bytes: &[u8], scanned: Vec<Scanned>) -> Vec<Instruction> {
    let labels = collect_auto_labels(load_address, &scanned);
    scanned
        .into_iter()
        .map(|insn| {
            let address = load_address + insn.position as u64;
            Instruction {
                mnemonic: insn.mnemonic.to_string(),
                position: insn.position,
                address,
                label: labels.get(&address).cloned(),
                bytes: bytes[insn.position..insn.position + insn.length].to_vec(),
                operands: format_operands(&insn.operands, &labels),
                target_address: insn.target,
                literal_source_address: insn.literal,
            }
        })
        .collect()
}

fn collect_auto_labels(
    load_address: u64,
    scanned: &[Scanned],
) -> BTreeMap<u64, String> {
    let starts: BTreeSet<u64> = scanned
        .iter()
        .map(|insn| load_address + insn.position as u64)
        .collect();
    let targets: BTreeSet<u64> = scanned
        .iter()
        .filter_map(|insn| insn.target)
        .filter(|target| starts.contains(target))
        .collect();

    let mut labels = BTreeMap::new();
    for (idx, target) in targets.into_iter().enumerate() {
        labels.insert(target, format!("L{idx}"));
    }
    labels
}

fn format_operands(operands: &[Operand], labels: &BTreeMap<u64, String>) -> String {
    operands
        .iter()
        .map(|op| match op {
            Operand::Reg(name) => name.to_string(),
            Operand::Imm(imm) => imm.to_string(),
            Operand::Shifted { imm, shift } => format!("{imm}, lsl #{shift}"),
            Operand::Target(target) => match labels.get(target) {
                Some(name) => name.clone(),
                None => format!("0x{target:x}"),
            },
            Operand::Mem(mem) => mem.to_string(),
            Operand::Address(address) => format!("0x{address:x}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Shared decoding helpers ───────────────────────────────────────────

#[inline]
pub(crate) fn read_u8(bytes: &[u8], pc: &mut usize) -> Result<u8, DisasmError> {
    if *pc >= bytes.len() {
        return Err(DisasmError::UnexpectedEof { offset: *pc });
    }
    let v = bytes[*pc];
    *pc += 1;
    Ok(v)
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], pc: &mut usize) -> Result<u32, DisasmError> {
    let Some(slice) = bytes.get(*pc..*pc + 4) else {
        return Err(DisasmError::UnexpectedEof { offset: *pc });
    };
    let v = u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]);
    *pc += 4;
    Ok(v)
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], pc: &mut usize) -> Result<u64, DisasmError> {
    let Some(slice) = bytes.get(*pc..*pc + 8) else {
        return Err(DisasmError::UnexpectedEof { offset: *pc });
    };
    let mut raw = [0u8; 8];
    raw.copy_from_slice(slice);
    *pc += 8;
    Ok(u64::from_le_bytes(raw))
}

/// Absolute target of a displacement relative to `base`.
pub(crate) fn relative_target(
    base: u64,
    disp: i64,
    offset: usize,
) -> Result<u64, DisasmError> {
    let target = base as i128 + disp as i128;
    if target < 0 || target > u64::MAX as i128 {
        return Err(DisasmError::InvalidRelativeTarget { offset, target });
    }
    Ok(target as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x64() -> Disassembler {
        Disassembler::new(Isa::X64).expect("x64 is supported")
    }

    #[test]
    fn unsupported_families_fail_at_creation() {
        assert_eq!(
            Disassembler::new(Isa::Riscv64).unwrap_err(),
            DisasmError::UnsupportedIsa { isa: Isa::Riscv64 }
        );
        assert!(Disassembler::new(Isa::Arm32).is_err());
        assert!(Disassembler::new(Isa::AArch64).is_ok());
    }

    #[test]
    fn parses_isa_names() {
        assert_eq!("amd64".parse::<Isa>(), Ok(Isa::X64));
        assert_eq!("arm64".parse::<Isa>(), Ok(Isa::AArch64));
        assert_eq!("mips".parse::<Isa>(), Err(DisasmError::UnknownIsa));
    }

    #[test]
    fn decodes_with_absolute_addresses_and_labels() {
        // push rbp; je +1; nop; ret
        let code = [0x55, 0x0F, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90, 0xC3];
        let insns = x64().decode(0x1000, &code, None);
        assert_eq!(insns.len(), 4);
        assert_eq!(insns[0].mnemonic, "push");
        assert_eq!(insns[0].operands, "rbp");
        assert_eq!(insns[1].address, 0x1001);
        assert_eq!(insns[1].target_address, Some(0x1008));
        assert_eq!(insns[1].operands, "L0");
        assert_eq!(insns[3].label.as_deref(), Some("L0"));
        assert_eq!(insns[3].position, 8);
        assert_eq!(insns[3].end_address(), 0x1009);
    }

    #[test]
    fn falls_back_to_prefix_when_decoding_fails() {
        // push rbp; mov rbp, rsp; <0x06 is invalid in 64-bit mode>; ret
        let code = [0x55, 0x48, 0x89, 0xE5, 0x06, 0xC3];
        let dis = x64();
        assert!(dis.try_decode(0x4000, &code, None).is_err());

        let insns = dis.decode(0x4000, &code, None);
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].mnemonic, "push");
        assert_eq!(insns[1].mnemonic, "mov");
        assert_eq!(insns[1].operands, "rbp, rsp");
        assert_eq!(insns[1].bytes, vec![0x48, 0x89, 0xE5]);
    }

    #[test]
    fn fallback_prefix_keeps_branch_labels() {
        // je +1; nop; ret; <invalid>
        let code = [0x74, 0x01, 0x90, 0xC3, 0x06];
        let insns = x64().decode(0x100, &code, None);
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].target_address, Some(0x103));
        assert_eq!(insns[0].operands, "L0");
        assert_eq!(insns[2].label.as_deref(), Some("L0"));
    }

    #[test]
    fn truncated_tail_keeps_prefix() {
        // ret; call rel32 with only two displacement bytes present
        let code = [0xC3, 0xE8, 0x00, 0x00];
        let insns = x64().decode(0, &code, None);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].mnemonic, "ret");
    }

    #[test]
    fn inline_data_is_not_decoded() {
        // jmp +4; four bytes of jump table; ret
        let code = [0xEB, 0x04, 0x06, 0x06, 0x06, 0x06, 0xC3];
        let mut inline = InlineDataDecoder::new();
        inline.add(2, 4, InlineDataKind::JumpTable);
        let insns = x64().try_decode(0x10, &code, Some(&inline)).expect("decode");
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[1].mnemonic, ".jumptable");
        assert_eq!(insns[1].len(), 4);
        assert_eq!(insns[2].label.as_deref(), Some("L0"));
    }

    #[test]
    fn listing_shows_labels_and_literals() {
        // mov rax, [rip+0x10]; ret
        let code = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, 0xC3];
        let insns = x64().decode(0x2000, &code, None);
        let listing = render_listing(&insns);
        assert!(listing.contains("mov rax, [rip+0x10]"));
        assert!(listing.contains("literal @ 0x2017"));
    }

    #[test]
    fn memory_operand_display() {
        let mem = MemoryOperand {
            base: Some("rbx"),
            index: Some(("rsi", 8)),
            displacement: -8,
            pc_relative: false,
        };
        assert_eq!(mem.to_string(), "[rbx+rsi*8-0x8]");
    }
}
