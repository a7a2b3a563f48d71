use crate::{
    DecodedInstruction, DisasmError, InstructionDecoder, LiteralLoadRecognizer,
    MemoryOperand, Operand, read_u32, relative_target,
};

/// Decoder for the A64 subset produced by the VM's compilers and stubs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AArch64;

impl InstructionDecoder for AArch64 {
    fn decode_at(
        &self,
        bytes: &[u8],
        offset: usize,
        load_address: u64,
    ) -> Result<DecodedInstruction, DisasmError> {
        let inst_start = offset;
        let mut pc = offset;
        let insn = read_u32(bytes, &mut pc)?;
        let address = load_address + inst_start as u64;

        let (mnemonic, operands) = if insn == 0xD503_201F {
            ("nop", vec![])
        } else if (insn & 0xFFE0_001F) == 0xD420_0000 {
            ("brk", vec![Operand::Imm(((insn >> 5) & 0xFFFF) as i64)])
        } else if (insn & 0xFFFF_FC1F) == 0xD65F_0000 {
            let rn = ((insn >> 5) & 0x1F) as usize;
            ("ret", vec![Operand::Reg(reg_name(rn))])
        } else if (insn & 0xFFFF_FC1F) == 0xD61F_0000 {
            let rn = ((insn >> 5) & 0x1F) as usize;
            ("br", vec![Operand::Reg(reg_name(rn))])
        } else if (insn & 0xFFFF_FC1F) == 0xD63F_0000 {
            let rn = ((insn >> 5) & 0x1F) as usize;
            ("blr", vec![Operand::Reg(reg_name(rn))])
        } else if (insn & 0x7C00_0000) == 0x1400_0000 {
            let imm26 = sign_extend(insn & 0x03FF_FFFF, 26);
            let target = relative_target(address, imm26 << 2, inst_start)?;
            let mnemonic = if (insn & 0x8000_0000) != 0 { "bl" } else { "b" };
            (mnemonic, vec![Operand::Target(target)])
        } else if (insn & 0xFF00_0010) == 0x5400_0000 {
            let imm19 = sign_extend((insn >> 5) & 0x7_FFFF, 19);
            let cond = (insn & 0xF) as u8;
            let target = relative_target(address, imm19 << 2, inst_start)?;
            (cond_mnemonic(cond), vec![Operand::Target(target)])
        } else if (insn & 0x7E00_0000) == 0x3400_0000 {
            let imm19 = sign_extend((insn >> 5) & 0x7_FFFF, 19);
            let rt = (insn & 0x1F) as usize;
            let wide = (insn & 0x8000_0000) != 0;
            let target = relative_target(address, imm19 << 2, inst_start)?;
            let mnemonic = if (insn & 0x0100_0000) != 0 { "cbnz" } else { "cbz" };
            let reg = if wide { zr_name(rt) } else { w_name(rt) };
            (mnemonic, vec![Operand::Reg(reg), Operand::Target(target)])
        } else if (insn & 0xBF00_0000) == 0x1800_0000 {
            // ldr (literal), 32- and 64-bit general registers
            let imm19 = sign_extend((insn >> 5) & 0x7_FFFF, 19);
            let rt = (insn & 0x1F) as usize;
            let reg = if (insn & 0x4000_0000) != 0 {
                zr_name(rt)
            } else {
                w_name(rt)
            };
            let mem = MemoryOperand {
                base: Some("pc"),
                index: None,
                displacement: imm19 << 2,
                pc_relative: true,
            };
            ("ldr", vec![Operand::Reg(reg), Operand::Mem(mem)])
        } else if (insn & 0x1F00_0000) == 0x1000_0000 {
            let immlo = (insn >> 29) & 0b11;
            let immhi = (insn >> 5) & 0x7_FFFF;
            let imm = sign_extend((immhi << 2) | immlo, 21);
            let rd = (insn & 0x1F) as usize;
            if (insn & 0x8000_0000) != 0 {
                let page = address & !0xFFF;
                let target = relative_target(page, imm << 12, inst_start)?;
                ("adrp", vec![Operand::Reg(zr_name(rd)), Operand::Address(target)])
            } else {
                let target = relative_target(address, imm, inst_start)?;
                ("adr", vec![Operand::Reg(zr_name(rd)), Operand::Address(target)])
            }
        } else if (insn & 0xFFE0_FFE0) == 0xAA00_03E0 {
            let rm = ((insn >> 16) & 0x1F) as usize;
            let rd = (insn & 0x1F) as usize;
            ("mov", vec![Operand::Reg(zr_name(rd)), Operand::Reg(zr_name(rm))])
        } else if (insn & 0xFFE0_FC1F) == 0xEB00_001F {
            let rm = ((insn >> 16) & 0x1F) as usize;
            let rn = ((insn >> 5) & 0x1F) as usize;
            ("cmp", vec![Operand::Reg(zr_name(rn)), Operand::Reg(zr_name(rm))])
        } else if (insn & 0xFFC0_001F) == 0xF100_001F {
            let rn = ((insn >> 5) & 0x1F) as usize;
            let imm = ((insn >> 10) & 0xFFF) as i64;
            ("cmp", vec![Operand::Reg(reg_name(rn)), Operand::Imm(imm)])
        } else if (insn & 0xFFE0_FC00) == 0x8B00_0000
            || (insn & 0xFFE0_FC00) == 0xCB00_0000
        {
            let rm = ((insn >> 16) & 0x1F) as usize;
            let rn = ((insn >> 5) & 0x1F) as usize;
            let rd = (insn & 0x1F) as usize;
            let mnemonic = if (insn & 0x4000_0000) != 0 { "sub" } else { "add" };
            (
                mnemonic,
                vec![
                    Operand::Reg(zr_name(rd)),
                    Operand::Reg(zr_name(rn)),
                    Operand::Reg(zr_name(rm)),
                ],
            )
        } else if (insn & 0xBF80_0000) == 0x9100_0000 {
            // add/sub (immediate), 64-bit, optional lsl #12
            let mut imm = ((insn >> 10) & 0xFFF) as i64;
            if (insn & 0x0040_0000) != 0 {
                imm <<= 12;
            }
            let rn = ((insn >> 5) & 0x1F) as usize;
            let rd = (insn & 0x1F) as usize;
            let mnemonic = if (insn & 0x4000_0000) != 0 { "sub" } else { "add" };
            (
                mnemonic,
                vec![
                    Operand::Reg(reg_name(rd)),
                    Operand::Reg(reg_name(rn)),
                    Operand::Imm(imm),
                ],
            )
        } else if (insn & 0xFF80_0000) == 0xD280_0000
            || (insn & 0xFF80_0000) == 0xF280_0000
        {
            let hw = (insn >> 21) & 0b11;
            let imm16 = (insn >> 5) & 0xFFFF;
            let rd = (insn & 0x1F) as usize;
            let mnemonic = if (insn & 0x2000_0000) != 0 { "movk" } else { "movz" };
            (
                mnemonic,
                vec![
                    Operand::Reg(zr_name(rd)),
                    Operand::Shifted {
                        imm: imm16,
                        shift: hw * 16,
                    },
                ],
            )
        } else if (insn & 0xFF80_0000) == 0xF900_0000 {
            // ldr/str (unsigned offset), 64-bit
            let imm = (((insn >> 10) & 0xFFF) * 8) as i64;
            let rn = ((insn >> 5) & 0x1F) as usize;
            let rt = (insn & 0x1F) as usize;
            let mnemonic = if (insn & 0x0040_0000) != 0 { "ldr" } else { "str" };
            (mnemonic, vec![Operand::Reg(zr_name(rt)), base_offset(rn, imm)])
        } else if (insn & 0xFE00_0000) == 0xA800_0000
            && (insn & 0x0180_0000) != 0
        {
            // ldp/stp, 64-bit, post-index, signed offset or pre-index
            let imm7 = sign_extend((insn >> 15) & 0x7F, 7) * 8;
            let rt2 = ((insn >> 10) & 0x1F) as usize;
            let rn = ((insn >> 5) & 0x1F) as usize;
            let rt = (insn & 0x1F) as usize;
            let mnemonic = if (insn & 0x0040_0000) != 0 { "ldp" } else { "stp" };
            (
                mnemonic,
                vec![
                    Operand::Reg(zr_name(rt)),
                    Operand::Reg(zr_name(rt2)),
                    base_offset(rn, imm7),
                ],
            )
        } else {
            return Err(DisasmError::UnsupportedInstruction {
                offset: inst_start,
                insn,
            });
        };

        Ok(DecodedInstruction::new(pc - inst_start, mnemonic, operands))
    }
}

impl LiteralLoadRecognizer for AArch64 {
    fn literal_source(
        &self,
        insn: &DecodedInstruction,
        address: u64,
    ) -> Option<u64> {
        if insn.mnemonic != "ldr" {
            return None;
        }
        let mem = insn.memory.filter(|mem| mem.pc_relative)?;
        address.checked_add_signed(mem.displacement)
    }
}

fn base_offset(rn: usize, displacement: i64) -> Operand {
    Operand::Mem(MemoryOperand {
        base: Some(reg_name(rn)),
        index: None,
        displacement,
        pc_relative: false,
    })
}

fn sign_extend(v: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((v as i64) << shift) >> shift
}

fn cond_mnemonic(cond: u8) -> &'static str {
    match cond {
        0x0 => "b.eq",
        0x1 => "b.ne",
        0x2 => "b.cs",
        0x3 => "b.cc",
        0x4 => "b.mi",
        0x5 => "b.pl",
        0x6 => "b.vs",
        0x7 => "b.vc",
        0x8 => "b.hi",
        0x9 => "b.ls",
        0xA => "b.ge",
        0xB => "b.lt",
        0xC => "b.gt",
        0xD => "b.le",
        0xE => "b.al",
        _ => "b.nv",
    }
}

const X_REGS: [&str; 31] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11",
    "x12", "x13", "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22",
    "x23", "x24", "x25", "x26", "x27", "x28", "x29", "x30",
];

const W_REGS: [&str; 31] = [
    "w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10", "w11",
    "w12", "w13", "w14", "w15", "w16", "w17", "w18", "w19", "w20", "w21", "w22",
    "w23", "w24", "w25", "w26", "w27", "w28", "w29", "w30",
];

/// Register 31 read as the stack pointer.
fn reg_name(idx: usize) -> &'static str {
    X_REGS.get(idx).copied().unwrap_or("sp")
}

/// Register 31 read as the zero register.
fn zr_name(idx: usize) -> &'static str {
    X_REGS.get(idx).copied().unwrap_or("xzr")
}

fn w_name(idx: usize) -> &'static str {
    W_REGS.get(idx).copied().unwrap_or("wzr")
}
