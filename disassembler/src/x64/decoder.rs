use crate::{
    DecodedInstruction, DisasmError, InstructionDecoder, LiteralLoadRecognizer,
    MemoryOperand, Operand, read_u8, read_u32, read_u64, relative_target,
};

/// Decoder for the x86-64 subset produced by the VM's compilers and stubs.
#[derive(Debug, Clone, Copy, Default)]
pub struct X64;

#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    #[inline]
    fn from_byte(byte: u8) -> Self {
        Self {
            w: (byte & 0b0000_1000) != 0,
            r: (byte & 0b0000_0100) != 0,
            x: (byte & 0b0000_0010) != 0,
            b: (byte & 0b0000_0001) != 0,
        }
    }

    #[inline]
    fn r_bit(self) -> u8 {
        (self.r as u8) << 3
    }

    #[inline]
    fn x_bit(self) -> u8 {
        (self.x as u8) << 3
    }

    #[inline]
    fn b_bit(self) -> u8 {
        (self.b as u8) << 3
    }
}

enum Rm {
    Reg(u8),
    Mem(MemoryOperand),
}

impl Rm {
    fn operand(self, wide: bool) -> Operand {
        match self {
            Self::Reg(idx) => Operand::Reg(reg_name(idx, wide)),
            Self::Mem(mem) => Operand::Mem(mem),
        }
    }
}

impl InstructionDecoder for X64 {
    fn decode_at(
        &self,
        bytes: &[u8],
        offset: usize,
        load_address: u64,
    ) -> Result<DecodedInstruction, DisasmError> {
        let inst_start = offset;
        let mut pc = offset;
        let mut rex = Rex::default();

        let mut opcode = read_u8(bytes, &mut pc)?;
        if matches!(opcode, 0x40..=0x4F) {
            rex = Rex::from_byte(opcode);
            opcode = read_u8(bytes, &mut pc)?;
        }

        let (mnemonic, operands) = match opcode {
            0x90 => ("nop", vec![]),
            0xCC => ("int3", vec![]),
            0xC3 => ("ret", vec![]),
            0xC9 => ("leave", vec![]),
            0x50..=0x57 => {
                let reg = (opcode - 0x50) | rex.b_bit();
                ("push", vec![Operand::Reg(reg_name(reg, true))])
            }
            0x58..=0x5F => {
                let reg = (opcode - 0x58) | rex.b_bit();
                ("pop", vec![Operand::Reg(reg_name(reg, true))])
            }
            0xB8..=0xBF => {
                let reg = (opcode - 0xB8) | rex.b_bit();
                let imm = if rex.w {
                    read_u64(bytes, &mut pc)? as i64
                } else {
                    read_u32(bytes, &mut pc)? as i64
                };
                ("mov", vec![Operand::Reg(reg_name(reg, rex.w)), Operand::Imm(imm)])
            }
            // r/m <- reg
            0x01 | 0x09 | 0x21 | 0x29 | 0x31 | 0x39 | 0x85 | 0x89 => {
                let modrm = read_u8(bytes, &mut pc)?;
                let (mode, reg, rm) = decode_modrm(modrm);
                let src = reg_name(reg | rex.r_bit(), rex.w);
                let dst = decode_rm(bytes, &mut pc, rex, mode, rm)?;
                (
                    alu_mnemonic(opcode),
                    vec![dst.operand(rex.w), Operand::Reg(src)],
                )
            }
            // reg <- r/m
            0x03 | 0x2B | 0x3B | 0x8B | 0x8D => {
                let modrm = read_u8(bytes, &mut pc)?;
                let (mode, reg, rm) = decode_modrm(modrm);
                let dst = reg_name(reg | rex.r_bit(), rex.w);
                let src = decode_rm(bytes, &mut pc, rex, mode, rm)?;
                if opcode == 0x8D && matches!(src, Rm::Reg(_)) {
                    return Err(DisasmError::UnsupportedAddressing {
                        offset: inst_start,
                    });
                }
                (
                    alu_mnemonic(opcode),
                    vec![Operand::Reg(dst), src.operand(rex.w)],
                )
            }
            0x81 | 0x83 => {
                let modrm = read_u8(bytes, &mut pc)?;
                let (mode, ext, rm) = decode_modrm(modrm);
                let dst = decode_rm(bytes, &mut pc, rex, mode, rm)?;
                let imm = if opcode == 0x81 {
                    read_u32(bytes, &mut pc)? as i32 as i64
                } else {
                    read_u8(bytes, &mut pc)? as i8 as i64
                };
                (group1_mnemonic(ext), vec![dst.operand(rex.w), Operand::Imm(imm)])
            }
            0xE8 | 0xE9 => {
                let disp = read_u32(bytes, &mut pc)? as i32 as i64;
                let target = relative_target(
                    load_address + pc as u64,
                    disp,
                    inst_start,
                )?;
                let mnemonic = if opcode == 0xE8 { "call" } else { "jmp" };
                (mnemonic, vec![Operand::Target(target)])
            }
            0xEB => {
                let disp = read_u8(bytes, &mut pc)? as i8 as i64;
                let target = relative_target(
                    load_address + pc as u64,
                    disp,
                    inst_start,
                )?;
                ("jmp", vec![Operand::Target(target)])
            }
            0x70..=0x7F => {
                let disp = read_u8(bytes, &mut pc)? as i8 as i64;
                let target = relative_target(
                    load_address + pc as u64,
                    disp,
                    inst_start,
                )?;
                (jcc_mnemonic(opcode & 0xF), vec![Operand::Target(target)])
            }
            0x0F => {
                let ext = read_u8(bytes, &mut pc)?;
                match ext {
                    0x80..=0x8F => {
                        let disp = read_u32(bytes, &mut pc)? as i32 as i64;
                        let target = relative_target(
                            load_address + pc as u64,
                            disp,
                            inst_start,
                        )?;
                        (jcc_mnemonic(ext & 0xF), vec![Operand::Target(target)])
                    }
                    0x1F => {
                        let modrm = read_u8(bytes, &mut pc)?;
                        let (mode, _, rm) = decode_modrm(modrm);
                        let operand = decode_rm(bytes, &mut pc, rex, mode, rm)?;
                        ("nop", vec![operand.operand(rex.w)])
                    }
                    0x0B => ("ud2", vec![]),
                    _ => {
                        return Err(DisasmError::UnsupportedOpcode {
                            offset: inst_start,
                            opcode: ext,
                        });
                    }
                }
            }
            0xFF => {
                let modrm = read_u8(bytes, &mut pc)?;
                let (mode, ext, rm) = decode_modrm(modrm);
                let mnemonic = match ext {
                    0b010 => "call",
                    0b100 => "jmp",
                    0b110 => "push",
                    _ => {
                        return Err(DisasmError::UnsupportedAddressing {
                            offset: inst_start,
                        });
                    }
                };
                let operand = decode_rm(bytes, &mut pc, rex, mode, rm)?;
                (mnemonic, vec![operand.operand(true)])
            }
            _ => {
                return Err(DisasmError::UnsupportedOpcode {
                    offset: inst_start,
                    opcode,
                });
            }
        };

        Ok(DecodedInstruction::new(pc - inst_start, mnemonic, operands))
    }
}

impl LiteralLoadRecognizer for X64 {
    /// Any rip-relative memory read is a literal load; `lea` only computes
    /// the address.
    fn literal_source(
        &self,
        insn: &DecodedInstruction,
        address: u64,
    ) -> Option<u64> {
        let mem = insn.memory.filter(|mem| mem.pc_relative && mem.base.is_none())?;
        if matches!(insn.mnemonic, "lea" | "nop") {
            return None;
        }
        let end = address.checked_add(insn.length as u64)?;
        end.checked_add_signed(mem.displacement)
    }
}

#[inline]
fn decode_modrm(modrm: u8) -> (u8, u8, u8) {
    ((modrm >> 6) & 0b11, (modrm >> 3) & 0b111, modrm & 0b111)
}

fn decode_rm(
    bytes: &[u8],
    pc: &mut usize,
    rex: Rex,
    mode: u8,
    rm: u8,
) -> Result<Rm, DisasmError> {
    if mode == 0b11 {
        return Ok(Rm::Reg(rm | rex.b_bit()));
    }

    let mut mem = MemoryOperand {
        base: None,
        index: None,
        displacement: 0,
        pc_relative: false,
    };
    if rm == 0b100 {
        let sib = read_u8(bytes, pc)?;
        let scale = 1u8 << (sib >> 6);
        let index = ((sib >> 3) & 0b111) | rex.x_bit();
        if index != 0b100 {
            mem.index = Some((reg_name(index, true), scale));
        }
        if (sib & 0b111) == 0b101 && mode == 0b00 {
            mem.displacement = read_u32(bytes, pc)? as i32 as i64;
            return Ok(Rm::Mem(mem));
        }
        mem.base = Some(reg_name((sib & 0b111) | rex.b_bit(), true));
    } else if rm == 0b101 && mode == 0b00 {
        mem.pc_relative = true;
        mem.displacement = read_u32(bytes, pc)? as i32 as i64;
        return Ok(Rm::Mem(mem));
    } else {
        mem.base = Some(reg_name(rm | rex.b_bit(), true));
    }

    mem.displacement = match mode {
        0b01 => read_u8(bytes, pc)? as i8 as i64,
        0b10 => read_u32(bytes, pc)? as i32 as i64,
        _ => 0,
    };
    Ok(Rm::Mem(mem))
}

fn alu_mnemonic(opcode: u8) -> &'static str {
    match opcode {
        0x01 | 0x03 => "add",
        0x09 => "or",
        0x21 => "and",
        0x29 | 0x2B => "sub",
        0x31 => "xor",
        0x39 | 0x3B => "cmp",
        0x85 => "test",
        0x8D => "lea",
        _ => "mov",
    }
}

fn group1_mnemonic(ext: u8) -> &'static str {
    match ext {
        0 => "add",
        1 => "or",
        2 => "adc",
        3 => "sbb",
        4 => "and",
        5 => "sub",
        6 => "xor",
        _ => "cmp",
    }
}

fn jcc_mnemonic(cond: u8) -> &'static str {
    match cond {
        0x0 => "jo",
        0x1 => "jno",
        0x2 => "jb",
        0x3 => "jae",
        0x4 => "je",
        0x5 => "jne",
        0x6 => "jbe",
        0x7 => "ja",
        0x8 => "js",
        0x9 => "jns",
        0xA => "jp",
        0xB => "jnp",
        0xC => "jl",
        0xD => "jge",
        0xE => "jle",
        _ => "jg",
    }
}

fn reg_name(idx: u8, wide: bool) -> &'static str {
    const WIDE: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9",
        "r10", "r11", "r12", "r13", "r14", "r15",
    ];
    const NARROW: [&str; 16] = [
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d",
        "r10d", "r11d", "r12d", "r13d", "r14d", "r15d",
    ];
    let table = if wide { &WIDE } else { &NARROW };
    table.get(idx as usize).copied().unwrap_or("<bad-reg>")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8], address: u64) -> DecodedInstruction {
        X64.decode_at(bytes, 0, address).expect("decode")
    }

    #[test]
    fn decodes_mov_ri64() {
        let insn = decode_one(
            &[0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
            0,
        );
        assert_eq!(insn.length, 10);
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.operands, vec![
            Operand::Reg("rax"),
            Operand::Imm(0x1122_3344_5566_7788),
        ]);
    }

    #[test]
    fn decodes_mov_rr_with_rex() {
        let insn = decode_one(&[0x4D, 0x89, 0xF8], 0);
        assert_eq!(insn.operands, vec![Operand::Reg("r8"), Operand::Reg("r15")]);
    }

    #[test]
    fn narrow_registers_without_rex_w() {
        let insn = decode_one(&[0x89, 0xC8], 0);
        assert_eq!(insn.operands, vec![Operand::Reg("eax"), Operand::Reg("ecx")]);
    }

    #[test]
    fn decodes_add_and_cmp_immediate() {
        let add = decode_one(&[0x48, 0x01, 0xF8], 0);
        assert_eq!(add.mnemonic, "add");
        assert_eq!(add.operands, vec![Operand::Reg("rax"), Operand::Reg("rdi")]);

        let cmp = decode_one(&[0x48, 0x81, 0xF9, 0xFF, 0xFF, 0xFF, 0xFF], 0);
        assert_eq!(cmp.mnemonic, "cmp");
        assert_eq!(cmp.operands, vec![Operand::Reg("rcx"), Operand::Imm(-1)]);
    }

    #[test]
    fn call_target_is_absolute() {
        let insn = decode_one(&[0xE8, 0x0B, 0x00, 0x00, 0x00], 0x7000);
        assert_eq!(insn.target, Some(0x7010));
    }

    #[test]
    fn backwards_short_branch() {
        let insn = X64
            .decode_at(&[0x90, 0x90, 0x75, 0xFC], 2, 0x100)
            .expect("decode");
        assert_eq!(insn.mnemonic, "jne");
        assert_eq!(insn.target, Some(0x100));
    }

    #[test]
    fn branch_below_zero_is_rejected() {
        let err = X64.decode_at(&[0xEB, 0x80], 0, 0).unwrap_err();
        assert!(matches!(err, DisasmError::InvalidRelativeTarget { .. }));
    }

    #[test]
    fn rip_relative_mov_is_a_literal_load() {
        let insn = decode_one(&[0x48, 0x8B, 0x05, 0xF0, 0xFF, 0xFF, 0xFF], 0x1000);
        assert_eq!(X64.literal_source(&insn, 0x1000), Some(0x1000 + 7 - 0x10));
    }

    #[test]
    fn lea_and_register_loads_are_not_literal_loads() {
        let lea = decode_one(&[0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00], 0);
        assert_eq!(lea.mnemonic, "lea");
        assert_eq!(X64.literal_source(&lea, 0), None);

        // mov rax, [rbx+0x8]
        let load = decode_one(&[0x48, 0x8B, 0x43, 0x08], 0);
        assert_eq!(X64.literal_source(&load, 0), None);
    }

    #[test]
    fn decodes_sib_operand() {
        // mov rax, [rbx+rsi*8+0x10]
        let insn = decode_one(&[0x48, 0x8B, 0x44, 0xF3, 0x10], 0);
        assert_eq!(insn.length, 5);
        let mem = insn.memory.expect("memory operand");
        assert_eq!(mem.base, Some("rbx"));
        assert_eq!(mem.index, Some(("rsi", 8)));
        assert_eq!(mem.displacement, 0x10);
    }

    #[test]
    fn indirect_call_through_register() {
        let insn = decode_one(&[0x41, 0xFF, 0xD3], 0);
        assert_eq!(insn.mnemonic, "call");
        assert_eq!(insn.operands, vec![Operand::Reg("r11")]);
        assert_eq!(insn.target, None);
    }

    #[test]
    fn rex_without_opcode_is_eof() {
        assert_eq!(
            X64.decode_at(&[0x48], 0, 0).unwrap_err(),
            DisasmError::UnexpectedEof { offset: 1 }
        );
    }
}
