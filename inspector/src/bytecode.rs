//! Just enough of the target's bytecode format to find call sites.
//!
//! Bytecodes are big-endian. Constant pool indices are 16-bit.

/// Prefix widening the local-variable operand of the next instruction.
pub const WIDE: u8 = 0xC4;

/// Invocation opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Invoke {
    /// Operands: `cp_index:u16`
    Virtual = 0xB6,
    /// Operands: `cp_index:u16`
    Special = 0xB7,
    /// Operands: `cp_index:u16`
    Static = 0xB8,
    /// Operands: `cp_index:u16`, `count:u8`, `0:u8`
    Interface = 0xB9,
    /// Operands: `cp_index:u16`, `0:u8`, `0:u8`
    Dynamic = 0xBA,
}

impl Invoke {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0xB6 => Some(Self::Virtual),
            0xB7 => Some(Self::Special),
            0xB8 => Some(Self::Static),
            0xB9 => Some(Self::Interface),
            0xBA => Some(Self::Dynamic),
            _ => None,
        }
    }

    /// Calls that name a method-ref constant. `invokedynamic` names a call
    /// site, not a method.
    pub fn names_method(self) -> bool {
        !matches!(self, Self::Dynamic)
    }
}

/// A decoded invocation at some bytecode index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub invoke: Invoke,
    pub cp_index: u16,
}

/// Reads single instructions out of a method's bytecode.
pub struct BytecodeScanner<'a> {
    bytes: &'a [u8],
}

impl<'a> BytecodeScanner<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Opcode of the instruction at `bci`, looking through a `wide` prefix.
    pub fn opcode_at(&self, bci: usize) -> Option<u8> {
        let op = *self.bytes.get(bci)?;
        if op == WIDE {
            return self.bytes.get(bci + 1).copied();
        }
        Some(op)
    }

    /// The invocation at `bci`, if there is one.
    pub fn call_site_at(&self, bci: usize) -> Option<CallSite> {
        let invoke = Invoke::from_u8(*self.bytes.get(bci)?)?;
        let hi = *self.bytes.get(bci + 1)?;
        let lo = *self.bytes.get(bci + 2)?;
        Some(CallSite {
            invoke,
            cp_index: u16::from_be_bytes([hi, lo]),
        })
    }

    /// Constant pool index of the method invoked at `bci`.
    pub fn method_ref_index(&self, bci: usize) -> Option<u16> {
        self.call_site_at(bci)
            .filter(|site| site.invoke.names_method())
            .map(|site| site.cp_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // aload_0; invokevirtual #0x0102; iload 1 (wide); invokeinterface #7 1 0; return
    const CODE: [u8; 13] = [
        0x2A, 0xB6, 0x01, 0x02, 0xC4, 0x15, 0x00, 0x01, 0xB9, 0x00, 0x07, 0x01,
        0x00,
    ];

    #[test]
    fn reads_method_ref_indices() {
        let scanner = BytecodeScanner::new(&CODE);
        assert_eq!(scanner.method_ref_index(1), Some(0x0102));
        assert_eq!(scanner.method_ref_index(8), Some(7));
        assert_eq!(scanner.method_ref_index(0), None);
        assert_eq!(
            scanner.call_site_at(8).map(|site| site.invoke),
            Some(Invoke::Interface)
        );
    }

    #[test]
    fn opcode_looks_through_wide() {
        let scanner = BytecodeScanner::new(&CODE);
        assert_eq!(scanner.opcode_at(4), Some(0x15));
        assert_eq!(scanner.opcode_at(0), Some(0x2A));
        assert_eq!(scanner.opcode_at(100), None);
    }

    #[test]
    fn truncated_or_dynamic_calls_have_no_method() {
        assert_eq!(BytecodeScanner::new(&[0xB8, 0x00]).method_ref_index(0), None);
        let indy = [0xBA, 0x00, 0x03, 0x00, 0x00];
        let scanner = BytecodeScanner::new(&indy);
        assert_eq!(scanner.method_ref_index(0), None);
        assert_eq!(scanner.call_site_at(0).map(|s| s.cp_index), Some(3));
    }
}
