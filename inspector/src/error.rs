use std::fmt;

use disassembler::DisasmError;

use crate::address::{Address, MemoryRange};

/// Target memory could not be read, e.g. because the process went away
/// mid-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataIoError {
    pub address: Address,
    pub length: usize,
}

impl fmt::Display for DataIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to read {} bytes at {:?} from the target",
            self.length, self.address
        )
    }
}

impl std::error::Error for DataIoError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectorError {
    /// The target lock is held elsewhere; try again later.
    Busy,
    /// Null address, or one that provably lies outside any code.
    InvalidAddress(Address),
    DataIo(DataIoError),
    /// Two registrations claim the same bytes.
    Overlap {
        existing: MemoryRange,
        new: MemoryRange,
    },
    /// A compilation was reported outside the region that owns it.
    OutsideRegion {
        region: String,
        start: Address,
        length: usize,
    },
    /// A region-specific manager was asked about a foreign address.
    AddressNotInRegion {
        region: String,
        address: Address,
    },
    IndexOutOfRange {
        index: usize,
        count: usize,
    },
    Unsupported(DisasmError),
    Settings(&'static str),
}

impl InspectorError {
    /// Fatal errors mean an invariant broke somewhere else and must not be
    /// papered over by retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Busy | Self::DataIo(_) => false,
            Self::InvalidAddress(_) | Self::IndexOutOfRange { .. } => false,
            Self::Overlap { .. }
            | Self::OutsideRegion { .. }
            | Self::AddressNotInRegion { .. }
            | Self::Unsupported(_)
            | Self::Settings(_) => true,
        }
    }

    /// Busy and I/O failures just mean "not available right now".
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::DataIo(_))
    }
}

impl fmt::Display for InspectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "target is busy"),
            Self::InvalidAddress(address) => {
                write!(f, "{address:?} is not a valid code address")
            }
            Self::DataIo(err) => write!(f, "{err}"),
            Self::Overlap { existing, new } => {
                write!(f, "memory range {new:?} overlaps {existing:?}")
            }
            Self::OutsideRegion {
                region,
                start,
                length,
            } => write!(
                f,
                "{length} bytes at {start:?} lie outside code region {region}"
            ),
            Self::AddressNotInRegion { region, address } => {
                write!(f, "{address:?} is not in region {region}")
            }
            Self::IndexOutOfRange { index, count } => {
                write!(f, "instruction index {index} out of range (count {count})")
            }
            Self::Unsupported(err) => write!(f, "{err}"),
            Self::Settings(msg) => write!(f, "invalid inspector settings: {msg}"),
        }
    }
}

impl std::error::Error for InspectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DataIo(err) => Some(err),
            Self::Unsupported(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DataIoError> for InspectorError {
    fn from(err: DataIoError) -> Self {
        Self::DataIo(err)
    }
}

impl From<DisasmError> for InspectorError {
    fn from(err: DisasmError) -> Self {
        Self::Unsupported(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disassembler::Isa;

    #[test]
    fn classifies_fatal_errors() {
        assert!(!InspectorError::Busy.is_fatal());
        let io = DataIoError {
            address: Address::new(0x10),
            length: 4,
        };
        assert!(!InspectorError::from(io).is_fatal());
        assert!(InspectorError::from(io).is_transient());
        assert!(
            InspectorError::Overlap {
                existing: MemoryRange::new(Address::new(0), 8),
                new: MemoryRange::new(Address::new(4), 8),
            }
            .is_fatal()
        );
        assert!(
            InspectorError::from(DisasmError::UnsupportedIsa { isa: Isa::Riscv64 })
                .is_fatal()
        );
        assert!(!InspectorError::InvalidAddress(Address::ZERO).is_fatal());
    }

    #[test]
    fn messages_name_the_address() {
        let err = InspectorError::AddressNotInRegion {
            region: "boot".to_string(),
            address: Address::new(0xbeef),
        };
        assert_eq!(err.to_string(), "0xbeef is not in region boot");
    }
}
