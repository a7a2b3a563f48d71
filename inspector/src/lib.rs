//! Tracking of a target VM's code caches and introspection of the machine
//! code in them.
//!
//! [`CodeCacheAccess`] is the entry point. It is refreshed once per epoch
//! with [`CodeCacheAccess::update_cache`] and answers which compilation
//! owns an address, hands out [`CodePointer`]s that survive relocation and
//! builds [`CodeLocation`]s. Everything that touches the target goes
//! through the non-blocking lock of [`TargetVm`]; when the target is busy,
//! cached answers are served instead.

pub mod address;
pub mod bytecode;
pub mod code_cache;
pub mod compilation;
pub mod context;
pub mod error;
pub mod interval;
pub mod location;
pub mod machine_code;
pub mod memo;
pub mod pointer;
pub mod reference;
pub mod region;
pub mod registry;
pub mod settings;
pub mod target;

#[cfg(test)]
mod testing;

pub use address::{Address, MemoryRange};
pub use code_cache::CodeCacheAccess;
pub use compilation::{CompilationId, CompiledMethod};
pub use context::InspectorContext;
pub use error::{DataIoError, InspectorError};
pub use location::{CodeLocation, LocationResolver, Resolution};
pub use machine_code::{MachineCodeInfo, MachineCodeInfoCache};
pub use pointer::{CodePointer, CodePointerManager};
pub use settings::{InspectorCreateInfo, InspectorSettings};
pub use target::{TargetGuard, TargetVm};
