//! Canonical references to the data arrays embedded in code-cache
//! allocations.

use std::fmt;
use std::sync::Arc;

use crate::address::Address;
use crate::compilation::{CompilationId, CompiledMethod};
use crate::error::InspectorError;
use crate::memo::MemoTable;
use crate::registry::CompiledCodeRegistry;
use crate::target::DataArrayKind;

/// One data array of one compilation.
pub struct RemoteReference {
    compilation: Arc<CompiledMethod>,
    kind: DataArrayKind,
    /// Origin as first seen; only used for regions whose code never moves.
    origin: Address,
    tracking: bool,
}

impl RemoteReference {
    pub fn kind(&self) -> DataArrayKind {
        self.kind
    }

    pub fn compilation(&self) -> &Arc<CompiledMethod> {
        &self.compilation
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Where the array lives now, or `None` once its compilation is
    /// evicted.
    pub fn origin(&self) -> Option<Address> {
        if !self.tracking {
            return Some(self.origin);
        }
        self.compilation.data_array_origin(self.kind)
    }

    pub fn is_live(&self) -> bool {
        self.origin().is_some()
    }
}

impl fmt::Debug for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RemoteReference({} {} -> {:?})",
            self.compilation.designator(),
            self.kind.name(),
            self.origin()
        )
    }
}

/// Issues [`RemoteReference`]s for one code cache region.
pub struct RemoteReferenceManager {
    registry: Arc<CompiledCodeRegistry>,
    references: MemoTable<(CompilationId, DataArrayKind), RemoteReference>,
}

impl RemoteReferenceManager {
    pub fn new(registry: Arc<CompiledCodeRegistry>) -> Self {
        Self {
            registry,
            references: MemoTable::new(),
        }
    }

    /// `None` when the compilation has no such array or is evicted.
    pub fn make_reference(
        &self,
        compilation: &Arc<CompiledMethod>,
        kind: DataArrayKind,
    ) -> Option<Arc<RemoteReference>> {
        self.references.try_get_or_add((compilation.id(), kind), || {
            let origin = compilation.data_array_origin(kind)?;
            Some(RemoteReference {
                compilation: compilation.clone(),
                kind,
                origin,
                tracking: self.registry.kind().is_managed(),
            })
        })
    }

    /// The reference for the array whose origin is `address`, if any.
    pub fn make_reference_at(
        &self,
        address: Address,
    ) -> Result<Option<Arc<RemoteReference>>, InspectorError> {
        if !self.registry.range().contains(address) {
            return Err(InspectorError::AddressNotInRegion {
                region: self.registry.kind().name().to_string(),
                address,
            });
        }
        let Some(compilation) = self.registry.find(address) else {
            return Ok(None);
        };
        let kind = DataArrayKind::ALL
            .into_iter()
            .find(|&kind| compilation.data_array_origin(kind) == Some(address));
        Ok(kind.and_then(|kind| self.make_reference(&compilation, kind)))
    }

    pub fn live_count(&self) -> usize {
        self.references.live_count()
    }

    pub fn total_count(&self) -> usize {
        self.references.total_count()
    }

    pub fn sweep(&self) -> usize {
        self.references.sweep()
    }
}
