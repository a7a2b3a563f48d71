use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use disassembler::Disassembler;

use crate::compilation::CompilationId;
use crate::error::InspectorError;
use crate::settings::InspectorSettings;
use crate::target::{TargetGuard, TargetVm};

/// State shared by every component of one connection to a target.
///
/// Built once by [`crate::CodeCacheAccess::new`] and handed down by `Arc`.
pub struct InspectorContext {
    target: Arc<dyn TargetVm>,
    disassembler: Disassembler,
    settings: InspectorSettings,
    next_compilation: AtomicU64,
}

impl InspectorContext {
    /// Fails for instruction sets without a decoder.
    pub fn new(
        target: Arc<dyn TargetVm>,
        settings: InspectorSettings,
    ) -> Result<Arc<Self>, InspectorError> {
        let disassembler = Disassembler::new(settings.isa)?;
        Ok(Arc::new(Self {
            target,
            disassembler,
            settings,
            next_compilation: AtomicU64::new(1),
        }))
    }

    #[inline(always)]
    pub fn target(&self) -> &dyn TargetVm {
        self.target.as_ref()
    }

    pub fn disassembler(&self) -> &Disassembler {
        &self.disassembler
    }

    pub fn settings(&self) -> &InspectorSettings {
        &self.settings
    }

    #[must_use]
    pub fn try_lock(&self) -> Option<TargetGuard<'_>> {
        TargetGuard::try_acquire(self.target.as_ref())
    }

    /// Like [`InspectorContext::try_lock`], reporting a busy target as an
    /// error.
    pub fn lock(&self) -> Result<TargetGuard<'_>, InspectorError> {
        self.try_lock().ok_or(InspectorError::Busy)
    }

    pub(crate) fn next_compilation_id(&self) -> CompilationId {
        CompilationId(self.next_compilation.fetch_add(1, Ordering::Relaxed))
    }
}
