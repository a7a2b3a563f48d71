use disassembler::Isa;

/// Overrides supplied when connecting to a target. Anything left `None`
/// takes the value from [`InspectorSettings::default`].
#[derive(Debug, Clone, Default)]
pub struct InspectorCreateInfo {
    pub isa: Option<Isa>,
    pub sweep_interval: Option<u64>,
    pub detect_patches: Option<bool>,
    pub external_code_guess: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorSettings {
    /// Instruction-set family of the target's machine code.
    pub isa: Isa,
    /// Refresh epochs between sweeps of the pointer and reference memo tables.
    pub sweep_interval: u64,
    /// Compare target code against cached copies on each refresh.
    pub detect_patches: bool,
    /// Assumed size of an external code block registered without a length.
    pub external_code_guess: usize,
}

impl Default for InspectorSettings {
    fn default() -> Self {
        Self {
            isa: Isa::host(),
            sweep_interval: 8,
            detect_patches: true,
            external_code_guess: 256, // bytes
        }
    }
}

impl InspectorSettings {
    pub fn from_info(info: &InspectorCreateInfo) -> Result<Self, &'static str> {
        let mut settings = Self::default();
        info.isa.inspect(|&val| settings.isa = val);
        info.sweep_interval
            .inspect(|&val| settings.sweep_interval = val);
        info.detect_patches
            .inspect(|&val| settings.detect_patches = val);
        info.external_code_guess
            .inspect(|&val| settings.external_code_guess = val);
        settings.validate()?;
        Ok(settings)
    }

    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.sweep_interval == 0 {
            return Err("sweep_interval must be > 0");
        }
        if self.external_code_guess == 0 {
            return Err("external_code_guess must be > 0");
        }
        Ok(())
    }
}
