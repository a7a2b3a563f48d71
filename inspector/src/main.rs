use clap::Parser as ClapParser;
use std::{fs, process, sync::Arc};

use disassembler::{Instruction, Isa};
use inspector::target::{
    CodeDetails, CompilationRecord, CompilationRef, LibraryInfo, MethodAccess, MethodInfo,
    MethodKey, MethodRef, RegionKind, RegionStatus,
};
use inspector::{Address, CodeCacheAccess, DataIoError, InspectorCreateInfo, MemoryRange, TargetVm};
use parking_lot::Mutex;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raw machine code to disassemble
    #[arg(help = "File holding the code bytes")]
    file: String,

    /// Address the code is treated as loaded at
    #[arg(long, default_value = "0x0", value_parser = parse_address)]
    base: u64,

    /// Instruction-set family of the code
    #[arg(long, default_value = "x64", value_parser = parse_isa)]
    isa: Isa,

    /// Print counts instead of the listing
    #[arg(long)]
    summary: bool,
}

fn parse_address(text: &str) -> Result<u64, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|err| format!("bad address '{text}': {err}"))
}

fn parse_isa(text: &str) -> Result<Isa, String> {
    text.parse::<Isa>().map_err(|err| format!("{err}"))
}

/// A target whose only memory is one file image and that has no code
/// cache. The tool is single-threaded, so the lock is a depth counter.
struct ImageTarget {
    base: Address,
    image: Vec<u8>,
    depth: Mutex<usize>,
}

impl ImageTarget {
    fn range(&self) -> MemoryRange {
        MemoryRange::new(self.base, self.image.len())
    }
}

impl TargetVm for ImageTarget {
    fn try_lock(&self) -> bool {
        *self.depth.lock() += 1;
        true
    }

    fn unlock(&self) {
        let mut depth = self.depth.lock();
        *depth = depth.saturating_sub(1);
    }

    fn read_bytes(&self, address: Address, length: usize) -> Result<Vec<u8>, DataIoError> {
        let wanted = MemoryRange::new(address, length);
        if !self.range().encloses(&wanted) {
            return Err(DataIoError { address, length });
        }
        let offset = address.offset_from(self.base).unwrap_or_default();
        Ok(self.image[offset..offset + length].to_vec())
    }

    fn needs_adapters(&self) -> bool {
        false
    }

    fn wiped_code_sentinel(&self) -> Address {
        Address::ZERO
    }

    fn region_status(&self, _region: RegionKind) -> Result<RegionStatus, DataIoError> {
        Ok(RegionStatus::default())
    }

    fn compilation_refs(
        &self,
        _region: RegionKind,
        _from: usize,
    ) -> Result<Vec<CompilationRef>, DataIoError> {
        Ok(Vec::new())
    }

    fn read_compilation(
        &self,
        compilation: CompilationRef,
    ) -> Result<CompilationRecord, DataIoError> {
        Err(DataIoError {
            address: compilation.0,
            length: 0,
        })
    }

    fn read_code_details(
        &self,
        _compilation: CompilationRef,
    ) -> Result<CodeDetails, DataIoError> {
        Ok(CodeDetails::default())
    }

    fn method_info(&self, method: MethodRef) -> Result<MethodInfo, DataIoError> {
        Err(DataIoError {
            address: method.0,
            length: 0,
        })
    }

    fn find_method(&self, _key: &MethodKey) -> Result<Option<MethodRef>, DataIoError> {
        Ok(None)
    }

    fn resolve_callee(
        &self,
        _caller: MethodRef,
        _cp_index: u16,
    ) -> Result<Option<MethodRef>, DataIoError> {
        Ok(None)
    }

    fn compilations_of(&self, _method: MethodRef) -> Result<Vec<CompilationRef>, DataIoError> {
        Ok(Vec::new())
    }

    fn well_known_method(
        &self,
        _access: &MethodAccess,
    ) -> Result<Option<MethodRef>, DataIoError> {
        Ok(None)
    }

    fn native_libraries(&self) -> Result<Vec<LibraryInfo>, DataIoError> {
        Ok(Vec::new())
    }

    fn data_regions(&self) -> Vec<(String, MemoryRange)> {
        Vec::new()
    }
}

fn print_instruction(insn: &Instruction) {
    if let Some(label) = &insn.label {
        println!("{label}:");
    }
    let bytes: Vec<String> = insn.bytes.iter().map(|b| format!("{b:02x}")).collect();
    let mut line = format!(
        "0x{:016x} {:<24} {}",
        insn.address,
        bytes.join(" "),
        insn.mnemonic
    );
    if !insn.operands.is_empty() {
        line.push(' ');
        line.push_str(&insn.operands);
    }
    if let Some(target) = insn.target_address {
        line.push_str(&format!("    ; -> 0x{target:x}"));
    }
    if let Some(literal) = insn.literal_source_address {
        line.push_str(&format!("    ; literal @ 0x{literal:x}"));
    }
    println!("{line}");
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let image = match fs::read(&cli.file) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("Error reading file '{}': {}", cli.file, err);
            process::exit(1);
        }
    };
    if image.is_empty() {
        eprintln!("Error: '{}' is empty", cli.file);
        process::exit(1);
    }
    // Address zero is reserved for "no code".
    let base = Address::new(cli.base.max(1));
    if base.raw() != cli.base {
        log::warn!("base 0x0 is not a code address, using {base:?}");
    }

    let length = image.len();
    let target: Arc<dyn TargetVm> = Arc::new(ImageTarget {
        base,
        image,
        depth: Mutex::new(0),
    });
    let info = InspectorCreateInfo {
        isa: Some(cli.isa),
        ..Default::default()
    };
    let access = match CodeCacheAccess::new(target, info) {
        Ok(access) => access,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = access.update_cache(1) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
    let code = match access.register_external_code(base, Some(length), cli.file.clone()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };
    let snapshot = code.machine_code_info();

    if cli.summary {
        let instructions = snapshot.instructions();
        let branches = instructions
            .iter()
            .filter(|insn| insn.target_address.is_some())
            .count();
        let literals = instructions
            .iter()
            .filter(|insn| insn.literal_source_address.is_some())
            .count();
        println!("{} ({}) at {:?}", cli.file, cli.isa, snapshot.code_range());
        println!("instructions: {}", instructions.len());
        println!("labels: {}", snapshot.label_indexes().len());
        println!("branches: {branches}");
        println!("literal loads: {literals}");
        return;
    }

    for insn in snapshot.instructions() {
        print_instruction(insn);
    }
}
