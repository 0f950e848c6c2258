pub mod layout;
pub mod reloc;
pub mod staging;
pub mod symbols;
pub mod tap;

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::backend;
use crate::backend::codegen::{self, SectionCode};
use crate::error::{BuildError, Result};
use crate::ir::{self, Module};
use crate::passes::PassManager;
use layout::{AddressPlanner, Region, TargetAddress};
use staging::SectionAllocator;
use symbols::{Strength, SymbolResolver, SymbolState};
use tap::ObjectArchive;

/// Everything the caller decides up front. Addresses describe the target
/// program's address space, not this process's.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub target: String,
    pub code_base: u64,
    pub rodata_base: u64,
    pub data_base: u64,
    pub code_ceiling: Option<u64>,
    pub rodata_ceiling: Option<u64>,
    pub data_ceiling: Option<u64>,
    /// Strength given to every row of the pre-existing symbol table.
    pub table_strength: Strength,
    /// Where segment artifacts and archived objects land.
    pub out_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            target: backend::TARGET.to_string(),
            code_base: 0xa000,
            rodata_base: 0xb000,
            data_base: 0xc000,
            code_ceiling: None,
            rodata_ceiling: None,
            data_ceiling: None,
            table_strength: Strength::Strong,
            out_dir: PathBuf::from("."),
        }
    }
}

/// One build from module registration to artifact dump. Owns the address
/// planner, the section table and staging buffers, the symbol resolver,
/// and the object archive; nothing build-scoped lives outside it, so
/// independent sessions can coexist in one process.
pub struct BuildSession {
    module: Module,
    allocator: SectionAllocator,
    resolver: SymbolResolver,
    archive: ObjectArchive,
    table_strength: Strength,
    out_dir: PathBuf,
}

impl BuildSession {
    pub fn new(config: &BuildConfig) -> Result<Self> {
        if config.target != backend::TARGET {
            return Err(BuildError::UnsupportedTarget(config.target.clone()));
        }

        let mut planner =
            AddressPlanner::new(config.code_base, config.rodata_base, config.data_base);
        if let Some(ceiling) = config.code_ceiling {
            planner.set_ceiling(Region::Code, ceiling);
        }
        if let Some(ceiling) = config.rodata_ceiling {
            planner.set_ceiling(Region::ReadOnlyData, ceiling);
        }
        if let Some(ceiling) = config.data_ceiling {
            planner.set_ceiling(Region::MutableData, ceiling);
        }

        Ok(BuildSession {
            module: Module::default(),
            allocator: SectionAllocator::new(planner),
            resolver: SymbolResolver::new(),
            archive: ObjectArchive::new(&config.out_dir)?,
            table_strength: config.table_strength,
            out_dir: config.out_dir.clone(),
        })
    }

    /// Loads the caller's pre-existing symbol table from tabular text.
    pub fn add_existing_symbols(&mut self, text: &str) -> Result<usize> {
        self.resolver.load_table(text, self.table_strength)
    }

    pub fn add_existing_symbols_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path).map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded = self.add_existing_symbols(&text)?;
        info!(path = %path.display(), loaded, "loaded pre-existing symbols");
        Ok(loaded)
    }

    /// Merges a pre-linked static object verbatim: the whole file becomes
    /// one executable section named after the file stem, and the stem is
    /// registered as a defined symbol at the section's target address.
    pub fn add_static_blob(&mut self, path: &Path) -> Result<TargetAddress> {
        let bytes = fs::read(path).map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .and_then(OsStr::to_str)
            .ok_or_else(|| BuildError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file stem"),
            })?
            .to_string();

        self.archive.archive(&bytes)?;
        self.allocator.reserve(bytes.len(), 0, 0)?;
        self.allocator.allocate_code(bytes.len(), &name)?;
        self.allocator.section_bytes_mut(&name)?.copy_from_slice(&bytes);

        let target = self.section_target(&name)?;
        self.resolver.define_compiled(&name, target);
        info!(blob = %name, %target, size = bytes.len(), "merged static blob");
        Ok(target)
    }

    /// Parses, verifies, optimizes, and isolates one module, and logs its
    /// function names as the export worklist. Nothing is compiled yet;
    /// compilation happens on lookup.
    pub fn add_module(&mut self, source: &str) -> Result<()> {
        let mut module = ir::parser::parse(source)?;
        PassManager::default_pipeline().run(&mut module)?;

        for func in &module.functions {
            self.resolver.log_function(&func.name);
        }
        info!(
            functions = module.functions.len(),
            globals = module.globals.len(),
            "registered module"
        );
        self.module = module;
        Ok(())
    }

    /// Resolves one name to its target address, materializing it and its
    /// dependency closure first if the module defines it. Idempotent:
    /// a second lookup returns the cached address and compiles nothing.
    pub fn lookup(&mut self, name: &str) -> Result<TargetAddress> {
        match self.resolver.state(name) {
            Some(SymbolState::Compiled(address)) => return Ok(address),
            Some(SymbolState::PreExisting { address, strength }) => {
                if strength == Strength::Strong || !self.module.defines(name) {
                    debug!(name, %address, "resolved pre-existing");
                    return Ok(address);
                }
            }
            Some(SymbolState::Pending) => {
                return Err(BuildError::UnresolvedSymbol(name.to_string()));
            }
            None => (),
        }
        if !self.module.defines(name) {
            return Err(BuildError::UnresolvedSymbol(name.to_string()));
        }
        self.materialize(name)
    }

    /// Compiles `root` and everything it transitively needs as one object:
    /// encode, archive, reserve, place, then patch relocations against
    /// target addresses. The closure is complete before any patching, so
    /// resolution during patching never re-enters materialization.
    fn materialize(&mut self, root: &str) -> Result<TargetAddress> {
        let closure = self.closure(root);
        debug!(root, ?closure, "materializing");
        for name in &closure {
            self.resolver.mark_pending(name);
        }

        let mut functions: Vec<(String, String, SectionCode)> = vec![];
        let mut globals: Vec<(String, String, Vec<u8>, bool)> = vec![];
        for name in &closure {
            if let Some(func) = self.module.function(name) {
                let code = codegen::compile_function(func)?;
                let placement = func.placement.clone().ok_or_else(|| {
                    BuildError::Verify(format!("function {name:?} has no placement unit"))
                })?;
                functions.push((name.clone(), placement, code));
            } else if let Some(global) = self.module.global(name) {
                let placement = global.placement.clone().ok_or_else(|| {
                    BuildError::Verify(format!("global {name:?} has no placement unit"))
                })?;
                globals.push((name.clone(), placement, global.init.to_bytes(), global.read_only));
            }
        }

        let code_size: usize = functions.iter().map(|(_, _, c)| c.bytes.len()).sum();
        let rodata_size: usize = globals
            .iter()
            .filter(|(_, _, _, ro)| *ro)
            .map(|(_, _, b, _)| b.len())
            .sum();
        let data_size: usize = globals
            .iter()
            .filter(|(_, _, _, ro)| !*ro)
            .map(|(_, _, b, _)| b.len())
            .sum();

        // Raw pre-relocation object, for post-hoc inspection only.
        let mut raw = Vec::with_capacity(code_size + rodata_size + data_size);
        for (_, _, code) in &functions {
            raw.extend_from_slice(&code.bytes);
        }
        for (_, _, bytes, _) in &globals {
            raw.extend_from_slice(bytes);
        }
        self.archive.archive(&raw)?;

        self.allocator.reserve(code_size, rodata_size, data_size)?;
        for (name, placement, code) in &functions {
            self.allocator.allocate_code(code.bytes.len(), placement)?;
            self.allocator
                .section_bytes_mut(placement)?
                .copy_from_slice(&code.bytes);
            let target = self.section_target(placement)?;
            self.resolver.define_compiled(name, target);
        }
        for (name, placement, bytes, read_only) in &globals {
            self.allocator.allocate_data(bytes.len(), placement, *read_only)?;
            self.allocator.section_bytes_mut(placement)?.copy_from_slice(bytes);
            let target = self.section_target(placement)?;
            self.resolver.define_compiled(name, target);
        }

        let resolver = &self.resolver;
        for (_, placement, code) in &functions {
            if code.relocations.is_empty() {
                continue;
            }
            let target = match self.allocator.section(placement) {
                Some(alloc) => alloc.target,
                None => return Err(BuildError::UnresolvedSymbol(placement.clone())),
            };
            let bytes = self.allocator.section_bytes_mut(placement)?;
            reloc::apply(bytes, target, &code.relocations, |symbol| {
                resolver
                    .address(symbol)
                    .ok_or_else(|| BuildError::UnresolvedSymbol(symbol.to_string()))
            })?;
        }

        self.resolver
            .address(root)
            .ok_or_else(|| BuildError::UnresolvedSymbol(root.to_string()))
    }

    /// Module-defined names `root` transitively pulls in, minus names that
    /// already resolve terminally (compiled, or strong pre-existing).
    fn closure(&self, root: &str) -> Vec<String> {
        let mut ordered = vec![];
        let mut seen = HashSet::new();
        let mut stack = vec![root.to_string()];
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            match self.resolver.state(&name) {
                Some(SymbolState::Compiled(_))
                | Some(SymbolState::PreExisting {
                    strength: Strength::Strong,
                    ..
                }) => continue,
                _ => (),
            }
            if !self.module.defines(&name) {
                continue;
            }
            ordered.push(name.clone());
            if let Some(func) = self.module.function(&name) {
                for reference in func.references() {
                    stack.push(reference.to_string());
                }
            }
        }
        ordered
    }

    fn section_target(&self, name: &str) -> Result<TargetAddress> {
        self.allocator
            .section(name)
            .map(|alloc| alloc.target)
            .ok_or_else(|| BuildError::UnresolvedSymbol(name.to_string()))
    }

    /// Forces compilation of every logged function and returns the export
    /// table in log order.
    pub fn resolve_exports(&mut self) -> Result<Vec<(String, TargetAddress)>> {
        let names: Vec<String> = self.resolver.new_functions().to_vec();
        let mut exports = vec![];
        for name in names {
            let address = self.lookup(&name)?;
            exports.push((name, address));
        }
        Ok(exports)
    }

    /// Writes the symbol-export table: one `name,decimal_address` line per
    /// logged function.
    pub fn export_symbols(&mut self, path: &Path) -> Result<()> {
        let exports = self.resolve_exports()?;
        let mut table = String::new();
        for (name, address) in &exports {
            table.push_str(&format!("{},{}\n", name, address.get()));
        }
        fs::write(path, table).map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), symbols = exports.len(), "wrote export table");
        Ok(())
    }

    /// Dumps every object's staging buffers as raw segment artifacts.
    /// Code is always written; an empty data or rodata buffer is skipped
    /// with a diagnostic instead of producing a zero-byte file.
    pub fn dump_segments(&self) -> Result<Vec<PathBuf>> {
        let mut written = vec![];
        for (index, object) in self.allocator.objects().iter().enumerate() {
            for region in [Region::Code, Region::ReadOnlyData, Region::MutableData] {
                let bytes = object.region(region);
                if bytes.is_empty() && region != Region::Code {
                    info!(object = index, %region, "segment empty, skipping");
                    continue;
                }
                let path = self.out_dir.join(format!("{}_{index}", region.artifact_stem()));
                fs::write(&path, bytes).map_err(|source| BuildError::Io {
                    path: path.clone(),
                    source,
                })?;
                info!(path = %path.display(), size = bytes.len(), "dumped segment");
                written.push(path);
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(dir: &Path) -> BuildSession {
        let config = BuildConfig {
            out_dir: dir.to_path_buf(),
            ..BuildConfig::default()
        };
        BuildSession::new(&config).unwrap()
    }

    const MODULE: &str = r#"
rodata msg = "hi"
func g(x) {
    y = call h(x)
    p = addr msg
    r = add y, 1
    ret r
}
func h(x) {
    r = mul x, 2
    ret r
}
"#;

    #[test]
    fn test_unsupported_target_rejected() {
        let config = BuildConfig {
            target: "riscv64".to_string(),
            ..BuildConfig::default()
        };
        assert!(matches!(
            BuildSession::new(&config),
            Err(BuildError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn test_pre_existing_lookup_compiles_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_existing_symbols("memcpy,7f0000,100\n").unwrap();
        session.add_module("func f() {\n ret 0\n}\n").unwrap();

        assert_eq!(session.lookup("memcpy").unwrap(), TargetAddress(0x7f0000));
        assert!(session.allocator.objects().is_empty());
    }

    #[test]
    fn test_lookup_materializes_dependency_closure() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_module(MODULE).unwrap();

        let g = session.lookup("g").unwrap();
        assert_eq!(g, TargetAddress(0xa000));
        // One object holds g, h, and msg.
        assert_eq!(session.allocator.objects().len(), 1);
        assert!(session.allocator.section(".text.h").is_some());
        assert!(session.allocator.section(".rodata.msg").is_some());

        // Cached; no second object.
        let h = session.lookup("h").unwrap();
        assert_eq!(session.lookup("h").unwrap(), h);
        assert_eq!(session.lookup("g").unwrap(), g);
        assert_eq!(session.allocator.objects().len(), 1);
    }

    #[test]
    fn test_call_patched_with_target_relative_displacement() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_module(MODULE).unwrap();
        session.lookup("g").unwrap();

        let g = session.allocator.section(".text.g").unwrap().clone();
        let h = session.allocator.section(".text.h").unwrap().clone();
        let object = &session.allocator.objects()[g.object];
        let code = object.region(Region::Code);
        let body = &code[g.local.get()..g.local.get() + g.size];

        // Exactly one call; its rel32 lands on h's target address.
        let field = body.iter().position(|&b| b == 0xE8).unwrap() + 1;
        let disp = i32::from_le_bytes(body[field..field + 4].try_into().unwrap());
        let next = g.target.get() + field as u64 + 4;
        assert_eq!(next.wrapping_add(disp as i64 as u64), h.target.get());
    }

    #[test]
    fn test_addr_patched_with_absolute_target_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_module(MODULE).unwrap();
        session.lookup("g").unwrap();

        let g = session.allocator.section(".text.g").unwrap().clone();
        let msg = session.allocator.section(".rodata.msg").unwrap().clone();
        let object = &session.allocator.objects()[g.object];
        let code = object.region(Region::Code);
        let body = &code[g.local.get()..g.local.get() + g.size];

        let needle = msg.target.get().to_le_bytes();
        assert!(body.windows(8).any(|w| w == needle));
    }

    #[test]
    fn test_strong_pre_existing_shadows_module_definition() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_existing_symbols("f,7f0000,10\n").unwrap();
        session.add_module("func f() {\n ret 0\n}\n").unwrap();

        assert_eq!(session.lookup("f").unwrap(), TargetAddress(0x7f0000));
        assert!(session.allocator.section(".text.f").is_none());
    }

    #[test]
    fn test_weak_pre_existing_shadowed_by_module_definition() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            table_strength: Strength::Weak,
            out_dir: dir.path().to_path_buf(),
            ..BuildConfig::default()
        };
        let mut session = BuildSession::new(&config).unwrap();
        session.add_existing_symbols("f,7f0000,10\n").unwrap();
        session.add_module("func f() {\n ret 0\n}\n").unwrap();

        assert_eq!(session.lookup("f").unwrap(), TargetAddress(0xa000));
    }

    #[test]
    fn test_unisolated_function_never_allocates() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        // Bypass add_module so the isolation pass never runs.
        session.module = ir::parser::parse("func f() {\n ret 0\n}\n").unwrap();

        assert!(session.lookup("f").is_err());
        assert!(session.allocator.section("f").is_none());
        assert!(session.allocator.section("").is_none());
    }

    #[test]
    fn test_unresolved_lookup_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_module("func f() {\n ret 0\n}\n").unwrap();
        assert!(matches!(
            session.lookup("nope"),
            Err(BuildError::UnresolvedSymbol(_))
        ));
    }

    #[test]
    fn test_static_blob_placed_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("helpers.bin");
        fs::write(&blob, [0x90, 0x90, 0xC3]).unwrap();

        let mut session = session(dir.path());
        let target = session.add_static_blob(&blob).unwrap();
        assert_eq!(target, TargetAddress(0xa000));
        assert_eq!(session.lookup("helpers").unwrap(), target);

        let object = &session.allocator.objects()[0];
        assert_eq!(object.region(Region::Code), &[0x90, 0x90, 0xC3]);
        assert_eq!(
            fs::read(dir.path().join("object_0.bin")).unwrap(),
            [0x90, 0x90, 0xC3]
        );
    }

    #[test]
    fn test_code_ceiling_aborts_build() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            code_ceiling: Some(0xa004),
            out_dir: dir.path().to_path_buf(),
            ..BuildConfig::default()
        };
        let mut session = BuildSession::new(&config).unwrap();
        session.add_module("func f() {\n ret 0\n}\n").unwrap();
        assert!(matches!(
            session.lookup("f"),
            Err(BuildError::RegionExhausted { .. })
        ));
    }

    #[test]
    fn test_dump_skips_empty_data_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_module("func f() {\n ret 0\n}\n").unwrap();
        session.lookup("f").unwrap();

        let written = session.dump_segments().unwrap();
        assert_eq!(written, vec![dir.path().join("code_0")]);
        assert!(!dir.path().join("rodata_0").exists());
        assert!(!dir.path().join("data_0").exists());
    }

    #[test]
    fn test_dump_round_trips_staging_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_module(MODULE).unwrap();
        session.lookup("g").unwrap();
        session.dump_segments().unwrap();

        let object = &session.allocator.objects()[0];
        assert_eq!(
            fs::read(dir.path().join("code_0")).unwrap(),
            object.region(Region::Code)
        );
        assert_eq!(fs::read(dir.path().join("rodata_0")).unwrap(), b"hi");
    }

    #[test]
    fn test_export_table_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        session.add_module(MODULE).unwrap();

        let path = dir.path().join("exports.csv");
        session.export_symbols(&path).unwrap();
        let table = fs::read_to_string(&path).unwrap();

        let g = session.lookup("g").unwrap().get();
        let h = session.lookup("h").unwrap().get();
        assert_eq!(table, format!("g,{g}\nh,{h}\n"));
    }
}
