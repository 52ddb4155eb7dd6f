//! In-memory result of one script compilation, as handed from the compiler
//! adapter to the artifact packager.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// A compiled script module. Produced by the compiler adapter, consumed
/// immediately by the packager, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    /// Fully qualified entry-class name, derived from the script identity.
    pub entry_class: String,
    pub binaries: ModuleBinaries,
    pub metadata: ScriptMetadata,
}

/// Container for the module's emitted binary units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleBinaries {
    /// Units held in memory, keyed by archive path. The only container the
    /// packager accepts; the map keeps unit order stable.
    InMemory(BTreeMap<String, Vec<u8>>),
    /// Units the compiler left on disk. Passed through so the packager can
    /// reject it explicitly instead of mis-packaging.
    External { location: PathBuf, units: Vec<String> },
}

impl ModuleBinaries {
    pub fn container_name(&self) -> &'static str {
        match self {
            ModuleBinaries::InMemory(_) => "inMemory",
            ModuleBinaries::External { .. } => "external",
        }
    }
}

/// Everything the compiler reports about a module.
///
/// Only a subset of these fields survives packaging: imports, the dependency
/// list and the source-debug marker exist purely for compile-time
/// bookkeeping and would dominate artifact size across thousands of scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    pub engine_version: String,
    pub imports: Vec<String>,
    pub dependencies: Vec<String>,
    pub source_debug_info: Option<String>,
    /// Options the loader needs to reconstruct a runnable script instance.
    pub loader_options: BTreeMap<String, String>,
}
