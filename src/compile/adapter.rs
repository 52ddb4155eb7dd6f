//! Adapter around the external script compiler.
//!
//! `CompilerLauncher` turns one script's source text into a
//! [`CompiledModule`] by invoking the compiler executable resolved from the
//! compiler classpath. Invocation contract:
//!
//! ```text
//! <compiler> --entry <class> --out-dir <dir> --class-path <joined runtime closure> <source>
//! ```
//!
//! with the isolated library search path exported in the
//! `SCRIPTPACK_COMPILER_PATH` environment variable. On success the compiler
//! writes its binary units plus a `module.json` result manifest into the
//! output directory; the adapter loads both into memory and deletes the
//! scratch directory. No other filesystem state is touched.
//!
//! Every invocation rebuilds its arguments from the supplied runtime
//! closure. Nothing is carried over between invocations, so a classpath from
//! one compilation can never leak into the next.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::batch::ScriptIdentity;
use crate::compile::module::{CompiledModule, ModuleBinaries, ScriptMetadata};
use crate::error::ScriptError;
use crate::helpers;

/// Environment variable carrying the isolated compiler search path.
pub const SEARCH_PATH_ENV: &str = "SCRIPTPACK_COMPILER_PATH";

/// Result manifest filename the compiler writes into its output directory.
const RESULT_MANIFEST: &str = "module.json";

/// Result kind for modules whose units are in the output directory and get
/// loaded into memory.
const KIND_IN_MEMORY: &str = "inMemoryModule";
/// Result kind for modules whose units stay wherever the compiler put them.
const KIND_EXTERNAL: &str = "externalModule";

/// Compiles one script's source text into a module.
pub trait ScriptCompiler: Send + Sync {
    fn compile(
        &self,
        identity: &ScriptIdentity,
        source: &str,
        runtime_closure: &[PathBuf],
    ) -> Result<CompiledModule, ScriptError>;
}

/// Invokes the external compiler executable.
pub struct CompilerLauncher {
    executable: PathBuf,
    search_path: OsString,
}

impl CompilerLauncher {
    pub fn new(executable: PathBuf, search_path: &[PathBuf]) -> std::io::Result<Self> {
        Ok(Self {
            executable,
            search_path: helpers::join_search_path(search_path)?,
        })
    }
}

impl ScriptCompiler for CompilerLauncher {
    fn compile(
        &self,
        identity: &ScriptIdentity,
        source: &str,
        runtime_closure: &[PathBuf],
    ) -> Result<CompiledModule, ScriptError> {
        let scratch = tempfile::tempdir()?;
        let source_path = scratch.path().join(format!("{}.scr", identity.name));
        fs::write(&source_path, source)?;
        let out_dir = scratch.path().join("out");
        fs::create_dir_all(&out_dir)?;

        let class_path = helpers::join_search_path(runtime_closure)?;
        log::debug!("compiling {identity} with {}", self.executable.display());

        let output = Command::new(&self.executable)
            .arg("--entry")
            .arg(identity.entry_class())
            .arg("--out-dir")
            .arg(&out_dir)
            .arg("--class-path")
            .arg(&class_path)
            .arg(&source_path)
            .env(SEARCH_PATH_ENV, &self.search_path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(ScriptError::Compile {
                script: identity.clone(),
                diagnostics: stderr.to_string() + &stdout,
            });
        }

        read_result(&out_dir, identity)
    }
}

#[derive(Debug, Deserialize)]
struct ResultHeader {
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompilerResult {
    entry_class: String,
    units: Vec<UnitEntry>,
    metadata: RawMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitEntry {
    /// Archive path of the unit inside the packaged artifact.
    path: String,
    /// Filename of the unit inside the compiler's output directory.
    file: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    #[serde(default)]
    engine_version: String,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    source_debug_info: Option<String>,
    #[serde(default)]
    loader_options: BTreeMap<String, String>,
}

fn read_result(out_dir: &Path, identity: &ScriptIdentity) -> Result<CompiledModule, ScriptError> {
    let manifest_path = out_dir.join(RESULT_MANIFEST);
    let data = fs::read_to_string(&manifest_path)?;

    // The kind gate comes first: an unknown result variant must be rejected,
    // not packaged on a guess.
    let header: ResultHeader =
        serde_json::from_str(&data).map_err(|e| ScriptError::UnsupportedResult {
            kind: format!("unparseable result manifest: {e}"),
        })?;
    if header.kind != KIND_IN_MEMORY && header.kind != KIND_EXTERNAL {
        return Err(ScriptError::UnsupportedResult { kind: header.kind });
    }

    let result: CompilerResult =
        serde_json::from_str(&data).map_err(|e| ScriptError::UnsupportedResult {
            kind: format!("malformed `{}` result: {e}", header.kind),
        })?;

    let binaries = if header.kind == KIND_EXTERNAL {
        ModuleBinaries::External {
            location: out_dir.to_path_buf(),
            units: result.units.into_iter().map(|u| u.path).collect(),
        }
    } else {
        let mut units = BTreeMap::new();
        for unit in result.units {
            let bytes = fs::read(out_dir.join(&unit.file))?;
            units.insert(unit.path, bytes);
        }
        ModuleBinaries::InMemory(units)
    };

    log::debug!(
        "compiled {identity}: entry class {}, {} unit(s)",
        result.entry_class,
        match &binaries {
            ModuleBinaries::InMemory(units) => units.len(),
            ModuleBinaries::External { units, .. } => units.len(),
        }
    );

    Ok(CompiledModule {
        entry_class: result.entry_class,
        binaries,
        metadata: ScriptMetadata {
            engine_version: result.metadata.engine_version,
            imports: result.metadata.imports,
            dependencies: result.metadata.dependencies,
            source_debug_info: result.metadata.source_debug_info,
            loader_options: result.metadata.loader_options,
        },
    })
}
