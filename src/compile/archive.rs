//! Serializes a compiled module into its loadable archive.
//!
//! The archive is a zip with a fixed entry order: the manifest naming the
//! entry class as the runnable main, a minimized metadata descriptor at a
//! path derived from the entry-class name, then one entry per binary unit
//! sorted by archive path. Output bytes are a pure function of the module:
//! timestamps are pinned and the descriptor is an explicit, versioned schema
//! rather than a dump of compiler state, so build-output caching can rely on
//! byte-identical archives.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::compile::module::{CompiledModule, ModuleBinaries};
use crate::error::ScriptError;

/// Version of the descriptor schema written into every archive.
pub const DESCRIPTOR_SCHEMA_VERSION: u32 = 1;

const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// The minimized metadata blob a loader needs to reconstruct a runnable
/// script instance. Compile-time bookkeeping (imports, dependency lists,
/// source-debug markers) is not part of the schema and therefore never
/// reaches the archive.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub schema_version: u32,
    pub entry_class: String,
    pub engine_version: String,
    pub loader_options: BTreeMap<String, String>,
}

/// Archive path of the metadata descriptor for an entry class.
pub fn descriptor_path(entry_class: &str) -> String {
    format!("META-INF/script/{entry_class}.json")
}

/// Write `module` as an archive at `destination`.
///
/// The caller guarantees the destination's parent directory exists. The
/// archive is staged in a temporary file next to the destination and
/// persisted atomically, so an interrupted worker never leaves a truncated
/// artifact behind.
pub fn write_archive(module: &CompiledModule, destination: &Path) -> Result<(), ScriptError> {
    let units = match &module.binaries {
        ModuleBinaries::InMemory(units) => units,
        other => {
            return Err(ScriptError::UnsupportedModule {
                container: other.container_name().to_string(),
            });
        }
    };

    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::NamedTempFile::new_in(parent)?;
    let mut zip = ZipWriter::new(staging);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    zip.start_file(MANIFEST_PATH, options)
        .map_err(zip_io_error)?;
    zip.write_all(manifest_text(&module.entry_class).as_bytes())?;

    let descriptor = ArtifactDescriptor {
        schema_version: DESCRIPTOR_SCHEMA_VERSION,
        entry_class: module.entry_class.clone(),
        engine_version: module.metadata.engine_version.clone(),
        loader_options: module.metadata.loader_options.clone(),
    };
    zip.start_file(descriptor_path(&module.entry_class), options)
        .map_err(zip_io_error)?;
    zip.write_all(&serde_json::to_vec(&descriptor).map_err(std::io::Error::from)?)?;

    // BTreeMap iteration keeps unit order stable across runs.
    for (path, bytes) in units {
        zip.start_file(path.as_str(), options).map_err(zip_io_error)?;
        zip.write_all(bytes)?;
    }

    let staging = zip.finish().map_err(zip_io_error)?;
    staging
        .persist(destination)
        .map_err(|e| ScriptError::Io(e.error))?;
    Ok(())
}

fn manifest_text(entry_class: &str) -> String {
    format!(
        "Manifest-Version: 1.0\r\nCreated-By: scriptpack {}\r\nMain-Class: {}\r\n",
        env!("CARGO_PKG_VERSION"),
        entry_class
    )
}

fn zip_io_error(err: zip::result::ZipError) -> ScriptError {
    ScriptError::Io(std::io::Error::other(err))
}
