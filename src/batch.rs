//! Batch input model: script identities, compilation requests and the
//! dependency closures they compile against.
//!
//! A batch manifest is the boundary with the surrounding build tool. It
//! names a script pack, lists the scripts to compile with their source and
//! destination paths, and carries the two resolved classpath closures: the
//! libraries the compiler itself needs, and the libraries compiled scripts
//! may reference at load time.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::config::CompileSettings;

/// Stable identity of one script: pack namespace plus local name.
///
/// The dotted form is the compiled module's entry-class name and the stem of
/// the metadata entry inside the packaged archive. Instances cross the
/// worker-process pipe, which is why this type (together with the request it
/// is embedded in) belongs to the bridge set the isolation boundary never
/// intercepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptIdentity {
    pub namespace: String,
    pub name: String,
}

impl ScriptIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Dotted entry-class name, e.g. `pack.a`.
    pub fn entry_class(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for ScriptIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// One script to compile. Consumed exactly once per scheduler run unless
/// elided by change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationRequest {
    pub identity: ScriptIdentity,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Change signal supplied by the caller's build graph. `None` means no
    /// signal is available and the script is treated as changed.
    #[serde(default)]
    pub changed: Option<bool>,
}

/// The two disjoint classpath closures of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyClosure {
    /// Libraries the compiler itself needs to run, including the compiler
    /// executable. Bound to an execution context at creation time.
    pub compiler: Vec<PathBuf>,
    /// Libraries a compiled script may reference at load time. Passed to
    /// every compiler invocation, never cached between invocations.
    pub runtime: Vec<PathBuf>,
}

/// A full compilation batch as handed over by the build tool.
#[derive(Debug, Clone)]
pub struct Batch {
    pub namespace: String,
    pub requests: Vec<CompilationRequest>,
    pub closure: DependencyClosure,
    /// The ambient library search path of the calling process. Names the
    /// boundary policy defers on are resolved against these paths.
    pub ambient: Vec<PathBuf>,
    pub settings: CompileSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchManifest {
    namespace: String,
    scripts: Vec<ScriptEntry>,
    compiler_classpath: Vec<PathBuf>,
    runtime_classpath: Vec<PathBuf>,
    #[serde(default)]
    ambient_classpath: Vec<PathBuf>,
    #[serde(default)]
    settings: CompileSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptEntry {
    name: String,
    source: PathBuf,
    output: PathBuf,
    #[serde(default)]
    changed: Option<bool>,
}

impl Batch {
    /// Read a batch manifest from disk. Relative paths are resolved against
    /// the manifest's parent directory.
    pub fn from_manifest(path: &Path) -> Result<Batch> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch manifest at {}", path.display()))?;
        let manifest: BatchManifest = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse batch manifest at {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        validate_segment(&manifest.namespace, "namespace")?;

        let requests = manifest
            .scripts
            .into_iter()
            .map(|entry| {
                validate_segment(&entry.name, "script name")?;
                Ok(CompilationRequest {
                    identity: ScriptIdentity::new(&manifest.namespace, &entry.name),
                    source: resolve(base, entry.source),
                    destination: resolve(base, entry.output),
                    changed: entry.changed,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Batch {
            namespace: manifest.namespace,
            requests,
            closure: DependencyClosure {
                compiler: resolve_all(base, manifest.compiler_classpath),
                runtime: resolve_all(base, manifest.runtime_classpath),
            },
            ambient: resolve_all(base, manifest.ambient_classpath),
            settings: manifest.settings,
        })
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() { path } else { base.join(path) }
}

fn resolve_all(base: &Path, paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.into_iter().map(|p| resolve(base, p)).collect()
}

fn validate_segment(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow!("Batch manifest has an empty {what}"));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == '\\')
    {
        return Err(anyhow!(
            "Batch manifest {what} `{value}` contains path separators or whitespace"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_manifest_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("batch.json");
        fs::write(
            &manifest,
            r#"{
                "namespace": "pack",
                "scripts": [
                    { "name": "a", "source": "scripts/a.scr", "output": "out/a.jar" },
                    { "name": "b", "source": "scripts/b.scr", "output": "out/b.jar", "changed": false }
                ],
                "compilerClasspath": ["libs/script-compiler"],
                "runtimeClasspath": ["libs/runtime-core-1.0.lib"],
                "settings": { "isolation": "in-process", "timeoutSecs": 10 }
            }"#,
        )
        .unwrap();

        let batch = Batch::from_manifest(&manifest).unwrap();
        assert_eq!(batch.namespace, "pack");
        assert_eq!(batch.requests.len(), 2);
        assert_eq!(batch.requests[0].identity.entry_class(), "pack.a");
        assert_eq!(batch.requests[0].source, dir.path().join("scripts/a.scr"));
        assert_eq!(batch.requests[1].changed, Some(false));
        assert_eq!(
            batch.closure.compiler,
            vec![dir.path().join("libs/script-compiler")]
        );
        assert_eq!(batch.settings.timeout_secs, 10);
    }

    #[test]
    fn rejects_namespace_with_separators() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("batch.json");
        fs::write(
            &manifest,
            r#"{
                "namespace": "pack/evil",
                "scripts": [],
                "compilerClasspath": [],
                "runtimeClasspath": []
            }"#,
        )
        .unwrap();

        let err = Batch::from_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("namespace"));
    }

    #[test]
    fn identity_display_matches_entry_class() {
        let id = ScriptIdentity::new("pack", "a");
        assert_eq!(id.to_string(), "pack.a");
        assert_eq!(id.entry_class(), "pack.a");
    }
}
