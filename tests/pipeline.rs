//! End-to-end runs of the `scriptpack` binary against a stand-in compiler
//! executable, covering both isolation modes.

#![cfg(unix)]

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

fn scriptpack() -> Command {
    Command::new(env!("CARGO_BIN_EXE_scriptpack"))
}

/// A stand-in compiler: fails on a marker token, otherwise emits one binary
/// unit and an in-memory result manifest.
fn write_stub_compiler(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("script-compiler");
    let script = r#"#!/bin/sh
entry=""; out=""; cp=""
while [ "$#" -gt 1 ]; do
  case "$1" in
    --entry) entry="$2"; shift 2 ;;
    --out-dir) out="$2"; shift 2 ;;
    --class-path) cp="$2"; shift 2 ;;
    *) shift ;;
  esac
done
src="$1"
if grep -q "this is not valid" "$src"; then
  echo "$src:1:1: error: unexpected token" >&2
  exit 1
fi
mkdir -p "$out"
printf 'unit-bytes' > "$out/u0.bin"
cat > "$out/module.json" <<EOF
{"kind":"inMemoryModule","entryClass":"$entry","units":[{"path":"classes/$entry.bin","file":"u0.bin"}],"metadata":{"engineVersion":"1.0.0","imports":[],"dependencies":["$cp"],"loaderOptions":{}}}
EOF
"#;
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_project(dir: &Path, isolation: &str) -> PathBuf {
    let libs = dir.join("libs");
    let scripts = dir.join("scripts");
    let out = dir.join("out");
    fs::create_dir_all(&libs).unwrap();
    fs::create_dir_all(&scripts).unwrap();
    fs::create_dir_all(&out).unwrap();

    write_stub_compiler(&libs);
    fs::write(libs.join("runtime-core-1.0.lib"), "runtime").unwrap();
    fs::write(scripts.join("a.scr"), "val x = 1 + 1").unwrap();
    fs::write(scripts.join("b.scr"), "this is not valid").unwrap();

    let manifest = dir.join("batch.json");
    fs::write(
        &manifest,
        format!(
            r#"{{
                "namespace": "pack",
                "scripts": [
                    {{ "name": "a", "source": "scripts/a.scr", "output": "out/a.jar" }},
                    {{ "name": "b", "source": "scripts/b.scr", "output": "out/b.jar" }}
                ],
                "compilerClasspath": ["libs/script-compiler"],
                "runtimeClasspath": ["libs/runtime-core-1.0.lib"],
                "settings": {{
                    "isolation": "{isolation}",
                    "maxHeap": "2G",
                    "workers": 2,
                    "timeoutSecs": 5
                }}
            }}"#
        ),
    )
    .unwrap();
    manifest
}

fn read_manifest_entry(archive_path: &Path) -> String {
    let file = fs::File::open(archive_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name("META-INF/MANIFEST.MF").unwrap();
    let mut text = String::new();
    entry.read_to_string(&mut text).unwrap();
    text
}

fn run_batch(isolation: &str) {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_project(dir.path(), isolation);

    let output = scriptpack()
        .arg("build")
        .arg("--manifest")
        .arg(&manifest)
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    // One of two scripts failed, so the run reports failure overall.
    assert!(!output.status.success());
    assert!(stdout.contains("pack.b"), "stdout was: {stdout}");
    assert!(stdout.contains("unexpected token"), "stdout was: {stdout}");

    let good = dir.path().join("out/a.jar");
    assert!(good.exists());
    assert!(!dir.path().join("out/b.jar").exists());
    let manifest_text = read_manifest_entry(&good);
    assert!(manifest_text.contains("Main-Class: pack.a"));
}

#[test]
fn in_process_batch_writes_good_artifacts_and_reports_failures() {
    run_batch("in-process");
}

#[test]
fn forked_batch_writes_good_artifacts_and_reports_failures() {
    run_batch("forked");
}

#[test]
fn unchanged_scripts_are_skipped_and_successful_runs_exit_zero() {
    let dir = tempfile::tempdir().unwrap();
    let libs = dir.path().join("libs");
    let out = dir.path().join("out");
    fs::create_dir_all(&libs).unwrap();
    fs::create_dir_all(&out).unwrap();
    write_stub_compiler(&libs);
    fs::write(dir.path().join("a.scr"), "val x = 1").unwrap();
    fs::write(dir.path().join("b.scr"), "val y = 2").unwrap();

    let manifest = dir.path().join("batch.json");
    fs::write(
        &manifest,
        r#"{
            "namespace": "pack",
            "scripts": [
                { "name": "a", "source": "a.scr", "output": "out/a.jar" },
                { "name": "b", "source": "b.scr", "output": "out/b.jar", "changed": false }
            ],
            "compilerClasspath": ["libs/script-compiler"],
            "runtimeClasspath": [],
            "settings": { "isolation": "in-process", "timeoutSecs": 5 }
        }"#,
    )
    .unwrap();

    let output = scriptpack()
        .arg("build")
        .arg("--manifest")
        .arg(&manifest)
        .output()
        .unwrap();

    assert!(output.status.success());
    assert!(dir.path().join("out/a.jar").exists());
    assert!(!dir.path().join("out/b.jar").exists());

    // A forced rerun compiles the unchanged script too.
    let output = scriptpack()
        .arg("build")
        .arg("--manifest")
        .arg(&manifest)
        .arg("--force")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(dir.path().join("out/b.jar").exists());
}
