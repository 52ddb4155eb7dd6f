//! Entry point for the forked worker process.
//!
//! A worker is a long-lived child of the scheduler. It announces readiness,
//! then serves compile requests one line at a time from stdin, writing one
//! tagged response line per request to stdout. Logging goes to stderr so the
//! protocol channel stays clean. The parent kills the process when its
//! execution context is evicted or dropped.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::compile::adapter::{CompilerLauncher, SEARCH_PATH_ENV, ScriptCompiler};
use crate::compile::archive;
use crate::context::proto::{WorkerRequest, WorkerResponse};
use crate::error::ScriptError;
use crate::helpers;

/// Serve requests until stdin closes.
pub fn run(compiler_path: PathBuf) -> Result<()> {
    let search_path = std::env::var_os(SEARCH_PATH_ENV)
        .map(|value| helpers::split_search_path(&value))
        .unwrap_or_default();
    let compiler = CompilerLauncher::new(compiler_path, &search_path)
        .context("Failed to configure the compiler launcher")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    respond(
        &mut out,
        &WorkerResponse::Ready {
            pid: std::process::id(),
        },
    )?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => {
                log::debug!("worker compiling {}", request.identity);
                match handle(&compiler, &request) {
                    Ok(()) => WorkerResponse::Ok {
                        destination_path: request.destination_path,
                    },
                    Err(err) => WorkerResponse::from_script_error(&err),
                }
            }
            Err(err) => WorkerResponse::IoError {
                message: format!("malformed request line: {err}"),
            },
        };
        respond(&mut out, &response)?;
    }
    Ok(())
}

fn handle(compiler: &CompilerLauncher, request: &WorkerRequest) -> Result<(), ScriptError> {
    let source = std::fs::read_to_string(&request.source_path)?;
    let module = compiler.compile(&request.identity, &source, &request.runtime_classpath)?;
    archive::write_archive(&module, &request.destination_path)
}

fn respond(out: &mut impl Write, response: &WorkerResponse) -> Result<()> {
    let line = serde_json::to_string(response).context("Failed to encode response")?;
    writeln!(out, "{line}").context("Failed to write response")?;
    out.flush().context("Failed to flush response")?;
    Ok(())
}
