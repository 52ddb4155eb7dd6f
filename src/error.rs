//! Error taxonomy for batch compilation.
//!
//! Per-script failures (`ScriptError`) are collected and reported per
//! identity without aborting sibling compilations. Batch-level failures
//! (`BatchError`) abort the whole run: without an execution context no unit
//! can make progress.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::batch::ScriptIdentity;

/// Failure of a single script's compile or package step.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The compiler rejected the source. Diagnostics are kept verbatim so
    /// callers can surface source-accurate error locations.
    #[error("compilation of {script} failed:\n{diagnostics}")]
    Compile {
        script: ScriptIdentity,
        diagnostics: String,
    },

    /// The compiler produced a result shape this adapter does not know how
    /// to package.
    #[error("unsupported compiler result kind `{kind}`")]
    UnsupportedResult { kind: String },

    /// The compiled module's binary-unit container is not the expected
    /// in-memory shape.
    #[error("unsupported module container `{container}`")]
    UnsupportedModule { container: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A forked worker process died or broke protocol mid-request.
    #[error("worker failure: {0}")]
    Worker(String),
}

/// Failure to create or hand out an execution context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("compiler executable `{name}` not found in the compiler classpath")]
    CompilerNotFound { name: String },

    #[error("could not read compiler classpath entry {path}")]
    ClosureUnreadable { path: String },

    #[error("failed to launch worker process: {0}")]
    Spawn(String),

    #[error("worker process did not complete its startup handshake: {0}")]
    Handshake(String),
}

/// Batch-fatal failure: no per-script results are available.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    ContextCreation(#[from] ContextError),

    #[error("duplicate script identity `{0}` in batch")]
    DuplicateIdentity(ScriptIdentity),

    #[error("batch timed out after {timeout:?} with no completed units")]
    Stalled { timeout: Duration },
}
