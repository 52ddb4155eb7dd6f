//! Wire protocol between the scheduler and forked worker processes.
//!
//! Newline-delimited JSON over the worker's stdin/stdout: one request line
//! in, one tagged response line out. The worker announces itself with a
//! `ready` line before accepting requests. The types here (together with
//! [`ScriptIdentity`]) form the bridge set that must deserialize to the same
//! definitions on both sides of the isolation boundary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::batch::ScriptIdentity;
use crate::error::ScriptError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub identity: ScriptIdentity,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub runtime_classpath: Vec<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum WorkerResponse {
    #[serde(rename_all = "camelCase")]
    Ready { pid: u32 },
    #[serde(rename_all = "camelCase")]
    Ok { destination_path: PathBuf },
    #[serde(rename_all = "camelCase")]
    CompileError {
        identity: ScriptIdentity,
        diagnostics: String,
    },
    #[serde(rename_all = "camelCase")]
    UnsupportedResult { kind: String },
    #[serde(rename_all = "camelCase")]
    UnsupportedModule { container: String },
    #[serde(rename_all = "camelCase")]
    IoError { message: String },
}

impl WorkerResponse {
    pub fn from_script_error(err: &ScriptError) -> Self {
        match err {
            ScriptError::Compile {
                script,
                diagnostics,
            } => WorkerResponse::CompileError {
                identity: script.clone(),
                diagnostics: diagnostics.clone(),
            },
            ScriptError::UnsupportedResult { kind } => WorkerResponse::UnsupportedResult {
                kind: kind.clone(),
            },
            ScriptError::UnsupportedModule { container } => WorkerResponse::UnsupportedModule {
                container: container.clone(),
            },
            ScriptError::Io(e) => WorkerResponse::IoError {
                message: e.to_string(),
            },
            ScriptError::Worker(message) => WorkerResponse::IoError {
                message: message.clone(),
            },
        }
    }

    /// Map a settled response back into the per-script result. `Ready` is
    /// not a settlement and is handled by the caller.
    pub fn into_script_result(self) -> Result<(), ScriptError> {
        match self {
            WorkerResponse::Ready { pid } => Err(ScriptError::Worker(format!(
                "unexpected ready handshake from pid {pid}"
            ))),
            WorkerResponse::Ok { .. } => Ok(()),
            WorkerResponse::CompileError {
                identity,
                diagnostics,
            } => Err(ScriptError::Compile {
                script: identity,
                diagnostics,
            }),
            WorkerResponse::UnsupportedResult { kind } => {
                Err(ScriptError::UnsupportedResult { kind })
            }
            WorkerResponse::UnsupportedModule { container } => {
                Err(ScriptError::UnsupportedModule { container })
            }
            WorkerResponse::IoError { message } => Err(ScriptError::Worker(message)),
        }
    }
}
