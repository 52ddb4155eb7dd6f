//! Execution contexts and the pool that reuses them across batches.
//!
//! A context is the environment one batch's compilations run in: either a
//! boundary-scoped compiler launcher inside the calling process, or a set of
//! long-lived forked worker processes with their own heap limit. Contexts
//! are cached keyed by a content fingerprint of the compiler closure, so a
//! pack that resolves different compiler versions gets a fresh context
//! instead of a stale compiler.

pub mod proto;

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use rayon::prelude::*;

use crate::batch::{CompilationRequest, DependencyClosure};
use crate::boundary::ResolutionBoundary;
use crate::compile::adapter::{CompilerLauncher, SEARCH_PATH_ENV, ScriptCompiler};
use crate::compile::archive;
use crate::config::{CompileSettings, IsolationMode};
use crate::context::proto::{WorkerRequest, WorkerResponse};
use crate::error::{ContextError, ScriptError};

/// Well-known library name of the compiler executable inside the compiler
/// classpath.
pub const COMPILER_PROGRAM: &str = "script-compiler";

/// How long an unused context stays cached before eviction.
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

/// The environment one compilation executes in. Shared read-only across
/// scheduler workers.
pub enum ExecutionContext {
    InProcess(InProcessContext),
    Forked(ForkedContext),
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionContext::InProcess(_) => write!(f, "ExecutionContext::InProcess"),
            ExecutionContext::Forked(_) => write!(f, "ExecutionContext::Forked"),
        }
    }
}

impl ExecutionContext {
    /// Run one request's compile-then-package pipeline to completion.
    pub fn execute(&self, request: &CompilationRequest, runtime: &[PathBuf]) -> Result<(), ScriptError> {
        match self {
            ExecutionContext::InProcess(ctx) => ctx.execute(request, runtime),
            ExecutionContext::Forked(ctx) => ctx.execute(request, runtime),
        }
    }

    /// Build an in-process context around an arbitrary compiler. Used by
    /// tests to substitute the external executable.
    pub fn with_compiler(compiler: Arc<dyn ScriptCompiler>) -> Self {
        ExecutionContext::InProcess(InProcessContext { compiler })
    }
}

pub struct InProcessContext {
    compiler: Arc<dyn ScriptCompiler>,
}

impl InProcessContext {
    fn execute(&self, request: &CompilationRequest, runtime: &[PathBuf]) -> Result<(), ScriptError> {
        let source = std::fs::read_to_string(&request.source)?;
        let module = self.compiler.compile(&request.identity, &source, runtime)?;
        archive::write_archive(&module, &request.destination)
    }
}

/// A fixed set of long-lived worker processes. Requests are serialized per
/// worker; the set as a whole provides parallelism.
pub struct ForkedContext {
    workers: Vec<Mutex<WorkerProcess>>,
    cursor: AtomicUsize,
}

impl ForkedContext {
    fn execute(&self, request: &CompilationRequest, runtime: &[PathBuf]) -> Result<(), ScriptError> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let mut worker = lock_unpoisoned(&self.workers[index]);
        worker.call(&WorkerRequest {
            identity: request.identity.clone(),
            source_path: request.source.clone(),
            destination_path: request.destination.clone(),
            runtime_classpath: runtime.to_vec(),
        })
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    fn spawn(
        program: &std::path::Path,
        compiler: &std::path::Path,
        search_path: &[PathBuf],
        max_heap: Option<u64>,
    ) -> Result<Self, ContextError> {
        let search_env = crate::helpers::join_search_path(search_path)
            .map_err(|e| ContextError::Spawn(e.to_string()))?;

        let mut command = Command::new(program);
        command
            .arg("worker")
            .arg("--compiler")
            .arg(compiler)
            .env(SEARCH_PATH_ENV, search_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        if let Some(bytes) = max_heap {
            use std::os::unix::process::CommandExt;
            // Address-space cap stands in for a max heap; the worker is
            // single-threaded, so the two are close enough in practice.
            unsafe {
                command.pre_exec(move || {
                    let limit = libc::rlimit {
                        rlim_cur: bytes as libc::rlim_t,
                        rlim_max: bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        #[cfg(not(unix))]
        let _ = max_heap;

        let mut child = command
            .spawn()
            .map_err(|e| ContextError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ContextError::Spawn("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ContextError::Spawn("worker stdout unavailable".to_string()))?;

        let mut worker = WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        match worker.read_response() {
            Ok(WorkerResponse::Ready { pid }) => {
                log::debug!("worker daemon ready (pid {pid})");
                Ok(worker)
            }
            Ok(other) => Err(ContextError::Handshake(format!(
                "unexpected first message: {}",
                serde_json::to_string(&other).unwrap_or_default()
            ))),
            Err(e) => Err(ContextError::Handshake(e.to_string())),
        }
    }

    fn call(&mut self, request: &WorkerRequest) -> Result<(), ScriptError> {
        let line = serde_json::to_string(request).map_err(|e| ScriptError::Worker(e.to_string()))?;
        writeln!(self.stdin, "{line}").map_err(|e| ScriptError::Worker(e.to_string()))?;
        self.stdin
            .flush()
            .map_err(|e| ScriptError::Worker(e.to_string()))?;

        match self.read_response() {
            Ok(response) => response.into_script_result(),
            Err(e) => Err(ScriptError::Worker(e.to_string())),
        }
    }

    fn read_response(&mut self) -> std::io::Result<WorkerResponse> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "worker process exited",
            ));
        }
        serde_json::from_str(&line).map_err(std::io::Error::from)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct PoolEntry {
    context: Arc<ExecutionContext>,
    last_used: Instant,
}

/// Caches execution contexts across batches, keyed by isolation settings and
/// the compiler closure's contents. Idle contexts are evicted after a TTL;
/// dropping a forked context kills its worker processes.
pub struct ContextPool {
    worker_program: PathBuf,
    idle_ttl: Duration,
    entries: Mutex<AHashMap<blake3::Hash, PoolEntry>>,
}

impl ContextPool {
    pub fn new() -> Result<Self, ContextError> {
        let program =
            std::env::current_exe().map_err(|e| ContextError::Spawn(e.to_string()))?;
        Ok(Self::with_worker_program(program))
    }

    pub fn with_worker_program(worker_program: PathBuf) -> Self {
        Self {
            worker_program,
            idle_ttl: DEFAULT_IDLE_TTL,
            entries: Mutex::new(AHashMap::new()),
        }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Get a cached context for these settings and closure, or create one.
    pub fn acquire(
        &self,
        settings: &CompileSettings,
        closure: &DependencyClosure,
        ambient: &[PathBuf],
    ) -> Result<Arc<ExecutionContext>, ContextError> {
        let key = self.fingerprint(settings, closure)?;

        let mut entries = lock_unpoisoned(&self.entries);
        entries.retain(|_, entry| entry.last_used.elapsed() <= self.idle_ttl);
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used = Instant::now();
            log::debug!("reusing execution context {key}");
            return Ok(Arc::clone(&entry.context));
        }

        let context = Arc::new(self.create(settings, closure, ambient)?);
        entries.insert(
            key,
            PoolEntry {
                context: Arc::clone(&context),
                last_used: Instant::now(),
            },
        );
        log::debug!("created execution context {key}");
        Ok(context)
    }

    fn create(
        &self,
        settings: &CompileSettings,
        closure: &DependencyClosure,
        ambient: &[PathBuf],
    ) -> Result<ExecutionContext, ContextError> {
        let boundary = ResolutionBoundary::new(
            closure.compiler.clone(),
            ambient.to_vec(),
            settings.boundary.clone(),
        );
        let executable = boundary
            .resolve(COMPILER_PROGRAM)
            .map_err(|_| ContextError::CompilerNotFound {
                name: COMPILER_PROGRAM.to_string(),
            })?;
        let search_path = boundary.compose_search_path();

        match settings.isolation {
            IsolationMode::InProcess => {
                let launcher = CompilerLauncher::new(executable, &search_path)
                    .map_err(|e| ContextError::Spawn(e.to_string()))?;
                Ok(ExecutionContext::InProcess(InProcessContext {
                    compiler: Arc::new(launcher),
                }))
            }
            IsolationMode::Forked => {
                let count = settings.worker_count(usize::MAX).max(1);
                let max_heap = settings.max_heap.map(|h| h.bytes());
                let mut workers = Vec::with_capacity(count);
                for _ in 0..count {
                    workers.push(Mutex::new(WorkerProcess::spawn(
                        &self.worker_program,
                        &executable,
                        &search_path,
                        max_heap,
                    )?));
                }
                Ok(ExecutionContext::Forked(ForkedContext {
                    workers,
                    cursor: AtomicUsize::new(0),
                }))
            }
        }
    }

    /// Content fingerprint: isolation settings plus every compiler-closure
    /// file's name and bytes. A changed library changes the key, so a stale
    /// compiler is never reused.
    fn fingerprint(
        &self,
        settings: &CompileSettings,
        closure: &DependencyClosure,
    ) -> Result<blake3::Hash, ContextError> {
        let mut paths = closure.compiler.clone();
        paths.sort();

        let file_hashes: Vec<(PathBuf, blake3::Hash)> = paths
            .par_iter()
            .map(|path| {
                let hash = crate::helpers::compute_file_hash(path).ok_or_else(|| {
                    ContextError::ClosureUnreadable {
                        path: path.display().to_string(),
                    }
                })?;
                Ok((path.clone(), hash))
            })
            .collect::<Result<_, ContextError>>()?;

        let mut hasher = blake3::Hasher::new();
        let mode: &[u8] = match settings.isolation {
            IsolationMode::InProcess => b"in-process",
            IsolationMode::Forked => b"forked",
        };
        hasher.update(mode);
        if settings.isolation == IsolationMode::Forked {
            if let Some(heap) = settings.max_heap {
                hasher.update(&heap.bytes().to_le_bytes());
            }
        }
        if let Ok(policy) = serde_json::to_vec(&settings.boundary) {
            hasher.update(&policy);
        }
        for (path, hash) in &file_hashes {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(hash.as_bytes());
        }
        Ok(hasher.finalize())
    }
}
