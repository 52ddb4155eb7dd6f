//! Batch compilation scheduler.
//!
//! Takes a batch of compilation requests, elides the ones the caller marked
//! unchanged, runs the rest concurrently on a bounded worker pool inside a
//! shared execution context, and aggregates per-script results under a batch
//! deadline. Scripts are independent: one script's failure never aborts its
//! siblings, and there is no ordering guarantee between scripts. Within one
//! script, compile-then-package is strictly sequential.

pub mod adapter;
pub mod archive;
pub mod module;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Instant;

use ahash::AHashSet;
use rayon::ThreadPoolBuilder;

use crate::batch::{Batch, CompilationRequest, ScriptIdentity};
use crate::context::{ContextPool, ExecutionContext};
use crate::error::{BatchError, ContextError, ScriptError};

/// Progress events emitted while a batch runs.
#[derive(Debug, Clone)]
pub enum CompileProgress {
    /// Change filtering finished; `scheduled` of `total` scripts survive.
    Filtered { total: usize, scheduled: usize },
    /// Workers dispatched.
    Dispatched { count: usize, workers: usize },
    /// One script compiled and packaged.
    Compiled {
        identity: ScriptIdentity,
        duration_seconds: f64,
    },
    /// One script failed; the message is the compiler diagnostic or error
    /// text, verbatim.
    Failed {
        identity: ScriptIdentity,
        message: String,
    },
    /// The batch deadline elapsed with these scripts still in flight.
    TimedOut { pending: Vec<ScriptIdentity> },
}

/// Receives progress events. Reports arrive from the scheduling thread while
/// workers are still running.
pub trait Reporter: Send + Sync {
    fn report(&self, progress: CompileProgress);
}

/// Discards all progress.
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _progress: CompileProgress) {}
}

/// A successfully written artifact.
#[derive(Debug, Clone)]
pub struct WrittenArtifact {
    pub identity: ScriptIdentity,
    pub destination: PathBuf,
}

/// A script that settled with an error.
#[derive(Debug)]
pub struct ScriptFailure {
    pub identity: ScriptIdentity,
    pub error: ScriptError,
}

/// Aggregate result of one batch run.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub written: Vec<WrittenArtifact>,
    pub failures: Vec<ScriptFailure>,
    /// Scripts still in flight when the deadline elapsed. Their workers are
    /// not killed, merely no longer waited upon; each script has a unique
    /// destination path, so a late write cannot corrupt another artifact.
    pub timed_out: Vec<ScriptIdentity>,
    /// Scripts elided by change detection.
    pub skipped: Vec<ScriptIdentity>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.timed_out.is_empty()
    }
}

/// Compile a whole batch inside a context from the pool.
///
/// Returns `Err` only for batch-fatal conditions (duplicate identities,
/// context creation failure, or a deadline with zero completed units);
/// per-script errors land in the outcome's failure list.
pub fn compile_batch(
    batch: &Batch,
    pool: &ContextPool,
    reporter: &dyn Reporter,
) -> Result<BatchOutcome, BatchError> {
    validate_identities(batch)?;
    let (scheduled, skipped) = filter_changed(batch, reporter);
    if scheduled.is_empty() {
        return Ok(BatchOutcome {
            skipped,
            ..BatchOutcome::default()
        });
    }
    let context = pool.acquire(&batch.settings, &batch.closure, &batch.ambient)?;
    dispatch_and_collect(batch, scheduled, skipped, context, reporter)
}

fn validate_identities(batch: &Batch) -> Result<(), BatchError> {
    let mut seen: AHashSet<&ScriptIdentity> = AHashSet::new();
    for request in &batch.requests {
        if !seen.insert(&request.identity) {
            return Err(BatchError::DuplicateIdentity(request.identity.clone()));
        }
    }
    Ok(())
}

fn filter_changed(
    batch: &Batch,
    reporter: &dyn Reporter,
) -> (Vec<CompilationRequest>, Vec<ScriptIdentity>) {
    let mut scheduled = Vec::with_capacity(batch.requests.len());
    let mut skipped = Vec::new();
    for request in &batch.requests {
        // No change signal means the script is treated as changed.
        if request.changed == Some(false) && !batch.settings.force {
            skipped.push(request.identity.clone());
        } else {
            scheduled.push(request.clone());
        }
    }
    reporter.report(CompileProgress::Filtered {
        total: batch.requests.len(),
        scheduled: scheduled.len(),
    });
    (scheduled, skipped)
}

fn dispatch_and_collect(
    batch: &Batch,
    scheduled: Vec<CompilationRequest>,
    skipped: Vec<ScriptIdentity>,
    context: Arc<ExecutionContext>,
    reporter: &dyn Reporter,
) -> Result<BatchOutcome, BatchError> {
    let settings = &batch.settings;
    let workers = settings.worker_count(scheduled.len());
    let worker_pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| BatchError::ContextCreation(ContextError::Spawn(e.to_string())))?;
    reporter.report(CompileProgress::Dispatched {
        count: scheduled.len(),
        workers,
    });
    log::info!(
        "compiling {} script(s) on {} worker(s), timeout {:?}",
        scheduled.len(),
        workers,
        settings.timeout()
    );

    let runtime = Arc::new(batch.closure.runtime.clone());
    let (result_tx, result_rx) = mpsc::channel();
    for request in &scheduled {
        let request = request.clone();
        let context = Arc::clone(&context);
        let runtime = Arc::clone(&runtime);
        let tx = result_tx.clone();
        worker_pool.spawn(move || {
            let started = Instant::now();
            let result = context.execute(&request, &runtime);
            // Past the deadline the receiver is gone; the send fails and the
            // settled result is discarded.
            let _ = tx.send(Settled {
                identity: request.identity,
                destination: request.destination,
                result,
                duration_seconds: started.elapsed().as_secs_f64(),
            });
        });
    }
    drop(result_tx);

    let mut outcome = BatchOutcome {
        skipped,
        ..BatchOutcome::default()
    };
    let deadline = Instant::now() + settings.timeout();
    let mut settled: AHashSet<ScriptIdentity> = AHashSet::new();
    while settled.len() < scheduled.len() {
        let Some(wait) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        match result_rx.recv_timeout(wait) {
            Ok(done) => {
                settled.insert(done.identity.clone());
                match done.result {
                    Ok(()) => {
                        reporter.report(CompileProgress::Compiled {
                            identity: done.identity.clone(),
                            duration_seconds: done.duration_seconds,
                        });
                        outcome.written.push(WrittenArtifact {
                            identity: done.identity,
                            destination: done.destination,
                        });
                    }
                    Err(error) => {
                        reporter.report(CompileProgress::Failed {
                            identity: done.identity.clone(),
                            message: error.to_string(),
                        });
                        outcome.failures.push(ScriptFailure {
                            identity: done.identity,
                            error,
                        });
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Abandon the pool: in-flight tasks keep running detached, and their
    // results go nowhere once the receiver is dropped.
    drop(result_rx);

    outcome.timed_out = scheduled
        .iter()
        .map(|r| r.identity.clone())
        .filter(|identity| !settled.contains(identity))
        .collect();
    if !outcome.timed_out.is_empty() {
        reporter.report(CompileProgress::TimedOut {
            pending: outcome.timed_out.clone(),
        });
        if outcome.written.is_empty() && outcome.failures.is_empty() {
            return Err(BatchError::Stalled {
                timeout: settings.timeout(),
            });
        }
    }

    Ok(outcome)
}

struct Settled {
    identity: ScriptIdentity,
    destination: PathBuf,
    result: Result<(), ScriptError>,
    duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DependencyClosure;
    use crate::compile::adapter::ScriptCompiler;
    use crate::compile::module::{CompiledModule, ModuleBinaries, ScriptMetadata};
    use crate::config::{CompileSettings, IsolationMode};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    /// Deterministic stand-in for the external compiler: fails on a marker
    /// token, sleeps on `sleep:<millis>`, succeeds otherwise.
    struct FakeCompiler;

    impl ScriptCompiler for FakeCompiler {
        fn compile(
            &self,
            identity: &ScriptIdentity,
            source: &str,
            _runtime_closure: &[PathBuf],
        ) -> Result<CompiledModule, ScriptError> {
            if source.contains("this is not valid") {
                return Err(ScriptError::Compile {
                    script: identity.clone(),
                    diagnostics: "1:1: error: unexpected token".to_string(),
                });
            }
            if let Some(millis) = source.strip_prefix("sleep:") {
                let millis: u64 = millis.trim().parse().unwrap();
                std::thread::sleep(Duration::from_millis(millis));
            }
            let entry_class = identity.entry_class();
            let mut units = BTreeMap::new();
            units.insert(
                format!("classes/{entry_class}.bin"),
                source.as_bytes().to_vec(),
            );
            Ok(CompiledModule {
                entry_class,
                binaries: ModuleBinaries::InMemory(units),
                metadata: ScriptMetadata {
                    engine_version: "1.0.0".to_string(),
                    ..ScriptMetadata::default()
                },
            })
        }
    }

    fn fake_batch(dir: &Path, scripts: &[(&str, &str)], settings: CompileSettings) -> Batch {
        let requests = scripts
            .iter()
            .map(|(name, source)| {
                let source_path = dir.join(format!("{name}.scr"));
                fs::write(&source_path, source).unwrap();
                CompilationRequest {
                    identity: ScriptIdentity::new("pack", *name),
                    source: source_path,
                    destination: dir.join(format!("{name}.jar")),
                    changed: None,
                }
            })
            .collect();
        Batch {
            namespace: "pack".to_string(),
            requests,
            closure: DependencyClosure::default(),
            ambient: Vec::new(),
            settings,
        }
    }

    /// Runs the scheduler against a fake in-process context, bypassing
    /// context acquisition.
    fn run(batch: &Batch) -> Result<BatchOutcome, BatchError> {
        validate_identities(batch)?;
        let (scheduled, skipped) = filter_changed(batch, &NoopReporter);
        if scheduled.is_empty() {
            return Ok(BatchOutcome {
                skipped,
                ..BatchOutcome::default()
            });
        }
        let context = Arc::new(ExecutionContext::with_compiler(Arc::new(FakeCompiler)));
        dispatch_and_collect(batch, scheduled, skipped, context, &NoopReporter)
    }

    fn settings(timeout_secs: u64, workers: usize) -> CompileSettings {
        CompileSettings {
            isolation: IsolationMode::InProcess,
            workers: Some(workers),
            timeout_secs,
            ..CompileSettings::default()
        }
    }

    #[test]
    fn sibling_scripts_survive_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        let batch = fake_batch(
            dir.path(),
            &[
                ("a", "val x = 1 + 1"),
                ("b", "this is not valid"),
                ("c", "val y = 2"),
            ],
            settings(5, 2),
        );

        let outcome = run(&batch).unwrap();
        assert_eq!(outcome.written.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].identity.to_string(), "pack.b");
        assert!(
            outcome.failures[0]
                .error
                .to_string()
                .contains("unexpected token")
        );
        assert!(dir.path().join("a.jar").exists());
        assert!(dir.path().join("c.jar").exists());
        assert!(!dir.path().join("b.jar").exists());
    }

    #[test]
    fn unchanged_scripts_are_elided() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = fake_batch(
            dir.path(),
            &[("a", "val x = 1"), ("b", "val y = 2")],
            settings(5, 2),
        );
        batch.requests[1].changed = Some(false);

        let outcome = run(&batch).unwrap();
        assert_eq!(outcome.written.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].to_string(), "pack.b");
        assert!(!dir.path().join("b.jar").exists());
    }

    #[test]
    fn force_overrides_change_elision() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = fake_batch(dir.path(), &[("a", "val x = 1")], settings(5, 1));
        batch.requests[0].changed = Some(false);
        batch.settings.force = true;

        let outcome = run(&batch).unwrap();
        assert_eq!(outcome.written.len(), 1);
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn duplicate_identities_are_batch_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = fake_batch(dir.path(), &[("a", "val x = 1")], settings(5, 1));
        batch.requests.push(batch.requests[0].clone());

        let err = run(&batch).unwrap_err();
        assert!(matches!(err, BatchError::DuplicateIdentity(_)));
    }

    #[test]
    fn slow_scripts_are_flagged_timed_out_without_losing_finished_work() {
        let dir = tempfile::tempdir().unwrap();
        let batch = fake_batch(
            dir.path(),
            &[
                ("fast", "val x = 1"),
                ("slow1", "sleep:4000"),
                ("slow2", "sleep:4000"),
            ],
            settings(1, 3),
        );

        let outcome = run(&batch).unwrap();
        assert_eq!(outcome.written.len(), 1);
        assert_eq!(outcome.written[0].identity.to_string(), "pack.fast");
        assert_eq!(outcome.timed_out.len(), 2);
        // The finished artifact is intact and readable.
        let file = fs::File::open(dir.path().join("fast.jar")).unwrap();
        assert!(zip::ZipArchive::new(file).is_ok());
    }

    #[test]
    fn deadline_with_zero_progress_is_batch_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let batch = fake_batch(dir.path(), &[("slow", "sleep:4000")], settings(1, 1));

        let err = run(&batch).unwrap_err();
        assert!(matches!(err, BatchError::Stalled { .. }));
    }
}
