use anyhow::Result;
use std::io::Write;

use scriptpack::compile::{self, CompileProgress, Reporter};
use scriptpack::{batch, cli, context, worker};

use clap::Parser;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let log_level_filter = cli.verbose.log_level_filter();

    // Worker processes speak their protocol on stdout; their logs must go to
    // stderr.
    let log_target = match cli.command {
        cli::Command::Worker(_) => env_logger::fmt::Target::Stderr,
        _ => env_logger::fmt::Target::Stdout,
    };
    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "{}:\n{}", record.level(), record.args()))
        .filter_level(log_level_filter)
        .target(log_target)
        .init();

    match cli.command {
        cli::Command::Build(build_args) => {
            let mut batch = batch::Batch::from_manifest(&build_args.manifest)?;
            apply_overrides(&mut batch.settings, &build_args);

            let pool = context::ContextPool::new()?;
            let reporter = LogReporter;
            let outcome = compile::compile_batch(&batch, &pool, &reporter)?;

            for artifact in &outcome.written {
                println!("{} -> {}", artifact.identity, artifact.destination.display());
            }
            if !outcome.skipped.is_empty() {
                println!("{} script(s) up to date", outcome.skipped.len());
            }
            for failure in &outcome.failures {
                println!("{}", failure.error);
            }
            for identity in &outcome.timed_out {
                println!("{identity}: timed out");
            }

            if outcome.is_success() {
                std::process::exit(0);
            }
            std::process::exit(1);
        }
        cli::Command::Worker(worker_args) => worker::run(worker_args.compiler),
    }
}

fn apply_overrides(settings: &mut scriptpack::config::CompileSettings, args: &cli::BuildArgs) {
    if let Some(workers) = args.workers {
        settings.workers = Some(workers);
    }
    if let Some(timeout) = args.timeout {
        settings.timeout_secs = timeout;
    }
    if let Some(isolation) = args.isolation {
        settings.isolation = isolation;
    }
    if let Some(max_heap) = args.max_heap {
        settings.max_heap = Some(max_heap);
    }
    if args.force {
        settings.force = true;
    }
}

struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, progress: CompileProgress) {
        match progress {
            CompileProgress::Filtered { total, scheduled } => {
                log::info!("{scheduled}/{total} script(s) need compiling");
            }
            CompileProgress::Dispatched { count, workers } => {
                log::debug!("dispatched {count} script(s) to {workers} worker(s)");
            }
            CompileProgress::Compiled {
                identity,
                duration_seconds,
            } => {
                log::info!("compiled {identity} in {duration_seconds:.2}s");
            }
            CompileProgress::Failed { identity, message } => {
                log::error!("{identity} failed:\n{message}");
            }
            CompileProgress::TimedOut { pending } => {
                log::warn!("{} script(s) still running at the deadline", pending.len());
            }
        }
    }
}
