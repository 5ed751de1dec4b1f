use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use assetflow::config::{Cli, Command, Config};
use assetflow::deploy;
use assetflow::error::BuildError;
use assetflow::logger;
use assetflow::pipeline::{self, Pipeline, Step};
use assetflow::stage::StageKind;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Build failures exit 1, with the full error chain
fn failure(e: BuildError) -> ExitCode {
    eprintln!("Error: {:#}", anyhow::Error::from(e));
    ExitCode::FAILURE
}

fn pipeline_for(command: Command, config: &Config) -> Option<Pipeline> {
    let stage = |kind| Some(pipeline::single(Step::Stage(kind)));
    match command {
        Command::Build => Some(pipeline::build(config)),
        Command::Start => Some(pipeline::start(config)),
        Command::Compress => Some(pipeline::compress(config)),
        Command::Html => stage(StageKind::Html),
        Command::Css => stage(StageKind::Css),
        Command::Sass => stage(StageKind::Sass),
        Command::Scripts => stage(StageKind::Scripts),
        Command::Images => stage(StageKind::Images),
        Command::Fonts => stage(StageKind::Fonts),
        Command::Clean => Some(pipeline::single(Step::Clean)),
        Command::Archive => Some(pipeline::single(Step::Archive)),
        Command::Watch => Some(pipeline::single(Step::Watch)),
        Command::Deploy => None,
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;
    logger::set_verbose(config.verbose);

    if !config.paths.root().is_dir() {
        anyhow::bail!("Project root not found: {}", config.paths.root().display());
    }

    // Setup Ctrl+C handler
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let start = Instant::now();

    let Some(pipeline) = pipeline_for(cli.command, &config) else {
        let report = match deploy::deploy(&config, &shutdown) {
            Ok(report) => report,
            Err(e) if e.is_config() => return Err(e.into()),
            Err(e) => return Ok(failure(e)),
        };
        if shutdown.load(Ordering::Relaxed) {
            eprintln!("\nDeploy cancelled");
            return Ok(ExitCode::from(130));
        }
        for (path, error) in &report.failed {
            println!("  {}: FAILED: {error}", path.display());
        }
        println!(
            "Deployed {} file(s), {} up to date, {} failed in {:.2}s",
            report.uploaded.len(),
            report.skipped.len(),
            report.failed.len(),
            start.elapsed().as_secs_f64()
        );
        return Ok(if report.has_failures() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    };

    match pipeline.run(&config, &shutdown) {
        Ok(report) => {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(ExitCode::from(130));
            }
            let outputs: usize = report.stages().map(|s| s.outputs.len()).sum();
            println!(
                "Finished {} ({} step(s), {} file(s) written) in {:.2}s",
                report.name,
                report.completed.len(),
                outputs,
                start.elapsed().as_secs_f64()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(BuildError::Cancelled) => {
            eprintln!("\n{} cancelled", pipeline.name);
            Ok(ExitCode::from(130))
        }
        Err(e) if e.is_config() => Err(e.into()),
        Err(e) => Ok(failure(e)),
    }
}
