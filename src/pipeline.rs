//! Task graph composer: named, strictly sequential pipelines of steps.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::config::Config;
use crate::error::{BuildError, Result};
use crate::housekeeping;
use crate::stage::{Stage, StageKind, StageReport};
use crate::watch;

/// One unit of work in a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Clean,
    Stage(StageKind),
    Archive,
    Watch,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Clean => "clean",
            Step::Stage(kind) => kind.as_str(),
            Step::Archive => "archive",
            Step::Watch => "watch",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a completed step produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Cleaned(Vec<PathBuf>),
    Stage(StageReport),
    Archived(PathBuf),
    Watched,
}

/// Steps completed by a pipeline run, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub name: &'static str,
    pub completed: Vec<StepOutcome>,
}

impl PipelineReport {
    /// Stage reports among the completed steps
    pub fn stages(&self) -> impl Iterator<Item = &StageReport> {
        self.completed.iter().filter_map(|o| match o {
            StepOutcome::Stage(report) => Some(report),
            _ => None,
        })
    }
}

/// A named sequence of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub name: &'static str,
    pub steps: Vec<Step>,
}

/// Compose a pipeline, normalizing step order: `Clean` first, then stages in
/// the given order, then `Archive`, with `Watch` terminal.
pub fn compose(name: &'static str, steps: impl IntoIterator<Item = Step>) -> Pipeline {
    let steps: Vec<Step> = steps.into_iter().collect();
    let has = |step: Step| steps.contains(&step);

    let mut ordered = Vec::with_capacity(steps.len());
    if has(Step::Clean) {
        ordered.push(Step::Clean);
    }
    ordered.extend(steps.iter().copied().filter(|s| matches!(s, Step::Stage(_))));
    if has(Step::Archive) {
        ordered.push(Step::Archive);
    }
    if has(Step::Watch) {
        ordered.push(Step::Watch);
    }

    Pipeline {
        name,
        steps: ordered,
    }
}

fn asset_stages(config: &Config) -> [Step; 4] {
    [
        Step::Stage(StageKind::Html),
        Step::Stage(StageKind::style(config.style)),
        Step::Stage(StageKind::Scripts),
        Step::Stage(StageKind::Images),
    ]
}

/// Clean, then produce all assets
pub fn build(config: &Config) -> Pipeline {
    compose(
        "build",
        std::iter::once(Step::Clean).chain(asset_stages(config)),
    )
}

/// Produce all assets, then watch and serve
pub fn start(config: &Config) -> Pipeline {
    compose("start", asset_stages(config).into_iter().chain([Step::Watch]))
}

/// Clean, produce all assets, then archive the output tree
pub fn compress(config: &Config) -> Pipeline {
    compose(
        "compress",
        std::iter::once(Step::Clean)
            .chain(asset_stages(config))
            .chain([Step::Archive]),
    )
}

/// A pipeline of exactly one step
pub fn single(step: Step) -> Pipeline {
    compose(step.as_str(), [step])
}

impl Pipeline {
    /// Run every step in order. The first failure aborts the rest.
    pub fn run(&self, config: &Config, shutdown: &AtomicBool) -> Result<PipelineReport> {
        let mut completed = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if shutdown.load(Ordering::Relaxed) {
                return Err(BuildError::Cancelled);
            }

            let start = Instant::now();
            // The caller reports the error itself
            let outcome = run_step(*step, config, shutdown).inspect_err(|_| {
                crate::log!("failed"; "{} stopped at {step}", self.name);
            })?;
            log_outcome(&outcome, start);
            completed.push(outcome);
        }

        Ok(PipelineReport {
            name: self.name,
            completed,
        })
    }
}

/// Run a single step
pub fn run_step(step: Step, config: &Config, shutdown: &AtomicBool) -> Result<StepOutcome> {
    match step {
        Step::Clean => housekeeping::clean(config).map(StepOutcome::Cleaned),
        Step::Stage(kind) => Stage::build(kind, config)?
            .run(config)
            .map(StepOutcome::Stage),
        Step::Archive => housekeeping::archive(config).map(StepOutcome::Archived),
        Step::Watch => watch::run(config, shutdown).map(|()| StepOutcome::Watched),
    }
}

fn log_outcome(outcome: &StepOutcome, start: Instant) {
    let elapsed = start.elapsed().as_secs_f64();
    match outcome {
        StepOutcome::Cleaned(removed) => {
            crate::log!("clean"; "removed {} director(ies) in {elapsed:.2}s", removed.len());
        }
        StepOutcome::Stage(report) => {
            crate::log!(
                report.kind.as_str();
                "{} file(s) -> {} output(s) in {elapsed:.2}s",
                report.inputs,
                report.outputs.len()
            );
        }
        StepOutcome::Archived(path) => {
            crate::log!("archive"; "wrote {} in {elapsed:.2}s", path.display());
        }
        StepOutcome::Watched => {}
    }
}
