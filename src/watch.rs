//! Change watcher: maps file changes to the steps bound to them, runs those
//! steps, and publishes one reload notification per successful run.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher as _};

use crate::config::{Config, OverlapPolicy, StyleVariant};
use crate::error::{BuildError, Result};
use crate::paths::{PathMatcher, WatchCategory};
use crate::pipeline::{run_step, Step, StepOutcome};
use crate::serve::{start_preview, ReloadHub, ReloadSink};
use crate::stage::{ReloadEvent, StageKind};

/// Poll interval for the shutdown flag
const TICK: Duration = Duration::from_millis(200);

/// Quiet period that batches editor save bursts into one run
const SETTLE: Duration = Duration::from_millis(50);

/// What the browser should do after a bound step succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// Reload the whole page
    Full,
    /// Swap the stylesheet without reloading
    InjectCss,
    /// No notification
    None,
}

/// A watched glob and the step it triggers
#[derive(Debug, Clone)]
pub struct WatchBinding {
    pub pattern: String,
    pub step: Step,
    pub reload: ReloadPolicy,
    matcher: PathMatcher,
}

/// Immutable set of bindings, created once at startup
#[derive(Debug, Clone)]
pub struct Watcher {
    bindings: Vec<WatchBinding>,
}

impl Watcher {
    pub fn from_config(config: &Config) -> Result<Self> {
        let style_sources = match config.style {
            StyleVariant::Css => WatchCategory::Css,
            StyleVariant::Sass => WatchCategory::Sass,
        };
        let mut table = vec![
            (WatchCategory::Html, Step::Stage(StageKind::Html), ReloadPolicy::Full),
            (
                style_sources,
                Step::Stage(StageKind::style(config.style)),
                ReloadPolicy::InjectCss,
            ),
            (
                WatchCategory::Scripts,
                Step::Stage(StageKind::Scripts),
                ReloadPolicy::Full,
            ),
        ];
        if config.watch.auto_archive {
            table.push((WatchCategory::Output, Step::Archive, ReloadPolicy::None));
        }

        let bindings = table
            .into_iter()
            .map(|(category, step, reload)| {
                let pattern = config.paths.watch_glob(category).ok_or_else(|| {
                    BuildError::config(format!("no watch glob configured for {category:?}"))
                })?;
                Ok(WatchBinding {
                    pattern: pattern.to_string(),
                    step,
                    reload,
                    matcher: config.paths.matcher(pattern)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { bindings })
    }

    pub fn bindings(&self) -> &[WatchBinding] {
        &self.bindings
    }

    /// Bindings triggered by any of `paths`, deduplicated, in binding order
    fn triggered(&self, paths: &[PathBuf]) -> Vec<&WatchBinding> {
        self.bindings
            .iter()
            .filter(|b| paths.iter().any(|p| b.matcher.is_match(p)))
            .collect()
    }

    /// Steps triggered by a batch of changed paths
    pub fn dispatch(&self, paths: &[PathBuf]) -> Vec<Step> {
        self.triggered(paths).into_iter().map(|b| b.step).collect()
    }

    /// Run the steps triggered by `paths`. Failures are logged and skipped.
    /// Returns the steps that succeeded.
    pub fn handle(
        &self,
        paths: &[PathBuf],
        config: &Config,
        sink: &ReloadSink,
        shutdown: &AtomicBool,
    ) -> Vec<Step> {
        let mut succeeded = Vec::new();
        for binding in self.triggered(paths) {
            let outcome = match run_step(binding.step, config, shutdown) {
                Ok(outcome) => outcome,
                Err(e) => {
                    crate::log!("failed"; "{}: {e}", binding.step);
                    continue;
                }
            };
            crate::log!("watch"; "rebuilt {}", binding.step);

            if let Some(event) = reload_event(binding.reload, outcome) {
                if sink.send(event).is_err() {
                    crate::debug!("watch"; "reload hub is gone");
                }
            }
            succeeded.push(binding.step);
        }
        succeeded
    }
}

fn reload_event(policy: ReloadPolicy, outcome: StepOutcome) -> Option<ReloadEvent> {
    match policy {
        ReloadPolicy::None => None,
        ReloadPolicy::Full => Some(ReloadEvent::Reload),
        ReloadPolicy::InjectCss => {
            let css = match outcome {
                StepOutcome::Stage(report) => report.events.into_iter().next(),
                _ => None,
            };
            Some(css.unwrap_or(ReloadEvent::Reload))
        }
    }
}

/// Paths of an event worth reacting to
fn relevant_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        _ => event.paths,
    }
}

/// Watch sources and serve the output tree until `shutdown` is set
pub fn run(config: &Config, shutdown: &AtomicBool) -> Result<()> {
    let watcher = Watcher::from_config(config)?;
    let watch_error = |e: notify::Error| BuildError::Watch {
        message: e.to_string(),
    };

    let hub = ReloadHub::start(config.serve.reload_port)?;
    let (sink, events) = channel::unbounded();
    hub.forward(events);

    let output_root = config.paths.output_root();
    let port = start_preview(output_root.clone(), config.serve.port, hub.port())?;
    crate::log!("serve"; "http://127.0.0.1:{port} (live reload on {})", hub.port());

    let (tx, rx) = channel::unbounded();
    let mut fs_watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .map_err(watch_error)?;

    let mut roots = vec![config.paths.root().join("src")];
    if config.watch.auto_archive {
        std::fs::create_dir_all(&output_root).map_err(|e| BuildError::io(&output_root, e))?;
        roots.push(output_root);
    }
    for root in &roots {
        if root.exists() {
            fs_watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(watch_error)?;
            crate::debug!("watch"; "watching {}", root.display());
        }
    }
    crate::log!("watch"; "waiting for changes, Ctrl+C to stop");

    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    let absorb = |res: notify::Result<Event>, pending: &mut BTreeSet<PathBuf>| match res {
        Ok(event) => pending.extend(relevant_paths(event)),
        Err(e) => crate::log!("watch"; "notify error: {e}"),
    };

    while !shutdown.load(Ordering::Relaxed) {
        if pending.is_empty() {
            match rx.recv_timeout(TICK) {
                Ok(res) => absorb(res, &mut pending),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(res) = rx.recv_timeout(SETTLE) {
            absorb(res, &mut pending);
        }
        if pending.is_empty() {
            continue;
        }

        let batch: Vec<PathBuf> = std::mem::take(&mut pending).into_iter().collect();
        crate::debug!("watch"; "{} changed path(s)", batch.len());
        watcher.handle(&batch, config, &sink, shutdown);

        // Changes that arrived while the steps ran
        for res in rx.try_iter() {
            absorb(res, &mut pending);
        }
        if config.watch.overlap == OverlapPolicy::Drop && !pending.is_empty() {
            crate::debug!("watch"; "dropping {} change(s) seen during the run", pending.len());
            pending.clear();
        }
    }

    crate::log!("watch"; "stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn project() -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        let config = Config::for_root(temp.path());
        (temp, config)
    }

    fn write(root: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    // ==================== dispatch tests ====================

    #[test]
    fn test_default_bindings() {
        let (_temp, config) = project();
        let watcher = Watcher::from_config(&config).unwrap();
        let steps: Vec<(Step, ReloadPolicy)> =
            watcher.bindings().iter().map(|b| (b.step, b.reload)).collect();
        assert_eq!(
            steps,
            vec![
                (Step::Stage(StageKind::Html), ReloadPolicy::Full),
                (Step::Stage(StageKind::Sass), ReloadPolicy::InjectCss),
                (Step::Stage(StageKind::Scripts), ReloadPolicy::Full),
            ]
        );
    }

    #[test]
    fn test_auto_archive_binding() {
        let (temp, mut config) = project();
        config.watch.auto_archive = true;
        let watcher = Watcher::from_config(&config).unwrap();
        assert_eq!(
            watcher.dispatch(&[temp.path().join("dist/scripts/main.min.js")]),
            vec![Step::Archive]
        );
    }

    #[test]
    fn test_script_change_dispatches_only_scripts() {
        let (temp, config) = project();
        let watcher = Watcher::from_config(&config).unwrap();
        let steps = watcher.dispatch(&[temp.path().join("src/js/lib/util.js")]);
        assert_eq!(steps, vec![Step::Stage(StageKind::Scripts)]);
    }

    #[test]
    fn test_dispatch_deduplicates_in_binding_order() {
        let (temp, config) = project();
        let watcher = Watcher::from_config(&config).unwrap();
        let steps = watcher.dispatch(&[
            temp.path().join("src/js/a.js"),
            temp.path().join("src/style/_vars.scss"),
            temp.path().join("src/js/b.js"),
            temp.path().join("src/index.html"),
        ]);
        assert_eq!(
            steps,
            vec![
                Step::Stage(StageKind::Html),
                Step::Stage(StageKind::Sass),
                Step::Stage(StageKind::Scripts),
            ]
        );
    }

    #[test]
    fn test_unwatched_path_dispatches_nothing() {
        let (temp, config) = project();
        let watcher = Watcher::from_config(&config).unwrap();
        assert!(watcher
            .dispatch(&[temp.path().join("src/images/logo.png")])
            .is_empty());
        // Output changes are ignored unless auto-archive is on
        assert!(watcher
            .dispatch(&[temp.path().join("dist/index.html")])
            .is_empty());
    }

    #[test]
    fn test_css_variant_watches_css_sources() {
        let (temp, mut config) = project();
        config.style = StyleVariant::Css;
        let watcher = Watcher::from_config(&config).unwrap();

        assert_eq!(
            watcher.dispatch(&[temp.path().join("src/css/a.css")]),
            vec![Step::Stage(StageKind::Css)]
        );
        assert!(watcher
            .dispatch(&[temp.path().join("src/style/_x.scss")])
            .is_empty());
    }

    // ==================== handle tests ====================

    #[test]
    fn test_script_change_runs_scripts_with_one_reload() {
        let (temp, config) = project();
        write(temp.path(), "src/index.html", "<body></body>");
        let changed = write(temp.path(), "src/js/app.js", "console.log('hi');");
        let watcher = Watcher::from_config(&config).unwrap();
        let (sink, events) = channel::unbounded();
        let shutdown = AtomicBool::new(false);

        let ran = watcher.handle(&[changed], &config, &sink, &shutdown);

        assert_eq!(ran, vec![Step::Stage(StageKind::Scripts)]);
        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![ReloadEvent::Reload]);
        assert!(temp.path().join("dist/scripts/main.min.js").is_file());
        assert!(!temp.path().join("dist/index.html").exists());
    }

    #[test]
    fn test_style_change_injects_css() {
        let (temp, config) = project();
        write(temp.path(), "src/style/main.scss", "@import 'vars'; .a { color: $c; }");
        let changed = write(temp.path(), "src/style/_vars.scss", "$c: red;");
        let watcher = Watcher::from_config(&config).unwrap();
        let (sink, events) = channel::unbounded();
        let shutdown = AtomicBool::new(false);

        watcher.handle(&[changed], &config, &sink, &shutdown);

        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![ReloadEvent::Css {
                path: "style/main.min.css".to_string()
            }]
        );
    }

    #[test]
    fn test_css_change_injects_css() {
        let (temp, mut config) = project();
        config.style = StyleVariant::Css;
        let changed = write(temp.path(), "src/css/a.css", ".a { color: red }");
        let watcher = Watcher::from_config(&config).unwrap();
        let (sink, events) = channel::unbounded();
        let shutdown = AtomicBool::new(false);

        let ran = watcher.handle(&[changed], &config, &sink, &shutdown);

        assert_eq!(ran, vec![Step::Stage(StageKind::Css)]);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![ReloadEvent::Css {
                path: "style/main.min.css".to_string()
            }]
        );
        assert!(temp.path().join("dist/style/main.min.css").is_file());
    }

    #[test]
    fn test_failed_step_sends_no_reload() {
        let (temp, config) = project();
        let changed = write(temp.path(), "src/js/app.js", "function ( {");
        let watcher = Watcher::from_config(&config).unwrap();
        let (sink, events) = channel::unbounded();
        let shutdown = AtomicBool::new(false);

        let ran = watcher.handle(&[changed], &config, &sink, &shutdown);

        assert!(ran.is_empty());
        assert_eq!(events.try_iter().count(), 0);
    }

    #[test]
    fn test_relevant_paths_ignores_access() {
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/p/src/js/a.js"));
        assert!(relevant_paths(event).is_empty());

        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/p/src/js/a.js"));
        assert_eq!(relevant_paths(event), vec![PathBuf::from("/p/src/js/a.js")]);
    }
}
