//! Transform stages: one configuration each of "resolve a glob, transform the
//! matched files, write the results to a destination directory".
//!
//! Every stage computes all of its output in memory before writing anything,
//! so a compile failure leaves the previous output untouched.

mod html;
mod image;
mod script;
mod style;
mod svg;

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::config::{Config, StyleVariant};
use crate::error::{BuildError, Result};
use crate::paths::{slash_path, Category, PathSpec};

pub use image::compress_image;
pub use script::bundle_scripts;
pub use style::{compile_sass, prefix_css};
pub use svg::minify_svg;

/// Kind of transform a stage applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Html,
    Css,
    Sass,
    Scripts,
    Images,
    Fonts,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        self.category().as_str()
    }

    pub fn category(&self) -> Category {
        match self {
            StageKind::Html => Category::Html,
            StageKind::Css => Category::Css,
            StageKind::Sass => Category::Sass,
            StageKind::Scripts => Category::Scripts,
            StageKind::Images => Category::Images,
            StageKind::Fonts => Category::Fonts,
        }
    }

    /// The style stage selected by configuration
    pub fn style(variant: StyleVariant) -> Self {
        match variant {
            StyleVariant::Css => StageKind::Css,
            StyleVariant::Sass => StageKind::Sass,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live reload notification produced by a stage or the watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReloadEvent {
    /// Reload the whole page
    Reload,
    /// Swap a stylesheet in place; `path` is relative to the output root
    Css { path: String },
}

/// Outcome of one stage run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub kind: StageKind,
    /// Number of matched source files
    pub inputs: usize,
    /// Files written, in write order
    pub outputs: Vec<PathBuf>,
    pub events: Vec<ReloadEvent>,
}

/// A stage bound to its resolved path pair
#[derive(Debug, Clone)]
pub struct Stage {
    pub kind: StageKind,
    pub paths: PathSpec,
}

/// A file computed by a stage, not yet written
pub(crate) struct Output {
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

impl Stage {
    /// Bind a stage to its registry entry; unconfigured categories fail here
    pub fn build(kind: StageKind, config: &Config) -> Result<Self> {
        let paths = config.paths.lookup(kind.category())?.clone();
        Ok(Self { kind, paths })
    }

    /// Resolve inputs, transform them and write the results
    pub fn run(&self, config: &Config) -> Result<StageReport> {
        let inputs = config.paths.resolve(&self.paths.source_glob)?;
        let destination = config.paths.destination(&self.paths);

        if inputs.is_empty() {
            crate::debug!(self.kind.as_str(); "no files match {}", self.paths.source_glob);
            return Ok(StageReport {
                kind: self.kind,
                inputs: 0,
                outputs: Vec::new(),
                events: Vec::new(),
            });
        }

        let base = config.paths.glob_base(&self.paths.source_glob);
        let outputs = match self.kind {
            StageKind::Html | StageKind::Fonts => html::copy(&inputs, &base, &destination)?,
            StageKind::Css => style::bundle_css(&inputs, &destination, config)?,
            StageKind::Sass => style::bundle_sass(&inputs, &destination, config)?,
            StageKind::Scripts => script::bundle(&inputs, &base, &destination, config)?,
            StageKind::Images => image::compress(&inputs, &base, &destination, config)?,
        };

        let written = commit(outputs)?;
        for path in &written {
            crate::debug!(self.kind.as_str(); "wrote {}", path.display());
        }

        let events = match self.kind {
            StageKind::Css | StageKind::Sass => {
                css_events(&written, &config.paths.output_root())
            }
            _ => Vec::new(),
        };

        Ok(StageReport {
            kind: self.kind,
            inputs: inputs.len(),
            outputs: written,
            events,
        })
    }
}

fn css_events(written: &[PathBuf], output_root: &Path) -> Vec<ReloadEvent> {
    written
        .iter()
        .filter(|p| p.extension().is_some_and(|e| e == "css"))
        .filter_map(|p| p.strip_prefix(output_root).ok())
        .map(|rel| ReloadEvent::Css {
            path: slash_path(rel),
        })
        .collect()
}

/// Read a source file
pub(crate) fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| BuildError::io(path, e))
}

pub(crate) fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| BuildError::io(path, e))
}

/// Write computed outputs, creating parent directories as needed
fn commit(outputs: Vec<Output>) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(outputs.len());
    for output in outputs {
        write_file(&output.path, &output.contents)?;
        written.push(output.path);
    }
    Ok(written)
}

pub(crate) fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| BuildError::CreateDirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(path, contents).map_err(|e| BuildError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Destination path of `src`, keeping its structure beneath the glob base
pub(crate) fn output_path(src: &Path, base: &Path, destination: &Path) -> PathBuf {
    match src.strip_prefix(base) {
        Ok(relative) => destination.join(relative),
        Err(_) => destination.join(src.file_name().unwrap_or_default()),
    }
}

/// Path of `target` relative to directory `from`, with `/` separators.
///
/// Used for source map references, which must be relative to the bundle.
pub(crate) fn relative_to(from: &Path, target: &Path) -> String {
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = target.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = std::iter::repeat("..".to_string())
        .take(from.len() - common)
        .collect();
    parts.extend(
        to[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        let config = Config::for_root(temp.path());
        (temp, config)
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    // ==================== Stage::build tests ====================

    #[test]
    fn test_build_fonts_fails_fast() {
        let (_temp, config) = project();
        let err = Stage::build(StageKind::Fonts, &config).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_build_binds_registry_paths() {
        let (_temp, config) = project();
        let stage = Stage::build(StageKind::Scripts, &config).unwrap();
        assert_eq!(stage.paths.source_glob, "src/js/*.js");
    }

    #[test]
    fn test_style_variant_selection() {
        assert_eq!(StageKind::style(StyleVariant::Css), StageKind::Css);
        assert_eq!(StageKind::style(StyleVariant::Sass), StageKind::Sass);
    }

    // ==================== empty match tests ====================

    #[test]
    fn test_empty_match_is_noop_for_every_stage() {
        let (temp, config) = project();
        for kind in [
            StageKind::Html,
            StageKind::Css,
            StageKind::Sass,
            StageKind::Scripts,
            StageKind::Images,
        ] {
            let report = Stage::build(kind, &config).unwrap().run(&config).unwrap();
            assert_eq!(report.inputs, 0, "{kind}");
            assert!(report.outputs.is_empty(), "{kind}");
            assert!(report.events.is_empty(), "{kind}");
        }
        assert!(!temp.path().join("dist").exists());
    }

    // ==================== html stage tests ====================

    #[test]
    fn test_html_identity_copy() {
        let (temp, config) = project();
        write(temp.path(), "src/index.html", "<h1>hi</h1>\n");

        let report = Stage::build(StageKind::Html, &config)
            .unwrap()
            .run(&config)
            .unwrap();

        let out = temp.path().join("dist").join("index.html");
        assert_eq!(report.outputs, vec![out.clone()]);
        assert_eq!(fs::read_to_string(out).unwrap(), "<h1>hi</h1>\n");
        assert!(report.events.is_empty());
    }

    // ==================== css stage tests ====================

    #[test]
    fn test_css_bundle_concatenates_in_glob_order() {
        let (temp, config) = project();
        write(temp.path(), "src/css/b.css", ".b { color: blue }");
        write(temp.path(), "src/css/a.css", ".a { color: red }");

        let report = Stage::build(StageKind::Css, &config)
            .unwrap()
            .run(&config)
            .unwrap();

        assert_eq!(report.inputs, 2);
        assert_eq!(report.outputs.len(), 1);
        let bundle = fs::read_to_string(&report.outputs[0]).unwrap();
        let a = bundle.find(".a").unwrap();
        let b = bundle.find(".b").unwrap();
        assert!(a < b);
        assert_eq!(
            report.events,
            vec![ReloadEvent::Css {
                path: "style/main.min.css".to_string()
            }]
        );
    }

    #[test]
    fn test_css_bundle_adds_vendor_prefixes() {
        let (temp, config) = project();
        write(
            temp.path(),
            "src/css/flex.css",
            ".box { user-select: none }",
        );

        let report = Stage::build(StageKind::Css, &config)
            .unwrap()
            .run(&config)
            .unwrap();

        let bundle = fs::read_to_string(&report.outputs[0]).unwrap();
        assert!(bundle.contains("-webkit-user-select"));
    }

    // ==================== sass stage tests ====================

    #[test]
    fn test_sass_writes_bundle_and_map() {
        let (temp, config) = project();
        write(temp.path(), "src/style/_vars.scss", "$accent: #ff0000;");
        write(
            temp.path(),
            "src/style/main.scss",
            "@import 'vars';\n.title { color: $accent; .inner { display: flex; } }",
        );

        let report = Stage::build(StageKind::Sass, &config)
            .unwrap()
            .run(&config)
            .unwrap();

        let css_path = temp.path().join("dist/style/main.min.css");
        let map_path = temp.path().join("dist/style/main.min.css.map");
        assert_eq!(report.outputs, vec![css_path.clone(), map_path.clone()]);

        let css = fs::read_to_string(css_path).unwrap();
        assert!(css.contains(".title .inner"));
        assert!(css.ends_with("/*# sourceMappingURL=main.min.css.map */\n"));
        let map = fs::read_to_string(map_path).unwrap();
        assert!(map.contains("\"mappings\""));
    }

    #[test]
    fn test_sass_compile_error_keeps_previous_bundle() {
        let (temp, config) = project();
        write(temp.path(), "src/style/main.scss", ".ok { color: red; }");
        let stage = Stage::build(StageKind::Sass, &config).unwrap();
        stage.run(&config).unwrap();
        let bundle = temp.path().join("dist/style/main.min.css");
        let before = fs::read(&bundle).unwrap();

        write(temp.path(), "src/style/main.scss", ".broken { color: red; ");
        let err = stage.run(&config).unwrap_err();

        assert!(matches!(err, BuildError::Compile { stage: "sass", .. }));
        assert_eq!(fs::read(&bundle).unwrap(), before);
    }

    #[test]
    fn test_css_compile_error_keeps_previous_bundle() {
        let (temp, config) = project();
        write(temp.path(), "src/css/a.css", ".ok { color: red }");
        let stage = Stage::build(StageKind::Css, &config).unwrap();
        stage.run(&config).unwrap();
        let bundle = temp.path().join("dist/style/main.min.css");
        let before = fs::read(&bundle).unwrap();

        write(temp.path(), "src/css/b.css", "..broken { color: red }");
        let err = stage.run(&config).unwrap_err();

        assert!(matches!(err, BuildError::Compile { stage: "css", .. }));
        assert_eq!(fs::read(&bundle).unwrap(), before);
    }

    // ==================== script stage tests ====================

    #[test]
    fn test_scripts_bundle_and_map() {
        let (temp, config) = project();
        write(
            temp.path(),
            "src/js/a.js",
            "function greet(name) { return 'hello ' + (name ?? 'nobody'); }\n",
        );
        write(temp.path(), "src/js/b.js", "console.log(greet(window.user?.name));\n");

        let report = Stage::build(StageKind::Scripts, &config)
            .unwrap()
            .run(&config)
            .unwrap();

        let js_path = temp.path().join("dist/scripts/main.min.js");
        let map_path = temp.path().join("dist/scripts/main.min.js.map");
        assert_eq!(report.outputs, vec![js_path.clone(), map_path.clone()]);

        let js = fs::read_to_string(js_path).unwrap();
        assert!(!js.contains("??"), "nullish coalescing is lowered: {js}");
        assert!(!js.contains("?."), "optional chaining is lowered: {js}");
        assert!(js.contains("console.log"));
        assert!(js.ends_with("//# sourceMappingURL=main.min.js.map\n"));
        assert!(report.events.is_empty());
    }

    #[test]
    fn test_scripts_syntax_error_writes_nothing() {
        let (temp, config) = project();
        write(temp.path(), "src/js/bad.js", "function ( {");

        let err = Stage::build(StageKind::Scripts, &config)
            .unwrap()
            .run(&config)
            .unwrap_err();

        assert!(matches!(err, BuildError::Compile { stage: "scripts", .. }));
        assert!(!temp.path().join("dist/scripts/main.min.js").exists());
    }

    // ==================== determinism tests ====================

    #[test]
    fn test_repeated_runs_are_byte_identical() {
        let (temp, config) = project();
        write(temp.path(), "src/css/a.css", ".a { transition: all 1s }");
        write(temp.path(), "src/js/a.js", "let x = 1; console.log(x);");

        let run = |kind| {
            let report = Stage::build(kind, &config).unwrap().run(&config).unwrap();
            report
                .outputs
                .iter()
                .map(|p| fs::read(p).unwrap())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(StageKind::Css), run(StageKind::Css));
        assert_eq!(run(StageKind::Scripts), run(StageKind::Scripts));
    }

    // ==================== helper tests ====================

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/p/dist/style"), Path::new("/p/src/style/main.scss")),
            "../../src/style/main.scss"
        );
        assert_eq!(
            relative_to(Path::new("/p/dist"), Path::new("/p/dist/a.js")),
            "a.js"
        );
    }

    #[test]
    fn test_reload_event_json() {
        let json = serde_json::to_string(&ReloadEvent::Reload).unwrap();
        assert_eq!(json, r#"{"type":"reload"}"#);
        let json = serde_json::to_string(&ReloadEvent::Css {
            path: "style/main.min.css".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"css","path":"style/main.min.css"}"#);
    }
}
