//! Style stages: plain CSS bundling and SASS compilation.
//!
//! Both variants run every stylesheet through lightningcss with the configured
//! browser targets, which adds the vendor prefixes those targets need.

use std::path::{Path, PathBuf};

use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};
use parcel_sourcemap::SourceMap;

use super::{read_to_string, relative_to, Output};
use crate::config::{BrowserTargets, Config};
use crate::error::{BuildError, Result};

/// lightningcss encodes versions as `major << 16 | minor << 8 | patch`
fn lightning_targets(targets: &BrowserTargets) -> Targets {
    Targets::from(Browsers {
        chrome: Some(targets.chrome << 16),
        firefox: Some(targets.firefox << 16),
        safari: Some(targets.safari << 16),
        edge: Some(targets.edge << 16),
        ios_saf: Some(targets.ios_saf << 16),
        ..Browsers::default()
    })
}

fn print(
    source: &str,
    filename: &str,
    targets: &BrowserTargets,
    minify: bool,
    source_map: Option<&mut SourceMap>,
) -> std::result::Result<String, String> {
    let targets = lightning_targets(targets);
    let mut sheet = StyleSheet::parse(
        source,
        ParserOptions {
            filename: filename.to_string(),
            ..ParserOptions::default()
        },
    )
    .map_err(|e| e.to_string())?;

    sheet
        .minify(MinifyOptions {
            targets,
            ..MinifyOptions::default()
        })
        .map_err(|e| e.to_string())?;

    let result = sheet
        .to_css(PrinterOptions {
            minify,
            targets,
            source_map,
            ..PrinterOptions::default()
        })
        .map_err(|e| e.to_string())?;
    Ok(result.code)
}

/// Add vendor prefixes for `targets`, optionally minifying
pub fn prefix_css(
    source: &str,
    filename: &str,
    targets: &BrowserTargets,
    minify: bool,
) -> std::result::Result<String, String> {
    print(source, filename, targets, minify, None)
}

/// Compile a SASS entry file (imports resolve relative to it) to compressed CSS
pub fn compile_sass(entry: &Path) -> std::result::Result<String, String> {
    let options = grass::Options::default().style(grass::OutputStyle::Compressed);
    grass::from_path(entry, &options).map_err(|e| e.to_string())
}

fn compile_error(stage: &'static str, path: &Path, message: String) -> BuildError {
    BuildError::Compile {
        stage,
        path: path.to_path_buf(),
        message,
    }
}

/// Prefix each file and concatenate them, in glob order, into one bundle
pub(super) fn bundle_css(
    inputs: &[PathBuf],
    destination: &Path,
    config: &Config,
) -> Result<Vec<Output>> {
    let mut bundle = String::new();
    for src in inputs {
        let source = read_to_string(src)?;
        let name = relative_to(destination, src);
        let css = prefix_css(&source, &name, &config.targets, false)
            .map_err(|message| compile_error("css", src, message))?;
        bundle.push_str(&css);
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
    }

    Ok(vec![Output {
        path: destination.join(&config.bundles.style),
        contents: bundle.into_bytes(),
    }])
}

/// Compile the entry, prefix and minify it, and write the bundle with a source map
pub(super) fn bundle_sass(
    inputs: &[PathBuf],
    destination: &Path,
    config: &Config,
) -> Result<Vec<Output>> {
    let Some(entry) = inputs.first() else {
        return Ok(Vec::new());
    };

    // Further entries append to the same bundle
    let mut compiled = String::new();
    for src in inputs {
        let css = compile_sass(src).map_err(|message| compile_error("sass", src, message))?;
        compiled.push_str(&css);
    }

    let name = relative_to(destination, entry);
    let mut map = SourceMap::new("/");
    let index = map.add_source(&name);
    map.set_source_content(index as usize, &compiled)
        .map_err(|e| compile_error("sass", entry, format!("{e:?}")))?;

    let css = print(&compiled, &name, &config.targets, true, Some(&mut map))
        .map_err(|message| compile_error("sass", entry, message))?;
    let json = map
        .to_json(None)
        .map_err(|e| compile_error("sass", entry, format!("{e:?}")))?;

    let bundle_name = &config.bundles.style;
    let map_name = format!("{bundle_name}.map");
    let css = format!("{css}\n/*# sourceMappingURL={map_name} */\n");

    Ok(vec![
        Output {
            path: destination.join(bundle_name),
            contents: css.into_bytes(),
        },
        Output {
            path: destination.join(map_name),
            contents: json.into_bytes(),
        },
    ])
}
