//! Script stage: concatenate, lower syntax to the browser target, minify.

use std::path::{Path, PathBuf};

use oxc::allocator::Allocator;
use oxc::codegen::{Codegen, CodegenOptions, CommentOptions};
use oxc::mangler::MangleOptions;
use oxc::minifier::{CompressOptions, Minifier, MinifierOptions};
use oxc::parser::Parser;
use oxc::semantic::SemanticBuilder;
use oxc::span::SourceType;
use oxc::transformer::{EngineTargets, TransformOptions, Transformer};

use super::{read_to_string, Output};
use crate::config::Config;
use crate::error::{BuildError, Result};

/// Minified code and its source map JSON
#[derive(Debug)]
pub struct ScriptBundle {
    pub code: String,
    pub map: Option<String>,
}

/// Lower `source` to `target` (e.g. "es2015") and minify it.
///
/// `source_name` is recorded in the source map as the original file.
pub fn bundle_scripts(
    source: &str,
    source_name: &Path,
    target: &str,
) -> std::result::Result<ScriptBundle, String> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::cjs()).parse();
    if let Some(error) = parsed.errors.first() {
        return Err(error.to_string());
    }
    let mut program = parsed.program;

    let options = TransformOptions::from_target(target).map_err(|e| e.to_string())?;
    let scoping = SemanticBuilder::new()
        .build(&program)
        .semantic
        .into_scoping();
    let transformed =
        Transformer::new(&allocator, source_name, &options).build_with_scoping(scoping, &mut program);
    if let Some(error) = transformed.errors.first() {
        return Err(error.to_string());
    }

    // Keep the compressor from re-introducing syntax the transformer just lowered
    let engine_targets = EngineTargets::from_target(target)?;
    let minified = Minifier::new(MinifierOptions {
        mangle: Some(MangleOptions::default()),
        compress: Some(CompressOptions {
            target: engine_targets,
            ..CompressOptions::smallest()
        }),
    })
    .minify(&allocator, &mut program);

    let generated = Codegen::new()
        .with_options(CodegenOptions {
            minify: true,
            comments: CommentOptions::disabled(),
            source_map_path: Some(source_name.to_path_buf()),
            ..CodegenOptions::default()
        })
        .with_scoping(minified.scoping)
        .build(&program);

    Ok(ScriptBundle {
        code: generated.code,
        map: generated.map.map(|map| map.to_json_string()),
    })
}

/// Concatenate the inputs in glob order and emit the minified bundle with its map
pub(super) fn bundle(
    inputs: &[PathBuf],
    base: &Path,
    destination: &Path,
    config: &Config,
) -> Result<Vec<Output>> {
    let mut source = String::new();
    for src in inputs {
        source.push_str(&read_to_string(src)?);
        if !source.ends_with('\n') {
            source.push('\n');
        }
    }

    let bundle_name = &config.bundles.script;
    // The map points at the concatenated, unminified bundle
    let source_name = PathBuf::from(bundle_name.replace(".min.js", ".js"));
    let bundled = bundle_scripts(&source, &source_name, config.targets.es_target).map_err(
        |message| BuildError::Compile {
            stage: "scripts",
            path: match inputs {
                [single] => single.clone(),
                _ => base.to_path_buf(),
            },
            message,
        },
    )?;

    let map_name = format!("{bundle_name}.map");
    let mut outputs = vec![Output {
        path: destination.join(bundle_name),
        contents: format!("{}\n//# sourceMappingURL={map_name}\n", bundled.code).into_bytes(),
    }];
    if let Some(map) = bundled.map {
        outputs.push(Output {
            path: destination.join(map_name),
            contents: map.into_bytes(),
        });
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_scripts_minifies() {
        let out = bundle_scripts(
            "function add(first, second) {\n  return first + second;\n}\nconsole.log(add(1, 2));\n",
            Path::new("main.js"),
            "es2015",
        )
        .unwrap();
        assert!(!out.code.contains("first"), "locals are mangled: {}", out.code);
        assert!(out.code.contains("console.log"));
        assert!(out.map.is_some());
    }

    #[test]
    fn test_bundle_scripts_rejects_syntax_errors() {
        let err = bundle_scripts("let = ;", Path::new("main.js"), "es2015");
        assert!(err.is_err());
    }

    #[test]
    fn test_bundle_scripts_rejects_unknown_target() {
        let err = bundle_scripts("1;", Path::new("main.js"), "es1999");
        assert!(err.is_err());
    }
}
