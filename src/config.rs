//! CLI configuration and runtime settings.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::error::{BuildError, Result};
use crate::paths::PathRegistry;

/// Front-end asset pipeline: bundle, compress, watch, archive, deploy
#[derive(Parser, Debug)]
#[command(name = "assetflow")]
#[command(version)]
#[command(about = "Front-end asset pipeline: bundle, compress, watch, archive, deploy")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project root directory
    #[arg(short, long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Number of parallel image workers
    #[arg(short, long, global = true, default_value_t = num_cpus::get())]
    pub jobs: usize,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Style stage used by the build, start and compress pipelines
    #[arg(long, global = true, value_enum, default_value_t = StyleVariant::Sass)]
    pub style: StyleVariant,

    /// JPEG re-encode quality (1-100)
    #[arg(long, global = true, default_value_t = 75)]
    pub jpeg_quality: u8,

    /// PNG optimization level (0-7)
    #[arg(long, global = true, default_value_t = 2)]
    pub png_level: u8,

    /// Strip SVG ids that nothing references
    #[arg(long, global = true)]
    pub svg_cleanup_ids: bool,

    /// Preview server port
    #[arg(long, global = true, default_value_t = 3000)]
    pub port: u16,

    /// Live reload websocket port
    #[arg(long, global = true, default_value_t = 35729)]
    pub reload_port: u16,

    /// Re-archive the output tree whenever it changes in watch mode
    #[arg(long, global = true)]
    pub auto_archive: bool,

    /// What to do with changes that arrive while their stage is running
    #[arg(long, global = true, value_enum, default_value_t = OverlapPolicy::Queue)]
    pub overlap: OverlapPolicy,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Clean, then produce all assets
    Build,
    /// Produce all assets, then watch and serve
    Start,
    /// Clean, produce all assets, then archive the output tree
    Compress,
    /// Copy the HTML entry
    Html,
    /// Prefix and bundle plain CSS
    Css,
    /// Compile, prefix and bundle the SASS entry
    Sass,
    /// Downgrade, bundle and minify scripts
    Scripts,
    /// Compress images
    Images,
    /// Copy fonts
    Fonts,
    /// Delete the output and archive directories
    Clean,
    /// Archive the output tree into a single zip
    Archive,
    /// Watch and serve without an initial build
    Watch,
    /// Upload newer output files over FTP
    Deploy,
}

/// Which style stage the pipelines use
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleVariant {
    /// Plain CSS files, prefixed and concatenated
    Css,
    /// A single SASS entry compiled with a source map
    Sass,
}

/// Watch-mode handling of changes that arrive during a running stage
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Coalesce into one follow-up run
    Queue,
    /// Discard them
    Drop,
}

/// Image compression settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSettings {
    pub jpeg_quality: u8,
    pub png_level: u8,
    pub svg_preserve_ids: bool,
    pub svg_remove_viewbox: bool,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 75,
            png_level: 2,
            svg_preserve_ids: true,
            svg_remove_viewbox: true,
        }
    }
}

/// Minimum browser versions for prefixing and syntax downgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserTargets {
    pub chrome: u32,
    pub firefox: u32,
    pub safari: u32,
    pub edge: u32,
    pub ios_saf: u32,
    /// ECMAScript version scripts are lowered to
    pub es_target: &'static str,
}

impl Default for BrowserTargets {
    fn default() -> Self {
        Self {
            chrome: 60,
            firefox: 60,
            safari: 11,
            edge: 16,
            ios_saf: 11,
            es_target: "es2015",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSettings {
    pub port: u16,
    pub reload_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub auto_archive: bool,
    pub overlap: OverlapPolicy,
}

/// Output bundle names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleNames {
    pub style: String,
    pub script: String,
    pub archive: String,
}

impl Default for BundleNames {
    fn default() -> Self {
        Self {
            style: "main.min.css".to_string(),
            script: "main.min.js".to_string(),
            archive: "dist.zip".to_string(),
        }
    }
}

/// Immutable runtime configuration, built once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub paths: PathRegistry,
    pub style: StyleVariant,
    pub jobs: usize,
    pub verbose: bool,
    pub bundles: BundleNames,
    pub images: ImageSettings,
    pub targets: BrowserTargets,
    pub serve: ServeSettings,
    pub watch: WatchSettings,
}

impl Config {
    /// Create Config from CLI arguments
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if !(1..=100).contains(&cli.jpeg_quality) {
            return Err(BuildError::config(format!(
                "jpeg quality must be between 1 and 100, got {}",
                cli.jpeg_quality
            )));
        }
        if cli.png_level > 7 {
            return Err(BuildError::config(format!(
                "png optimization level must be between 0 and 7, got {}",
                cli.png_level
            )));
        }

        let root = cli.root.canonicalize().unwrap_or_else(|_| cli.root.clone());

        Ok(Config {
            paths: PathRegistry::standard(root),
            style: cli.style,
            jobs: cli.jobs.max(1),
            verbose: cli.verbose,
            bundles: BundleNames::default(),
            images: ImageSettings {
                jpeg_quality: cli.jpeg_quality,
                png_level: cli.png_level,
                svg_preserve_ids: !cli.svg_cleanup_ids,
                ..ImageSettings::default()
            },
            targets: BrowserTargets::default(),
            serve: ServeSettings {
                port: cli.port,
                reload_port: cli.reload_port,
            },
            watch: WatchSettings {
                auto_archive: cli.auto_archive,
                overlap: cli.overlap,
            },
        })
    }

    /// Default configuration for a project root
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Config {
            paths: PathRegistry::standard(root),
            style: StyleVariant::Sass,
            jobs: 1,
            verbose: false,
            bundles: BundleNames::default(),
            images: ImageSettings::default(),
            targets: BrowserTargets::default(),
            serve: ServeSettings {
                port: 3000,
                reload_port: 35729,
            },
            watch: WatchSettings {
                auto_archive: false,
                overlap: OverlapPolicy::Queue,
            },
        }
    }
}
