//! # assetflow
//!
//! Front-end asset pipeline for small static sites.
//!
//! Source files under `src/` are copied, compiled, downgraded, minified and
//! compressed into `dist/` by a fixed set of transform stages. Stages are
//! composed into sequential pipelines (`build`, `start`, `compress`), can be
//! re-run on file changes with live reload, and the output tree can be zipped
//! or uploaded over FTP.
//!
//! ## Features
//!
//! - SASS compilation and vendor prefixing with source maps
//! - Script syntax downgrade and minification with source maps
//! - Parallel image recompression using Rayon
//! - Watch mode with a preview server and CSS injection
//! - Deterministic ZIP archive of the output tree
//! - Newer-files-only FTP deploy over parallel connections
//!
//! ## Usage
//!
//! ```ignore
//! use assetflow::config::Config;
//! use assetflow::pipeline;
//!
//! let config = Config::for_root("my-site");
//! let report = pipeline::build(&config).run(&config, &shutdown)?;
//! ```

/// Colored terminal logging
#[macro_use]
pub mod logger;

/// CLI configuration and argument parsing
pub mod config;

/// FTP upload of the output tree
pub mod deploy;

/// Error types for all operations
pub mod error;

/// Clean and archive operations
pub mod housekeeping;

/// Asset categories, source globs and destinations
pub mod paths;

/// Named step sequences
pub mod pipeline;

/// Preview server and live reload hub
pub mod serve;

/// Transform stages
pub mod stage;

/// File watching and rebuild dispatch
pub mod watch;
