//! Terminal logging with colored module prefixes.
//!
//! ```ignore
//! log!("sass"; "wrote {}", path.display());
//! debug!("watch"; "raw event: {:?}", event);
//! ```

use owo_colors::{OwoColorize, Stream};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global verbose flag (set by --verbose)
static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(v: bool) {
    VERBOSE.store(v, Ordering::SeqCst);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

/// Log a message with a colored module prefix
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Log a message only when --verbose is enabled
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

pub fn log(module: &str, message: &str) {
    let prefix = format!("[{module}]");
    let mut stderr = std::io::stderr().lock();
    let _ = match module {
        "error" | "failed" => writeln!(
            stderr,
            "{} {}",
            prefix.if_supports_color(Stream::Stderr, |p| p.red()),
            message
        ),
        "watch" | "serve" | "reload" => writeln!(
            stderr,
            "{} {}",
            prefix.if_supports_color(Stream::Stderr, |p| p.magenta()),
            message
        ),
        "deploy" | "archive" | "clean" => writeln!(
            stderr,
            "{} {}",
            prefix.if_supports_color(Stream::Stderr, |p| p.yellow()),
            message
        ),
        _ => writeln!(
            stderr,
            "{} {}",
            prefix.if_supports_color(Stream::Stderr, |p| p.cyan()),
            message
        ),
    };
}
