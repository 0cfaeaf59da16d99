//! Logging configuration and initialization.
//!
//! Uses tracing with environment-based filtering and optional JSON file
//! output. Import sessions log with structured fields (`session`, `issue`,
//! `asset`) so a single run can be grepped out of interleaved output.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// How the CLI wants its logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// 0 = info, 1 = debug, 2 = debug + backends, 3+ = trace.
    pub verbosity: u8,
    /// Only errors.
    pub quiet: bool,
    /// Also write JSON logs to this file.
    pub json_file: Option<PathBuf>,
}

impl LogOptions {
    fn directives(&self) -> String {
        if self.quiet {
            return "error".to_string();
        }
        match self.verbosity {
            0 if cfg!(debug_assertions) => "gantry=debug".to_string(),
            0 => "gantry=info".to_string(),
            1 => "gantry=debug".to_string(),
            2 => "gantry=debug,rusqlite=debug,reqwest=debug".to_string(),
            _ => "gantry=trace".to_string(),
        }
    }
}

/// Initialize logging for the CLI. `RUST_LOG` wins over the derived filter.
///
/// # Errors
///
/// Returns an error if the filter cannot be built, the JSON log file cannot
/// be created, or a global subscriber is already installed.
pub fn init(options: &LogOptions) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(options.directives()))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_file(cfg!(debug_assertions))
        .with_line_number(cfg!(debug_assertions))
        .with_ansi(std::io::stderr().is_terminal());

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer);

    match &options.json_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let json_layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .json();
            tracing::subscriber::set_global_default(registry.with(json_layer))?;
        }
        None => tracing::subscriber::set_global_default(registry)?,
    }

    Ok(())
}

/// Initialize logging for tests with the test writer.
pub fn init_test_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("gantry=debug,test=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_beats_verbosity() {
        let options = LogOptions {
            verbosity: 3,
            quiet: true,
            json_file: None,
        };
        assert_eq!(options.directives(), "error");
    }

    #[test]
    fn verbosity_tiers() {
        let at = |verbosity| LogOptions {
            verbosity,
            quiet: false,
            json_file: None,
        };
        assert_eq!(at(1).directives(), "gantry=debug");
        assert!(at(2).directives().contains("rusqlite=debug"));
        assert_eq!(at(5).directives(), "gantry=trace");
    }
}
