//! `tracing` subscriber setup for binaries built on this crate.

use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    #[default]
    Normal,
    /// Debug output, including retry and state-machine details.
    Verbose,
}

impl Verbosity {
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    pub fn directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "xpan=error",
            Verbosity::Normal => "xpan=info",
            Verbosity::Verbose => "xpan=debug",
        }
    }
}

/// Installs a compact fmt subscriber. `RUST_LOG` wins over `verbosity` when set.
/// Calling it twice is harmless.
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}
