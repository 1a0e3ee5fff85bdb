//! Process-wide logging setup
//!
//! Libraries only emit `tracing` events; installing a subscriber is left to
//! the embedding program, which calls `init_logging` once at startup.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOGGING: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "off",
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
///
/// Returns false if logging was already initialized by an earlier call.
pub fn init_logging(verbosity: Verbosity) -> bool {
    let mut installed = false;
    LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(verbosity.as_filter()));
        // another subscriber may already be installed by the host program
        installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_target(false)
            .try_init()
            .is_ok();
    });
    installed
}
