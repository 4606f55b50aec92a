use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::env;

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// Knobs for the global subscriber.
#[derive(Clone, Debug)]
pub struct TracingOptions {
    /// Directive used when `RUST_LOG` is not set.
    pub default_filter: String,
    /// Whether to colourise output; defaults to "stdout is a terminal".
    pub ansi: bool,
    /// Emit the target module path next to every event.
    pub with_target: bool,
    /// When set, a chrome trace is written to this file as well.
    pub chrome_trace: Option<PathBuf>,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            ansi: std::io::stdout().is_terminal(),
            with_target: true,
            chrome_trace: None,
        }
    }
}

impl TracingOptions {
    /// Defaults plus `SPIRAL_LOG_ANSI` and `SPIRAL_TRACE_CHROME`.
    pub fn from_env() -> Result<Self, InitError> {
        let mut options = Self::default();
        if let Some(ansi) = env::flag("SPIRAL_LOG_ANSI").map_err(InitError::Env)? {
            options.ansi = ansi;
        }
        options.chrome_trace = env::parse::<PathBuf>("SPIRAL_TRACE_CHROME")
            .map_err(InitError::Env)?;
        Ok(options)
    }

    pub fn with_default_filter(mut self, directive: impl Into<String>) -> Self {
        self.default_filter = directive.into();
        self
    }
}

/// Configures the global tracing subscriber from the environment.
pub fn init_tracing() -> Result<(), InitError> {
    init_tracing_with(TracingOptions::from_env()?)
}

/// Configures the global tracing subscriber with explicit options.
pub fn init_tracing_with(options: TracingOptions) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_filter.as_str()));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(options.with_target)
        .with_ansi(options.ansi);

    match options.chrome_trace {
        Some(path) => {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            if let Some(cell) = CHROME_GUARD.get() {
                if let Ok(mut slot) = cell.lock() {
                    *slot = Some(guard);
                }
            } else {
                let _ = CHROME_GUARD.set(Mutex::new(Some(guard)));
            }
            Registry::default()
                .with(filter)
                .with(fmt_layer)
                .with(chrome_layer)
                .try_init()
                .map_err(|err| InitError::Subscriber(err.to_string()))?;
        }
        None => {
            Registry::default()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|err| InitError::Subscriber(err.to_string()))?;
        }
    }

    tracing::debug!("tracing subscriber installed");
    Ok(())
}

/// Like [`init_tracing`] but treats a second initialisation as success and
/// logs any other failure instead of returning it.
pub fn ensure_tracing() {
    match init_tracing() {
        Ok(()) | Err(InitError::AlreadyInitialised) => {}
        Err(err) => eprintln!("failed to initialise tracing subscriber: {err}"),
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("invalid tracing environment: {0}")]
    Env(crate::env::ConfigError),
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}
