//! # Observability
//!
//! Installs the global `tracing` subscriber for the fan-out service.
//!
//! `RUST_LOG` still applies; the configured level is added as a directive
//! for this crate on top of it.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Configuration for [`init`].
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Level for `llm_fanout` events.
    pub level: Level,
    pub target: LogTarget,
    /// Include span enter/exit events (useful for orchestrator timings).
    pub with_span_events: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            target: LogTarget::default(),
            with_span_events: false,
        }
    }
}

impl ObservabilityConfig {
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.with_span_events = enable;
        self
    }

    /// The filter directive contributed for this crate.
    pub fn directive(&self) -> String {
        format!("llm_fanout={}", self.level)
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogTarget {
    /// stdout
    #[default]
    Console,
    /// Truncates and writes to the file at this path.
    File(String),
}

/// Installs the global subscriber.
///
/// Call once at the start of `main`.
///
/// # Errors
///
/// Fails if the directive does not parse, the log file cannot be created,
/// or a global subscriber is already installed.
pub fn init(config: ObservabilityConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::from_default_env().add_directive(config.directive().parse()?);
    let span_events = if config.with_span_events {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.target {
        LogTarget::Console => {
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_span_events(span_events);
            subscriber.with(layer).try_init()?;
        }
        LogTarget::File(path) => {
            let file = std::fs::File::create(path)?;
            let layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_span_events(span_events);
            subscriber.with(layer).try_init()?;
        }
    };

    Ok(())
}
