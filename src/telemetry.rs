//! Structured logging for the control plane.
//!
//! The controller only emits `tracing` events; installing a subscriber is left
//! to the embedding process through [`init_logging`] or [`LoggingConfig::init`].
//!
//! ```rust,no_run
//! use shardctl::telemetry::{LogFormat, LoggingConfig, init_logging};
//!
//! init_logging(LogFormat::from_env())?;
//!
//! // Quieter setup for a node agent embedding the controller.
//! // LoggingConfig::new(LogFormat::Json).default_directive("warn,shardctl=info").init()?;
//! # Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
//! ```
//!
//! `LOG_FORMAT` selects `json` or `pretty` output. `RUST_LOG` overrides the
//! default directive.

use std::fmt;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const DEFAULT_DIRECTIVE: &str = "info";

pub type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line output for terminals.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        })
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl LogFormat {
    /// Format named by `LOG_FORMAT`; unset or unknown values give `Pretty`.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
    /// Include the module path of each event.
    pub with_target: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            default_directive: DEFAULT_DIRECTIVE.to_string(),
            with_target: true,
        }
    }

    pub fn default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }

    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(&self) -> InitResult {
        let registry = tracing_subscriber::registry().with(self.env_filter());
        match self.format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_current_span(false)
                        .with_target(self.with_target),
                )
                .try_init()?,
            LogFormat::Pretty => registry
                .with(tracing_subscriber::fmt::layer().with_target(self.with_target))
                .try_init()?,
        }

        tracing::debug!(format = %self.format, directive = %self.default_directive, "Logging initialized");
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(LogFormat::default())
    }
}

/// Install a subscriber with the default directive.
pub fn init_logging(format: LogFormat) -> InitResult {
    LoggingConfig::new(format).init()
}
