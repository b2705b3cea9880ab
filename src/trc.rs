//! Tracing configuration and initialization.

use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Output flavor of the subscriber.
enum TrcMode {
    /// Plain, verbose output with span enter/close events.
    Verbose,
    /// Compact output without timestamps.
    Compact,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Trc {
    /// Build from `CONTAINERFS_LOG`, then `RUST_LOG`, then `fallback_level`.
    pub fn from_env_or(fallback_level: &str) -> Self {
        let maybe_env_filter = EnvFilter::try_from_env("CONTAINERFS_LOG")
            .or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            // An explicit filter means someone is debugging; give them everything.
            Ok(env_filter) => Self {
                mode: TrcMode::Verbose,
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Compact,
                env_filter: EnvFilter::new(fallback_level),
            },
        }
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Verbose => tracing_subscriber::fmt()
                .with_env_filter(self.env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
                .finish()
                .try_init(),
            TrcMode::Compact => tracing_subscriber::fmt()
                .with_env_filter(self.env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .compact()
                .finish()
                .try_init(),
        }
    }
}
