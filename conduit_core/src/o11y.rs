//! Tracing subscriber setup.

use crate::config::{LogConfig, LogFormat};
use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Events go to stderr so that command output on stdout stays parseable.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_tracing(cfg: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.default_filter))
        .map_err(|e| Error::InvalidInput(format!("invalid log filter: {e}")))?;
    let registry = tracing_subscriber::registry().with(filter);
    let res = match cfg.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_conflict() {
        let cfg = LogConfig::default();
        let _ = init_tracing(&cfg);
        assert!(matches!(init_tracing(&cfg), Err(Error::Conflict(_))));
    }
}
