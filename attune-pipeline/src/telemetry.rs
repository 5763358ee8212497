//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::error::{PipelineError, Result};

/// Install a global fmt subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from `level`
/// (e.g. `"info"` or `"attune_pipeline=debug,warn"`). `json` switches to
/// one JSON object per line.
///
/// # Errors
/// Returns `PipelineError::Setup` if the level is not a valid filter or a
/// global subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| PipelineError::Setup(format!("invalid log level '{level}': {e}")))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| PipelineError::Setup(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_is_rejected_when_env_unset() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(init_tracing("attune=loud", false).is_err());
    }
}
