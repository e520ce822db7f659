use std::path::PathBuf;

use thiserror::Error;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors for this crate.
///
/// Transient conditions are deliberately not represented here: lock
/// contention surfaces as `Ok(None)` from the reservation layer and a
/// command deadline surfaces as [`CmdOutcome::TimedOut`], both of which
/// the caller handles as data.
///
/// [`CmdOutcome::TimedOut`]: crate::runner::CmdOutcome::TimedOut
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed or missing config file {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("No plugin registered for identifier {0:?}")]
    PluginResolution(String),

    #[error("Cannot create lock file under {path:?}: {source}")]
    LockSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command {0:?} not found on the host")]
    CommandNotFound(String),

    #[error("No device of model {model:?} and type {device_type:?} in the topology")]
    NoDevice { model: String, device_type: String },

    #[error("Gave up reserving a device after {0} attempts")]
    ReserveAttemptsExhausted(u64),

    #[error("Test plan contains no test cases")]
    NoTestCases,

    #[error("Driver error: {0}")]
    Driver(#[from] anyhow::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_file() {
        let err = Error::config("/etc/aft/platform.cfg", "missing key \"regex\"");
        assert!(err.to_string().contains("/etc/aft/platform.cfg"));
        assert!(err.to_string().contains("missing key"));
    }

    #[test]
    fn display_names_the_unresolved_plugin() {
        let err = Error::PluginResolution("gpiocutter".into());
        assert!(err.to_string().contains("gpiocutter"));
    }
}
