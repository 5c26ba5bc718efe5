//! GeoQuorum Error Types

use thiserror::Error;

/// Result type alias for GeoQuorum operations
pub type Result<T> = std::result::Result<T, Error>;

/// GeoQuorum error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    // Input errors
    #[error("Malformed coordinate row at line {line}: {reason}")]
    Input { line: usize, reason: String },

    // Emulation errors
    #[error("Cannot resolve address of '{sandbox}': {reason}")]
    Resolution { sandbox: String, reason: String },

    #[error("Command '{command}' failed on '{sandbox}': {output}")]
    Command {
        sandbox: String,
        command: String,
        output: String,
    },

    #[error("Command '{command}' timed out on '{sandbox}'")]
    CommandTimeout { sandbox: String, command: String },

    #[error("Peer '{0}' has no root shaping discipline installed")]
    NotInitialized(String),

    // Topology errors
    #[error("Topology error: {0}")]
    Topology(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error only affects a single peer pair.
    ///
    /// Pair-local errors are recorded in the pair's result and never stop
    /// the remaining installs.
    pub fn is_pair_local(&self) -> bool {
        matches!(
            self,
            Error::Resolution { .. }
                | Error::Command { .. }
                | Error::CommandTimeout { .. }
                | Error::NotInitialized(_)
        )
    }

    /// Check if this error was caused by a command timing out
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CommandTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_local_classification() {
        let err = Error::Command {
            sandbox: "node1".into(),
            command: "tc qdisc show".into(),
            output: "RTNETLINK answers: Operation not permitted".into(),
        };
        assert!(err.is_pair_local());
        assert!(!err.is_timeout());

        let err = Error::CommandTimeout {
            sandbox: "node1".into(),
            command: "tc qdisc show".into(),
        };
        assert!(err.is_pair_local());
        assert!(err.is_timeout());

        assert!(!Error::Config("bad".into()).is_pair_local());
        assert!(!Error::Cancelled.is_pair_local());
    }
}
