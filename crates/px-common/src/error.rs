use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// An interface or distribution could not be resolved.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// The server process could not be started.
    #[error("failed to launch {command}: {reason}")]
    Launch { command: String, reason: String },

    /// A requested address or rule is already present on the host.
    /// Recoverable: callers treat this as idempotent success.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A non-idempotent failure while installing a rule or address.
    #[error("rule application failed: {0}")]
    RuleApplication(String),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One or more failures encountered while reversing acquired resources.
///
/// Carries every resource that could not be cleanly released so the
/// operator knows what may need manual cleanup on the host.
#[derive(Debug)]
pub struct TeardownError {
    failures: Vec<(String, String)>,
}

impl TeardownError {
    pub fn new(failures: Vec<(String, String)>) -> Self {
        Self { failures }
    }

    /// The (resource, error) pairs, in the order the releases were attempted.
    pub fn failures(&self) -> &[(String, String)] {
        &self.failures
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to release {} resource(s):", self.failures.len())?;
        for (resource, reason) in &self.failures {
            write!(f, " [{resource}: {reason}]")?;
        }
        write!(f, "; manual host cleanup may be required")
    }
}

impl std::error::Error for TeardownError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_error_lists_resources() {
        let err = TeardownError::new(vec![
            ("masquerade rules".into(), "iptables failed".into()),
            ("address 10.94.0.1/16 on eth0".into(), "no such device".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 resource(s)"));
        assert!(msg.contains("masquerade rules"));
        assert!(msg.contains("address 10.94.0.1/16 on eth0"));
        assert!(msg.contains("manual host cleanup"));
    }

    #[test]
    fn test_already_exists_message() {
        let err = Error::AlreadyExists("address 10.94.0.1/16".into());
        assert_eq!(err.to_string(), "address 10.94.0.1/16 already exists");
    }
}
