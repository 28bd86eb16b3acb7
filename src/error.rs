use thiserror::Error;

/// Error taxonomy shared by every component of the supervisor.
///
/// `CommandRejected`, `MalformedCommand` and `CommunicationFailure` are recovered at the
/// boundary that detected them. `Configuration` is fatal to the load/reload attempt that
/// produced it. `InternalInconsistency` is logged at fatal severity and never crashes
/// the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DcsError {
    #[error("command rejected: {0}")]
    CommandRejected(String),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("communication failure: {0}")]
    CommunicationFailure(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
}

pub type DcsResult<T> = Result<T, DcsError>;

impl DcsError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        DcsError::CommandRejected(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        DcsError::MalformedCommand(msg.into())
    }

    pub fn comm(msg: impl Into<String>) -> Self {
        DcsError::CommunicationFailure(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DcsError::Configuration(msg.into())
    }

    pub fn is_communication_failure(&self) -> bool {
        matches!(self, DcsError::CommunicationFailure(_))
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, DcsError::CommandRejected(_) | DcsError::MalformedCommand(_))
    }
}

impl From<serde_yaml::Error> for DcsError {
    fn from(e: serde_yaml::Error) -> Self {
        DcsError::Configuration(e.to_string())
    }
}

impl From<std::io::Error> for DcsError {
    fn from(e: std::io::Error) -> Self {
        DcsError::Configuration(e.to_string())
    }
}
