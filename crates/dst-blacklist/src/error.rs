//! Error types for the destination blacklist

use thiserror::Error;

/// Errors returned by blacklist operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlacklistError {
    /// The shared arena refused an allocation
    #[error("Out of shared memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// The blacklist memory budget is full and eviction could not make room
    #[error("Blacklist full: {used} of {budget} bytes in use, cannot admit {requested} more")]
    CapacityExceeded {
        used: usize,
        budget: usize,
        requested: usize,
    },

    /// The blacklist was turned off at init or at runtime
    #[error("dst blacklist support disabled")]
    Disabled,

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operator supplied an address that does not parse
    #[error("Malformed ip address: {0}")]
    InvalidAddress(String),

    /// Protocol number outside of the accepted range
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(u8),

    /// Counter name not known to the stats surface
    #[error("unknown dst blacklist stat parameter: {0}")]
    UnknownStat(String),

    /// Operator command parameters missing or of the wrong type
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Operator command name not known to the rpc surface
    #[error("Method not found: {0}")]
    UnknownMethod(String),

    /// The periodic maintenance timer could not be registered
    #[error("Timer registration failed: {0}")]
    Timer(String),
}

impl BlacklistError {
    /// Fault code reported to operators for this error
    pub fn fault_code(&self) -> u16 {
        match self {
            BlacklistError::InvalidAddress(_)
            | BlacklistError::InvalidParams(_)
            | BlacklistError::UnknownProtocol(_)
            | BlacklistError::CapacityExceeded { .. }
            | BlacklistError::OutOfMemory { .. } => 400,
            BlacklistError::UnknownMethod(_) => 404,
            _ => 500,
        }
    }

    /// Whether the caller may simply carry on without recording the destination
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            BlacklistError::CapacityExceeded { .. } | BlacklistError::Disabled
        )
    }
}

pub type Result<T> = std::result::Result<T, BlacklistError>;
