//! Error types for vbricks-core.

use thiserror::Error;

/// Result type alias for vbricks-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while building or driving a topology.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Name is malformed or already taken
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Brick is not configured enough to be started
    #[error("brick {0} is not configured")]
    BadConfig(String),

    /// Operation does not apply to this kind of object
    #[error("unmanaged type: {0}")]
    UnmanagedType(String),

    /// A plug of the brick has no socket, or a loop was found
    #[error("brick {brick} is not connected: {reason}")]
    NotConnected {
        /// Brick being started
        brick: String,
        /// What is missing
        reason: String,
    },

    /// A peer brick could not be brought up while checking links
    #[error("link check failed for brick {0}")]
    Linkloop(String),

    /// Disk image is already master-locked by another VM
    #[error("disk image {image} is locked by {holder}")]
    DiskLocked {
        /// Image name
        image: String,
        /// Brick holding the master lock
        holder: String,
    },

    /// Read-only image used without a private overlay
    #[error("disk image {0} is read-only and must be used in private mode")]
    LockedImage(String),

    /// Unknown brick, event, socket, image or host
    #[error("not found: {0}")]
    NotFound(String),

    /// Config value could not be parsed or is out of range
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Parameter name
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// Project file could not be parsed
    #[error("parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What went wrong
        reason: String,
    },

    /// Subprocess could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program path
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Settings could not be loaded or stored
    #[error("settings error: {0}")]
    Settings(String),

    /// No async runtime is available to arm timers or bridge tasks
    #[error("scheduler unavailable: {0}")]
    Scheduler(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Build a `NotConnected` error.
    pub fn not_connected(brick: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotConnected {
            brick: brick.into(),
            reason: reason.into(),
        }
    }

    /// Build an `InvalidValue` error.
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Check if the caller has to fix its input (never worth retrying).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidName(_)
                | CoreError::BadConfig(_)
                | CoreError::UnmanagedType(_)
                | CoreError::InvalidValue { .. }
        )
    }

    /// Check if this error comes from link checking.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, CoreError::NotConnected { .. } | CoreError::Linkloop(_))
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(e: config::ConfigError) -> Self {
        CoreError::Settings(e.to_string())
    }
}

impl From<toml::ser::Error> for CoreError {
    fn from(e: toml::ser::Error) -> Self {
        CoreError::Settings(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::not_connected("w1", "plug 0 has no socket");
        assert_eq!(
            err.to_string(),
            "brick w1 is not connected: plug 0 has no socket"
        );
    }

    #[test]
    fn test_taxonomy() {
        assert!(CoreError::BadConfig("sw1".into()).is_validation());
        assert!(!CoreError::BadConfig("sw1".into()).is_connectivity());
        assert!(CoreError::Linkloop("w1".into()).is_connectivity());
        assert!(!CoreError::LockedImage("disk".into()).is_validation());
    }
}
