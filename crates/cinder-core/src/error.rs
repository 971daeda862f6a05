//! Error types shared across cinder crates.

/// The result type used throughout cinder-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared foundation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier failed to parse.
    #[error("invalid id: {message}")]
    InvalidId {
        /// Description of the parse failure.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::InvalidId {
            message: "not a ulid".into(),
        };
        assert!(err.to_string().contains("invalid id"));
    }

    #[test]
    fn configuration_display() {
        let err = Error::configuration("missing CINDER_STORE_URI");
        assert!(err.to_string().contains("CINDER_STORE_URI"));
    }
}
