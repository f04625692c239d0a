//! Error types for the webhook runtime

use thiserror::Error;

/// Main error type for webhook runtime operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate minting or parsing error
    #[error("pki error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// Listener setup or shutdown error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_message_is_descriptive() {
        let err = Error::config("webhook name is required");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("name is required"));
    }

    #[test]
    fn pki_errors_convert() {
        let pki = crate::pki::PkiError::Parse("bad pem".to_string());
        let err: Error = pki.into();
        assert!(err.to_string().contains("pki error"));
    }
}
