//! Common error types

use crate::usb_types::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Device removed")]
    NoDevice,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("USB {operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Session manager is not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Classify a transport failure for the given operation
    ///
    /// Device removal and allocation failures get their own kinds; every
    /// other code is wrapped with the operation that produced it.
    pub fn transport(operation: &'static str, source: TransportError) -> Self {
        match source {
            TransportError::NoDevice => Error::NoDevice,
            TransportError::NoMem => {
                Error::ResourceExhausted(format!("out of memory during {}", operation))
            }
            source => Error::Transport { operation, source },
        }
    }

    /// Numeric transport code, if this error wraps one
    pub fn transport_code(&self) -> Option<i32> {
        match self {
            Error::Transport { source, .. } => Some(source.code()),
            Error::NoDevice => Some(TransportError::NoDevice.code()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(matches!(
            Error::transport("open", TransportError::NoDevice),
            Error::NoDevice
        ));
        assert!(matches!(
            Error::transport("claim interface", TransportError::NoMem),
            Error::ResourceExhausted(_)
        ));

        let err = Error::transport("claim interface", TransportError::Busy);
        assert_eq!(err.transport_code(), Some(-6));
        let msg = format!("{}", err);
        assert!(msg.contains("claim interface"));
    }

    #[test]
    fn test_non_transport_has_no_code() {
        assert_eq!(Error::NotFound("A1".to_string()).transport_code(), None);
        assert_eq!(Error::NoDevice.transport_code(), Some(-4));
    }
}
