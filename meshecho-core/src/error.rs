//! Error taxonomy of the echo bot. Startup errors are fatal; delivery errors are per message.

use crate::delivery::DeliveryError;
use crate::destination::NamespaceError;
use crate::identity::IdentityError;

#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("delivery submission failed: {0}")]
    DeliverySubmission(#[from] DeliveryError),
}

impl From<NamespaceError> for EchoError {
    fn from(e: NamespaceError) -> Self {
        EchoError::Configuration(e.to_string())
    }
}

impl EchoError {
    /// Errors that must stop the process before it enters the main loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EchoError::DeliverySubmission(_))
    }
}

pub type Result<T> = std::result::Result<T, EchoError>;
