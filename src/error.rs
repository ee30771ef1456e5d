//! Error taxonomy shared by every component.
//!
//! Each variant maps onto one failure class a caller can act on. None of them
//! is ever retried automatically.

use crate::config::Environment;

/// Errors surfaced to callers of the assistant.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Malformed input, rejected before any external call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Role assumption or trust verification failed.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Unknown, already consumed, or expired action.
    #[error("Action not found. It may have expired or already been applied; please request the change again.")]
    NotFound,

    /// Remote resource creation failed.
    #[error("Provisioning error: {message}")]
    Provisioning {
        message: String,
        hint: Option<String>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            hint: None,
        }
    }

    pub fn provisioning_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP-equivalent status code for this failure class.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Authorization(_) => 403,
            Self::NotFound => 404,
            Self::Provisioning { .. } => 502,
            Self::Internal(_) => 500,
        }
    }

    /// Remediation hint, when one is known.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Provisioning { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }

    /// Message safe to show to the end user.
    ///
    /// Internal details are only exposed in development.
    pub fn public_message(&self, environment: Environment) -> String {
        match self {
            Self::Internal(_) if environment == Environment::Production => {
                "An unexpected error occurred. Please try again later.".to_string()
            }
            Self::Provisioning {
                message,
                hint: Some(hint),
            } => format!("{}\n💡 {}", message, hint),
            Self::Provisioning { message, hint: None } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
