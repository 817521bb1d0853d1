use crate::constants::LOGIN_FAILED_MESSAGE;

/// Reasons a note or message submission is rejected before it reaches the
/// background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid message")]
    Invalid,
    #[error("Invalid or empty message")]
    Empty,
    #[error("No parent id identified for response")]
    MissingParent,
    #[error("Invalid recipient")]
    InvalidRecipient,
}

#[derive(Debug, thiserror::Error)]
pub enum BijaError {
    #[error("Invalid key format")]
    InvalidKeyFormat,
    /// Wrong password, corrupted ciphertext or unusable stored key.
    /// Deliberately carries no detail.
    #[error("Incorrect credentials")]
    IncorrectCredentials,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("Background task failed: {0}")]
    Background(String),
}

impl BijaError {
    /// Message safe to show to the user.
    ///
    /// Key format and credential failures collapse into one message so a
    /// caller cannot tell which one happened.
    pub fn user_message(&self) -> String {
        match self {
            BijaError::InvalidKeyFormat | BijaError::IncorrectCredentials => {
                LOGIN_FAILED_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type BijaResult<T> = Result<T, BijaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_errors_share_user_message() {
        assert_eq!(
            BijaError::InvalidKeyFormat.user_message(),
            BijaError::IncorrectCredentials.user_message()
        );
        assert_eq!(
            BijaError::IncorrectCredentials.user_message(),
            "Incorrect key or password"
        );
    }

    #[test]
    fn test_validation_messages() {
        assert_eq!(
            BijaError::from(ValidationError::Empty).user_message(),
            "Invalid or empty message"
        );
        assert_eq!(
            ValidationError::MissingParent.to_string(),
            "No parent id identified for response"
        );
        assert_eq!(ValidationError::Invalid.to_string(), "Invalid message");
    }
}
