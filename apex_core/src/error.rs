use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain errors shared by every gateway subsystem that lives in `apex_core`.
///
/// This is intentionally narrower than the old chat-server `CoreError`: a
/// gateway validates and forwards, it does not own a relational schema of
/// business entities, so there is no `ChatValidation`/`UserAlreadyExists`
/// family here.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum CoreError {
  #[error("validation error: {0}")]
  Validation(String),

  #[error("authentication error: {0}")]
  Authentication(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl From<jsonwebtoken::errors::Error> for CoreError {
  fn from(err: jsonwebtoken::errors::Error) -> Self {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
      ErrorKind::ExpiredSignature => CoreError::Authentication("expired".to_string()),
      _ => CoreError::Authentication("invalid".to_string()),
    }
  }
}

impl From<redis::RedisError> for CoreError {
  fn from(err: redis::RedisError) -> Self {
    CoreError::Unavailable(err.to_string())
  }
}

impl From<sqlx::Error> for CoreError {
  fn from(err: sqlx::Error) -> Self {
    CoreError::Unavailable(err.to_string())
  }
}

impl From<serde_json::Error> for CoreError {
  fn from(err: serde_json::Error) -> Self {
    CoreError::Validation(err.to_string())
  }
}
