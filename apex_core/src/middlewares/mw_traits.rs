//! Seam traits that let the gateway's auth and rate-limit middleware be
//! exercised against mocks instead of a live Redis/Postgres.

use crate::error::CoreError;
use crate::jwt::UserContext;
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenVerifier: Send + Sync {
  fn verify_token(&self, token: &str) -> Result<UserContext, CoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApiKeyVerifier: Send + Sync {
  async fn verify_api_key(&self, api_key: &str) -> Result<bool, CoreError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mock_token_verifier_honors_expectations() {
    let mut mock = MockTokenVerifier::new();
    mock.expect_verify_token().returning(|_| Err(CoreError::Authentication("invalid".to_string())));
    assert!(mock.verify_token("bad-token").is_err());
  }

  #[tokio::test]
  async fn mock_api_key_verifier_honors_expectations() {
    let mut mock = MockApiKeyVerifier::new();
    mock.expect_verify_api_key().returning(|key| Ok(key == "sk-live-good"));
    assert!(mock.verify_api_key("sk-live-good").await.unwrap());
    assert!(!mock.verify_api_key("sk-live-bad").await.unwrap());
  }
}
