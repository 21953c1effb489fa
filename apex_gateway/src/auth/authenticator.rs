//! Request authentication: bearer token first, then an optional API key.
//!
//! The bearer path is delegated to [`apex_core::TokenManager`]'s
//! algorithm-family dispatch. The API-key path hashes the presented key
//! with the stored salt and compares digests in constant time via
//! `subtle`, so a timing side-channel can't be used to guess a valid key
//! one byte at a time.

use super::api_key_store::ApiKeyStore;
use apex_core::{CoreError, TokenManager, UserContext};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub struct ApiKeyRecord {
  pub salt: String,
  pub salted_hash: String,
}

fn salted_hash(salt: &str, api_key: &str) -> Vec<u8> {
  let mut hasher = Sha256::new();
  hasher.update(salt.as_bytes());
  hasher.update(api_key.as_bytes());
  hasher.finalize().to_vec()
}

/// Resolve whether `api_key` matches `record` without leaking timing
/// information proportional to the number of matching prefix bytes.
pub fn verify_api_key(api_key: &str, record: &ApiKeyRecord) -> bool {
  let computed = salted_hash(&record.salt, api_key);
  let Ok(stored) = hex::decode(&record.salted_hash) else {
    return false;
  };
  if computed.len() != stored.len() {
    return false;
  }
  computed.ct_eq(&stored).into()
}

pub struct Authenticator {
  token_manager: TokenManager,
  api_key_header: Option<String>,
  api_key_store: Option<Arc<ApiKeyStore>>,
}

impl Authenticator {
  pub fn new(token_manager: TokenManager, api_key_header: Option<String>, api_key_store: Option<Arc<ApiKeyStore>>) -> Self {
    Self { token_manager, api_key_header, api_key_store }
  }

  /// Validate a bearer token, surfacing `apex_core`'s expired/invalid
  /// distinction unchanged.
  pub fn authenticate_bearer(&self, token: &str) -> Result<UserContext, CoreError> {
    let user = self.token_manager.verify_token(token)?;
    if !user.is_active {
      return Err(CoreError::Authentication("account disabled".to_string()));
    }
    Ok(user)
  }

  /// Validate a presented API key against the persistent credential
  /// store. Absent store (feature not configured) is treated the same as
  /// an absent record: `Authentication("invalid")`.
  pub async fn authenticate_api_key(&self, api_key: &str) -> Result<UserContext, CoreError> {
    match &self.api_key_store {
      Some(store) => store.verify(api_key).await,
      None => Err(CoreError::Authentication("invalid".to_string())),
    }
  }

  pub fn api_key_header_name(&self) -> Option<&str> {
    self.api_key_header.as_deref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record_for(api_key: &str, salt: &str) -> ApiKeyRecord {
    ApiKeyRecord { salt: salt.to_string(), salted_hash: hex::encode(salted_hash(salt, api_key)) }
  }

  #[test]
  fn matching_key_verifies() {
    let record = record_for("sk-live-abc123", "pepper");
    assert!(verify_api_key("sk-live-abc123", &record));
  }

  #[test]
  fn mismatched_key_fails() {
    let record = record_for("sk-live-abc123", "pepper");
    assert!(!verify_api_key("sk-live-wrong", &record));
  }

  #[test]
  fn corrupted_stored_hash_fails_closed() {
    let mut record = record_for("sk-live-abc123", "pepper");
    record.salted_hash = "not-hex".to_string();
    assert!(!verify_api_key("sk-live-abc123", &record));
  }
}
