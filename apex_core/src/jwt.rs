//! Bearer-token verification.
//!
//! The gateway never issues access tokens (the auth-service does); it only
//! validates them and derives a [`UserContext`] to forward downstream. Key
//! material is picked by algorithm family: `RS*` verifies against a
//! configured public key file, `HS*` against a configured shared secret.

use crate::error::CoreError;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-algorithm-family key material, loaded once at startup from
/// [`crate::jwt::AuthConfig`] and never re-read from the environment.
#[derive(Clone)]
pub struct AuthConfig {
  pub algorithm: Algorithm,
  /// PEM-encoded public key, required for the `RS*` family.
  pub public_key_pem: Option<String>,
  /// Shared secret, required for the `HS*` family.
  pub shared_secret: Option<String>,
  pub audience: Option<String>,
  pub issuer: Option<String>,
  pub leeway_seconds: u64,
}

/// Validated user identity derived from a bearer token, threaded read-only
/// through the rest of the pipeline once constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserContext {
  pub user_id: String,
  pub username: Option<String>,
  pub email: Option<String>,
  pub tenant_id: Option<String>,
  pub roles: Vec<String>,
  pub permissions: Vec<String>,
  pub is_active: bool,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
  sub: Option<String>,
  user_id: Option<String>,
  #[serde(default)]
  username: Option<String>,
  #[serde(default)]
  email: Option<String>,
  #[serde(default)]
  tenant_id: Option<String>,
  #[serde(default)]
  roles: Option<Value>,
  #[serde(default)]
  permissions: Option<Value>,
  #[serde(default)]
  is_active: Option<bool>,
}

/// Coerce a claim that may arrive as a JSON array of strings or as a single
/// comma-joined string into a `Vec<String>`.
fn coerce_string_list(value: Option<Value>) -> Vec<String> {
  match value {
    Some(Value::Array(items)) => items
      .into_iter()
      .filter_map(|v| v.as_str().map(|s| s.to_string()))
      .collect(),
    Some(Value::String(s)) => s
      .split(',')
      .map(|s| s.trim().to_string())
      .filter(|s| !s.is_empty())
      .collect(),
    _ => Vec::new(),
  }
}

pub struct TokenManager {
  config: AuthConfig,
}

impl TokenManager {
  pub fn new(config: AuthConfig) -> Result<Self, CoreError> {
    match config.algorithm {
      Algorithm::RS256
      | Algorithm::RS384
      | Algorithm::RS512
      | Algorithm::PS256
      | Algorithm::PS384
      | Algorithm::PS512 => {
        if config.public_key_pem.is_none() {
          return Err(CoreError::Internal(
            "RS*/PS* algorithm configured without a public key".to_string(),
          ));
        }
      }
      Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
        if config.shared_secret.is_none() {
          return Err(CoreError::Internal(
            "HS* algorithm configured without a shared secret".to_string(),
          ));
        }
      }
      _ => {
        return Err(CoreError::Internal(format!(
          "unsupported JWT algorithm: {:?}",
          config.algorithm
        )));
      }
    }
    Ok(Self { config })
  }

  fn decoding_key(&self) -> Result<DecodingKey, CoreError> {
    match self.config.algorithm {
      Algorithm::RS256
      | Algorithm::RS384
      | Algorithm::RS512
      | Algorithm::PS256
      | Algorithm::PS384
      | Algorithm::PS512 => {
        let pem = self.config.public_key_pem.as_ref().ok_or_else(|| {
          CoreError::Internal("RS*/PS* algorithm configured without a public key".to_string())
        })?;
        DecodingKey::from_rsa_pem(pem.as_bytes())
          .map_err(|e| CoreError::Internal(format!("invalid public key: {e}")))
      }
      _ => {
        let secret = self.config.shared_secret.as_ref().ok_or_else(|| {
          CoreError::Internal("HS* algorithm configured without a shared secret".to_string())
        })?;
        Ok(DecodingKey::from_secret(secret.as_bytes()))
      }
    }
  }

  /// Verify a bearer token and produce a [`UserContext`].
  ///
  /// Expired tokens surface as `CoreError::Authentication("expired")`;
  /// anything else malformed surfaces as `CoreError::Authentication("invalid")`.
  pub fn verify_token(&self, token: &str) -> Result<UserContext, CoreError> {
    let key = self.decoding_key()?;
    let mut validation = Validation::new(self.config.algorithm);
    validation.leeway = self.config.leeway_seconds;
    if let Some(aud) = &self.config.audience {
      validation.set_audience(&[aud]);
    } else {
      validation.validate_aud = false;
    }
    if let Some(iss) = &self.config.issuer {
      validation.set_issuer(&[iss]);
    }

    let token_data = decode::<RawClaims>(token, &key, &validation)?;
    let claims = token_data.claims;

    let user_id = claims
      .sub
      .or(claims.user_id)
      .ok_or_else(|| CoreError::Authentication("invalid".to_string()))?;

    Ok(UserContext {
      user_id,
      username: claims.username,
      email: claims.email,
      tenant_id: claims.tenant_id,
      roles: coerce_string_list(claims.roles),
      permissions: coerce_string_list(claims.permissions),
      is_active: claims.is_active.unwrap_or(true),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use jsonwebtoken::{EncodingKey, Header, encode};
  use serde_json::json;

  fn hs_config(secret: &str) -> AuthConfig {
    AuthConfig {
      algorithm: Algorithm::HS256,
      public_key_pem: None,
      shared_secret: Some(secret.to_string()),
      audience: None,
      issuer: None,
      leeway_seconds: 5,
    }
  }

  fn sign(secret: &str, claims: &serde_json::Value) -> String {
    encode(
      &Header::new(Algorithm::HS256),
      claims,
      &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
  }

  #[test]
  fn verifies_valid_token_with_array_roles() {
    let manager = TokenManager::new(hs_config("s3cret")).unwrap();
    let now = chrono::Utc::now().timestamp();
    let claims = json!({
      "sub": "u-1",
      "exp": now + 3600,
      "roles": ["admin", "user"],
      "permissions": "read,write",
    });
    let token = sign("s3cret", &claims);

    let ctx = manager.verify_token(&token).unwrap();
    assert_eq!(ctx.user_id, "u-1");
    assert_eq!(ctx.roles, vec!["admin", "user"]);
    assert_eq!(ctx.permissions, vec!["read", "write"]);
    assert!(ctx.is_active);
  }

  #[test]
  fn rejects_expired_token() {
    let manager = TokenManager::new(hs_config("s3cret")).unwrap();
    let now = chrono::Utc::now().timestamp();
    let claims = json!({"sub": "u-1", "exp": now - 3600});
    let token = sign("s3cret", &claims);

    let err = manager.verify_token(&token).unwrap_err();
    assert!(matches!(err, CoreError::Authentication(ref m) if m == "expired"));
  }

  #[test]
  fn rejects_token_without_subject() {
    let manager = TokenManager::new(hs_config("s3cret")).unwrap();
    let now = chrono::Utc::now().timestamp();
    let claims = json!({"exp": now + 3600});
    let token = sign("s3cret", &claims);

    let err = manager.verify_token(&token).unwrap_err();
    assert!(matches!(err, CoreError::Authentication(ref m) if m == "invalid"));
  }

  #[test]
  fn rs_algorithm_without_public_key_is_internal_error() {
    let config = AuthConfig {
      algorithm: Algorithm::RS256,
      public_key_pem: None,
      shared_secret: None,
      audience: None,
      issuer: None,
      leeway_seconds: 0,
    };
    assert!(matches!(
      TokenManager::new(config),
      Err(CoreError::Internal(_))
    ));
  }
}
