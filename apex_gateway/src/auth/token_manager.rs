//! Refresh token bookkeeping against the fast KV tier. The gateway never
//! mints tokens itself — the auth-service backend does, via the `/auth/refresh`
//! call in [`crate::auth_router`] — this module only remembers which tokens
//! are currently live so it can answer "is this one still valid" and "forget
//! this one" without a round trip to the backend. Three keys always share one
//! TTL so a token, its owning user's token set, and its rotation family all
//! expire together:
//!
//!   - `refresh_token:{token}`      -> serialized [`StoredRefreshToken`]
//!   - `user_tokens:{user_id}`      -> set of live refresh tokens for that user
//!   - `token_family:{family_id}`   -> set of tokens descended from one login
//!
//! Grounded on the teacher's `generate_refresh_token`/`sha256_hash` pair in
//! spirit (token identity is stored as a hash, never the plaintext),
//! generalized from the teacher's sqlx-backed single-table layout to the
//! three-key fast-KV layout the rotation/session-revocation model calls for.
//!
//! Rotation deletes the old token's record outright rather than tombstoning
//! it: once `store` is called with `old_token` set, a subsequent `validate`
//! of that old token returns `None`, matching a stolen-then-replayed token
//! being rejected rather than silently accepted as "already rotated".

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use apex_core::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
  pub user_id: String,
  pub family_id: String,
  pub issued_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

pub struct StoredRefreshToken {
  pub family_id: String,
  pub expires_at: DateTime<Utc>,
}

pub struct RefreshTokenManager {
  conn: ConnectionManager,
}

fn sha256_hash(value: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(value.as_bytes());
  hex::encode(hasher.finalize())
}

impl RefreshTokenManager {
  pub fn new(conn: ConnectionManager) -> Self {
    Self { conn }
  }

  fn token_key(token: &str) -> String {
    format!("refresh_token:{}", sha256_hash(token))
  }

  fn user_tokens_key(user_id: &str) -> String {
    format!("user_tokens:{user_id}")
  }

  fn family_key(family_id: &str) -> String {
    format!("token_family:{family_id}")
  }

  /// Remember a refresh token minted by the auth-service. `family` carries
  /// a rotation lineage forward across calls; omit it to start a new one
  /// (a fresh login). `old_token`, when set, is deleted as part of the same
  /// pipeline the new token is written in, so there is no window where both
  /// the old and new token validate.
  pub async fn store(
    &self,
    user_id: &str,
    token: &str,
    ttl_seconds: u64,
    family: Option<&str>,
    old_token: Option<&str>,
  ) -> Result<StoredRefreshToken, CoreError> {
    let family_id = family.map(|f| f.to_string()).unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = Utc::now();
    let expires_at = now + chrono::Duration::seconds(ttl_seconds as i64);

    let record = RefreshTokenRecord { user_id: user_id.to_string(), family_id: family_id.clone(), issued_at: now, expires_at };

    let mut conn = self.conn.clone();
    let serialized = serde_json::to_string(&record)?;
    let token_key = Self::token_key(token);
    let user_key = Self::user_tokens_key(user_id);
    let family_key = Self::family_key(&family_id);

    let mut pipe = redis::pipe();
    pipe.atomic();
    if let Some(old_token) = old_token {
      let old_key = Self::token_key(old_token);
      pipe.del(&old_key);
      pipe.srem(&user_key, &old_key);
    }
    pipe
      .set_ex(&token_key, &serialized, ttl_seconds)
      .sadd(&user_key, &token_key)
      .expire(&user_key, ttl_seconds as i64)
      .sadd(&family_key, &token_key)
      .expire(&family_key, ttl_seconds as i64);
    pipe.query_async::<()>(&mut conn).await?;

    Ok(StoredRefreshToken { family_id, expires_at })
  }

  /// Returns `None` for a token that was never stored, has expired, or was
  /// deleted by a rotation — the caller treats all three the same way.
  pub async fn validate(&self, token: &str) -> Result<Option<RefreshTokenRecord>, CoreError> {
    let mut conn = self.conn.clone();
    let raw: Option<String> = conn.get(Self::token_key(token)).await?;
    match raw {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  pub async fn revoke(&self, token: &str) -> Result<(), CoreError> {
    let mut conn = self.conn.clone();
    let key = Self::token_key(token);
    if let Some(raw) = conn.get::<_, Option<String>>(&key).await? {
      let record: RefreshTokenRecord = serde_json::from_str(&raw)?;
      let user_key = Self::user_tokens_key(&record.user_id);
      redis::pipe().atomic().del(&key).srem(&user_key, &key).query_async::<()>(&mut conn).await?;
    }
    Ok(())
  }

  /// Revoke every token belonging to one rotation family, used when token
  /// reuse is detected (a stolen-and-replayed refresh token).
  pub async fn revoke_family(&self, family_id: &str) -> Result<(), CoreError> {
    let mut conn = self.conn.clone();
    let family_key = Self::family_key(family_id);
    let tokens: Vec<String> = conn.smembers(&family_key).await?;
    if tokens.is_empty() {
      return Ok(());
    }
    let mut pipe = redis::pipe();
    pipe.atomic();
    for token_key in &tokens {
      pipe.del(token_key);
    }
    pipe.del(&family_key);
    pipe.query_async::<()>(&mut conn).await?;
    Ok(())
  }

  /// Revoke every refresh token a user holds, across all families — used
  /// by `/auth/revoke` with a broad "log out everywhere" scope.
  pub async fn revoke_all(&self, user_id: &str) -> Result<(), CoreError> {
    let mut conn = self.conn.clone();
    let user_key = Self::user_tokens_key(user_id);
    let tokens: Vec<String> = conn.smembers(&user_key).await?;
    if tokens.is_empty() {
      return Ok(());
    }
    let mut pipe = redis::pipe();
    pipe.atomic();
    for token_key in &tokens {
      pipe.del(token_key);
    }
    pipe.del(&user_key);
    pipe.query_async::<()>(&mut conn).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_is_deterministic_and_not_the_plaintext() {
    let token = "some-refresh-token";
    let hash1 = sha256_hash(token);
    let hash2 = sha256_hash(token);
    assert_eq!(hash1, hash2);
    assert_ne!(hash1, token);
  }
}
