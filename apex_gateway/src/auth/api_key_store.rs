//! Persistent API-key credential store. Keys are indexed by an unsalted
//! SHA-256 digest (fast, indexed lookup) and then verified against a
//! per-record salted hash in constant time, so a leaked database dump
//! alone is not enough to replay a key, while a live lookup still costs
//! one indexed query rather than a scan.

use apex_core::{CoreError, UserContext};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use super::authenticator::{ApiKeyRecord, verify_api_key};

pub struct ApiKeyStore {
  pool: PgPool,
}

fn index_hash(api_key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(api_key.as_bytes());
  hex::encode(hasher.finalize())
}

impl ApiKeyStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub async fn verify(&self, api_key: &str) -> Result<UserContext, CoreError> {
    let key_id = index_hash(api_key);
    let row = sqlx::query_as::<_, ApiKeyRow>(
      "SELECT salt, salted_hash, user_id, tenant_id, roles, is_active FROM api_keys WHERE key_id = $1",
    )
    .bind(&key_id)
    .fetch_optional(&self.pool)
    .await?;

    let Some(row) = row else {
      return Err(CoreError::Authentication("invalid".to_string()));
    };

    let record = ApiKeyRecord { salt: row.salt, salted_hash: row.salted_hash };
    if !verify_api_key(api_key, &record) {
      return Err(CoreError::Authentication("invalid".to_string()));
    }
    if !row.is_active {
      return Err(CoreError::Authentication("invalid".to_string()));
    }

    Ok(UserContext {
      user_id: row.user_id,
      username: None,
      email: None,
      tenant_id: row.tenant_id,
      roles: row.roles.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
      permissions: Vec::new(),
      is_active: row.is_active,
    })
  }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
  salt: String,
  salted_hash: String,
  user_id: String,
  tenant_id: Option<String>,
  roles: String,
  is_active: bool,
}
