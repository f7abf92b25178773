//! API key rows: issuance, authentication and usage accounting

use binsight_common::model::{ApiKey, Capability};
use binsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Fixed token prefix; the random suffix carries the entropy
const TOKEN_PREFIX: &str = "bsk_";

/// Accessor for the `api_keys` table
#[derive(Clone)]
pub struct ApiKeyStore {
    pool: SqlitePool,
}

impl ApiKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Issue a new key for a user; the token is returned exactly once
    pub async fn issue(
        &self,
        user_id: Uuid,
        name: &str,
        capabilities: Vec<Capability>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey> {
        let key = ApiKey {
            id: Uuid::new_v4(),
            token: generate_token(),
            user_id,
            name: name.to_string(),
            active: true,
            expires_at,
            last_used_at: None,
            request_count: 0,
            capabilities,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO api_keys
                (id, token, user_id, name, active, expires_at, request_count, capabilities, created_at)
            VALUES (?, ?, ?, ?, 1, ?, 0, ?, ?)
            "#,
        )
        .bind(key.id.to_string())
        .bind(&key.token)
        .bind(key.user_id.to_string())
        .bind(&key.name)
        .bind(key.expires_at)
        .bind(serde_json::to_string(&key.capabilities)?)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;

        Ok(key)
    }

    /// Validate a presented token and record the use. Inactive, unknown and
    /// expired keys all map to `InvalidApiKey` so callers cannot probe
    /// which of the three applied.
    pub async fn authenticate(&self, token: &str) -> Result<ApiKey> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE token = ? AND active = 1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        let key = match row.as_ref().map(api_key_from_row).transpose()? {
            Some(key) => key,
            None => return Err(Error::InvalidApiKey("unknown or inactive key".to_string())),
        };

        if key.is_expired(Utc::now()) {
            return Err(Error::InvalidApiKey("key expired".to_string()));
        }

        sqlx::query(
            "UPDATE api_keys SET last_used_at = ?, request_count = request_count + 1 WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(key.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(key)
    }

    pub async fn revoke(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET active = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// `bsk_` + 40 hex chars from 20 random bytes
fn generate_token() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{TOKEN_PREFIX}{suffix}")
}

fn api_key_from_row(row: &SqliteRow) -> Result<ApiKey> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let active: i64 = row.try_get("active")?;
    let capabilities: String = row.try_get("capabilities")?;

    Ok(ApiKey {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad api key id: {e}")))?,
        token: row.try_get("token")?,
        user_id: Uuid::parse_str(&user_id)
            .map_err(|e| Error::Internal(format!("bad api key user id: {e}")))?,
        name: row.try_get("name")?,
        active: active != 0,
        expires_at: row.try_get("expires_at")?,
        last_used_at: row.try_get("last_used_at")?,
        request_count: row.try_get("request_count")?,
        capabilities: serde_json::from_str(&capabilities)?,
        created_at: row.try_get("created_at")?,
    })
}
