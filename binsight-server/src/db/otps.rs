//! One-time password rows
//!
//! Codes expire two minutes after issue; expired rows are swept by the
//! janitor rather than on the verification path.

use binsight_common::model::Otp;
use binsight_common::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Code validity window
const OTP_TTL_MINUTES: i64 = 2;

/// Accessor for the `otps` table
#[derive(Clone)]
pub struct OtpStore {
    pool: SqlitePool,
}

impl OtpStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Issue a fresh six-digit code for a purpose
    pub async fn issue(&self, user_id: Uuid, purpose: &str) -> Result<Otp> {
        let now = Utc::now();
        let otp = Otp {
            id: Uuid::new_v4(),
            user_id,
            code: format!("{:06}", rand::thread_rng().gen_range(0..1_000_000)),
            purpose: purpose.to_string(),
            used: false,
            expires_at: now + Duration::minutes(OTP_TTL_MINUTES),
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO otps (id, user_id, code, purpose, used, expires_at, created_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(otp.id.to_string())
        .bind(otp.user_id.to_string())
        .bind(&otp.code)
        .bind(&otp.purpose)
        .bind(otp.expires_at)
        .bind(otp.created_at)
        .execute(&self.pool)
        .await?;

        Ok(otp)
    }

    /// Check a presented code and burn it on success. A code exactly at
    /// its expiry instant no longer verifies.
    pub async fn verify_and_consume(
        &self,
        user_id: Uuid,
        code: &str,
        purpose: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT * FROM otps
            WHERE user_id = ? AND code = ? AND purpose = ? AND used = 0
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(user_id.to_string())
        .bind(code)
        .bind(purpose)
        .fetch_optional(&self.pool)
        .await?;

        let otp = match row.as_ref().map(otp_from_row).transpose()? {
            Some(otp) => otp,
            None => return Ok(false),
        };

        if otp.is_expired(Utc::now()) {
            return Ok(false);
        }

        sqlx::query("UPDATE otps SET used = 1 WHERE id = ?")
            .bind(otp.id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(true)
    }

    /// Janitor sweep; returns the number of expired rows removed
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM otps WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }
}

fn otp_from_row(row: &SqliteRow) -> Result<Otp> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let used: i64 = row.try_get("used")?;

    Ok(Otp {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad otp id: {e}")))?,
        user_id: Uuid::parse_str(&user_id)
            .map_err(|e| Error::Internal(format!("bad otp user id: {e}")))?,
        code: row.try_get("code")?,
        purpose: row.try_get("purpose")?,
        used: used != 0,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}
