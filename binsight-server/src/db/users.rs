//! User rows: identity, tier assignment and the embedded credit snapshot

use binsight_common::model::{CreditBalance, ServiceTier, User};
use binsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Accessor for the `users` table
#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the user row if it does not exist yet
    pub async fn ensure(&self, user_id: Uuid, tier: Option<ServiceTier>) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO users (id, tier, active, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            "#,
        )
        .bind(user_id.to_string())
        .bind(tier.map(|t| t.as_str()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, user_id: Uuid) -> Result<User> {
        let row = sqlx::query(
            r#"
            SELECT id, tier, active, credits_total, credits_used, credits_remaining, created_at
            FROM users WHERE id = ?
            "#,
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::Internal(format!("user not found: {user_id}")))?;

        user_from_row(&row)
    }

    /// Service tier for queue placement; unset (admin) defaults to tier2
    pub async fn tier_of(&self, user_id: Uuid) -> Result<ServiceTier> {
        let user = self.get(user_id).await?;
        Ok(user.tier.unwrap_or(ServiceTier::Tier2))
    }

    pub async fn set_active(&self, user_id: Uuid, active: bool) -> Result<()> {
        sqlx::query("UPDATE users SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active as i64)
            .bind(Utc::now())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let id: String = row.try_get("id")?;
    let tier: Option<String> = row.try_get("tier")?;
    let active: i64 = row.try_get("active")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(User {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad user id: {e}")))?,
        tier: tier.as_deref().map(ServiceTier::parse).transpose()?,
        active: active != 0,
        credits: CreditBalance {
            total: row.try_get("credits_total")?,
            used: row.try_get("credits_used")?,
            remaining: row.try_get("credits_remaining")?,
        },
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use binsight_common::db::connect_memory;

    #[tokio::test]
    async fn ensure_then_get_round_trips() {
        let pool = connect_memory().await.unwrap();
        let store = UserStore::new(pool);
        let user_id = Uuid::new_v4();

        store.ensure(user_id, Some(ServiceTier::Tier1)).await.unwrap();
        let user = store.get(user_id).await.unwrap();

        assert_eq!(user.id, user_id);
        assert_eq!(user.tier, Some(ServiceTier::Tier1));
        assert!(user.active);
        assert_eq!(user.credits, CreditBalance::default());
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let pool = connect_memory().await.unwrap();
        let store = UserStore::new(pool.clone());
        let user_id = Uuid::new_v4();

        store.ensure(user_id, Some(ServiceTier::Tier2)).await.unwrap();
        // Balance mutations survive a second ensure
        sqlx::query("UPDATE users SET credits_remaining = 42 WHERE id = ?")
            .bind(user_id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        store.ensure(user_id, Some(ServiceTier::Tier2)).await.unwrap();

        assert_eq!(store.get(user_id).await.unwrap().credits.remaining, 42);
    }

    #[tokio::test]
    async fn admin_without_tier_defaults_to_tier2() {
        let pool = connect_memory().await.unwrap();
        let store = UserStore::new(pool);
        let user_id = Uuid::new_v4();

        store.ensure(user_id, None).await.unwrap();
        assert_eq!(store.tier_of(user_id).await.unwrap(), ServiceTier::Tier2);
    }
}
