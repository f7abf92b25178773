//! Payment rows: gateway orders and their reconciliation state
//!
//! The gateway order id is the idempotency key for webhook replays.
//! Status transitions go through `PaymentStatus::can_transition`, so a
//! replayed capture or a late failure event cannot walk a row backwards.

use binsight_common::config::Plan;
use binsight_common::model::{Payment, PaymentStatus};
use binsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Accessor for the `payments` table
#[derive(Clone)]
pub struct PaymentStore {
    pool: SqlitePool,
}

impl PaymentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a freshly created gateway order for a plan purchase
    pub async fn create_order(&self, user_id: Uuid, plan: &Plan, order_id: &str) -> Result<Payment> {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            payment_id: None,
            signature: None,
            plan_id: plan.id.to_string(),
            plan_name: plan.name.to_string(),
            credits: plan.credits,
            amount_paise: plan.amount_paise,
            currency: plan.currency.to_string(),
            status: PaymentStatus::Created,
            method: None,
            card_last4: None,
            card_network: None,
            credits_added: false,
            refund_id: None,
            refund_amount: None,
            failure_reason: None,
            user_id,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO payments
                (id, order_id, plan_id, plan_name, credits, amount_paise, currency,
                 status, credits_added, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(payment.id.to_string())
        .bind(&payment.order_id)
        .bind(&payment.plan_id)
        .bind(&payment.plan_name)
        .bind(payment.credits)
        .bind(payment.amount_paise)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(payment.user_id.to_string())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(payment)
    }

    pub async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Payment>> {
        let row = sqlx::query("SELECT * FROM payments WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    /// Record a successful capture. A replay against an already-successful
    /// row is a no-op that returns the stored payment.
    pub async fn mark_captured(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: Option<&str>,
        method: Option<&str>,
    ) -> Result<Payment> {
        let payment = self
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))?;

        if payment.status == PaymentStatus::Success {
            return Ok(payment);
        }
        if !payment.status.can_transition(PaymentStatus::Success) {
            return Err(Error::InvalidState(format!(
                "payment {} cannot move from {} to success",
                order_id,
                payment.status.as_str()
            )));
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'success', payment_id = ?, signature = ?, method = ?, updated_at = ?
            WHERE order_id = ?
            "#,
        )
        .bind(payment_id)
        .bind(signature)
        .bind(method)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        self.find_by_order_id(order_id)
            .await?
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))
    }

    /// Flip `credits_added` once the ledger transaction has been appended
    pub async fn set_credits_added(&self, order_id: &str) -> Result<()> {
        sqlx::query("UPDATE payments SET credits_added = 1, updated_at = ? WHERE order_id = ?")
            .bind(Utc::now())
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, order_id: &str, reason: &str) -> Result<Payment> {
        let payment = self
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))?;

        if payment.status == PaymentStatus::Failed {
            return Ok(payment);
        }
        if !payment.status.can_transition(PaymentStatus::Failed) {
            return Err(Error::InvalidState(format!(
                "payment {} cannot move from {} to failed",
                order_id,
                payment.status.as_str()
            )));
        }

        sqlx::query(
            "UPDATE payments SET status = 'failed', failure_reason = ?, updated_at = ? WHERE order_id = ?",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        self.find_by_order_id(order_id)
            .await?
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))
    }

    /// `success → refunded` is the one permitted backwards-looking move
    pub async fn mark_refunded(
        &self,
        order_id: &str,
        refund_id: &str,
        refund_amount: i64,
    ) -> Result<Payment> {
        let payment = self
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))?;

        if !payment.status.can_transition(PaymentStatus::Refunded) {
            return Err(Error::InvalidState(format!(
                "payment {} cannot move from {} to refunded",
                order_id,
                payment.status.as_str()
            )));
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'refunded', refund_id = ?, refund_amount = ?, updated_at = ?
            WHERE order_id = ?
            "#,
        )
        .bind(refund_id)
        .bind(refund_amount)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        self.find_by_order_id(order_id)
            .await?
            .ok_or_else(|| Error::UnknownOrder(order_id.to_string()))
    }
}

fn payment_from_row(row: &SqliteRow) -> Result<Payment> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let status: String = row.try_get("status")?;
    let credits_added: i64 = row.try_get("credits_added")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Payment {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad payment id: {e}")))?,
        order_id: row.try_get("order_id")?,
        payment_id: row.try_get("payment_id")?,
        signature: row.try_get("signature")?,
        plan_id: row.try_get("plan_id")?,
        plan_name: row.try_get("plan_name")?,
        credits: row.try_get("credits")?,
        amount_paise: row.try_get("amount_paise")?,
        currency: row.try_get("currency")?,
        status: PaymentStatus::parse(&status)?,
        method: row.try_get("method")?,
        card_last4: row.try_get("card_last4")?,
        card_network: row.try_get("card_network")?,
        credits_added: credits_added != 0,
        refund_id: row.try_get("refund_id")?,
        refund_amount: row.try_get("refund_amount")?,
        failure_reason: row.try_get("failure_reason")?,
        user_id: Uuid::parse_str(&user_id)
            .map_err(|e| Error::Internal(format!("bad payment user id: {e}")))?,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use binsight_common::config::find_plan;
    use binsight_common::db::connect_memory;

    async fn setup() -> PaymentStore {
        PaymentStore::new(connect_memory().await.unwrap())
    }

    #[tokio::test]
    async fn order_lifecycle_to_success() {
        let store = setup().await;
        let user = Uuid::new_v4();
        let plan = find_plan("standard").unwrap();

        store.create_order(user, plan, "order_abc").await.unwrap();
        let captured = store
            .mark_captured("order_abc", "pay_1", Some("sig"), Some("card"))
            .await
            .unwrap();

        assert_eq!(captured.status, PaymentStatus::Success);
        assert_eq!(captured.payment_id.as_deref(), Some("pay_1"));
        assert_eq!(captured.credits, 500);
        assert!(!captured.credits_added);

        store.set_credits_added("order_abc").await.unwrap();
        let reloaded = store.find_by_order_id("order_abc").await.unwrap().unwrap();
        assert!(reloaded.credits_added);
    }

    #[tokio::test]
    async fn capture_replay_is_noop() {
        let store = setup().await;
        let plan = find_plan("starter").unwrap();
        store
            .create_order(Uuid::new_v4(), plan, "order_replay")
            .await
            .unwrap();

        let first = store
            .mark_captured("order_replay", "pay_1", None, None)
            .await
            .unwrap();
        let second = store
            .mark_captured("order_replay", "pay_other", None, None)
            .await
            .unwrap();

        // Replay keeps the original capture details
        assert_eq!(second.payment_id, first.payment_id);
        assert_eq!(second.status, PaymentStatus::Success);
    }

    #[tokio::test]
    async fn failed_payment_cannot_become_successful() {
        let store = setup().await;
        let plan = find_plan("starter").unwrap();
        store
            .create_order(Uuid::new_v4(), plan, "order_fail")
            .await
            .unwrap();
        store
            .mark_failed("order_fail", "card declined")
            .await
            .unwrap();

        assert!(store
            .mark_captured("order_fail", "pay_1", None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn refund_only_after_success() {
        let store = setup().await;
        let plan = find_plan("pro").unwrap();
        store
            .create_order(Uuid::new_v4(), plan, "order_refund")
            .await
            .unwrap();

        assert!(store
            .mark_refunded("order_refund", "rfnd_1", 1_600_000)
            .await
            .is_err());

        store
            .mark_captured("order_refund", "pay_1", None, None)
            .await
            .unwrap();
        let refunded = store
            .mark_refunded("order_refund", "rfnd_1", 1_600_000)
            .await
            .unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(refunded.refund_amount, Some(1_600_000));
    }

    #[tokio::test]
    async fn unknown_order_is_reported() {
        let store = setup().await;
        let err = store
            .mark_captured("order_missing", "pay_1", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownOrder(_)));
    }
}
