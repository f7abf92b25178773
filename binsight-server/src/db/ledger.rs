//! Credit ledger: balances, transactions and payment reconciliation
//!
//! Every mutation updates the balance row and appends its transaction as
//! one unit of visibility. SQLite gives us no multi-writer transactions
//! worth leaning on here, so writes serialize through a per-user async
//! mutex; the transaction row is always written after the balance row, and
//! `audit_user` detects a balance that advanced without its matching
//! transaction.
//!
//! Debt tolerance: `deduct_usage` performs no pre-check and may drive
//! `remaining` below zero. The admission gate (`has_at_least`) is the only
//! balance check in the system.

use binsight_common::model::{CreditBalance, Transaction, TxnKind};
use binsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of crediting a payment, including any debt that was cleared
#[derive(Debug, Clone)]
pub struct PaymentCredit {
    pub balance: CreditBalance,
    pub txn: Transaction,
    pub debt_cleared: i64,
}

/// Result of replaying a user's transaction log against their balance
#[derive(Debug, Clone)]
pub struct LedgerAudit {
    pub user_id: Uuid,
    pub remaining: i64,
    pub replayed: i64,
    pub consistent: bool,
}

/// Accessor for balances and the append-only transaction log
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Per-user write lock; all balance mutations go through this
    fn lock_for(&self, user_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("ledger lock map poisoned");
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Current balance snapshot
    pub async fn balance(&self, user_id: Uuid) -> Result<CreditBalance> {
        let row = sqlx::query(
            "SELECT credits_total, credits_used, credits_remaining FROM users WHERE id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::Internal(format!("user not found: {user_id}")))?;

        Ok(CreditBalance {
            total: row.try_get("credits_total")?,
            used: row.try_get("credits_used")?,
            remaining: row.try_get("credits_remaining")?,
        })
    }

    /// Admission gate; the only place a balance is checked before work
    pub async fn has_at_least(&self, user_id: Uuid, threshold: i64) -> Result<bool> {
        Ok(self.balance(user_id).await?.remaining >= threshold)
    }

    /// Grant credits (purchase top-up outside the webhook path, or bonus)
    pub async fn add_credits(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        kind: TxnKind,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(Error::InvalidState(format!(
                "credit amount must be positive, got {amount}"
            )));
        }
        if !matches!(kind, TxnKind::Credit | TxnKind::Bonus) {
            return Err(Error::InvalidState(format!(
                "add_credits cannot record a {} transaction",
                kind.as_str()
            )));
        }

        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let before = self.balance(user_id).await?;
        let after = CreditBalance {
            total: before.total + amount,
            used: before.used,
            remaining: before.remaining + amount,
        };
        self.write_balance(user_id, after).await?;
        self.append_txn(
            user_id,
            kind,
            amount,
            description,
            None,
            None,
            None,
            before.remaining,
            after.remaining,
        )
        .await
    }

    /// Replace the balance outright; admin path only. Records the delta so
    /// the transaction log still replays to the stored balance.
    pub async fn set_credits(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<Transaction> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let before = self.balance(user_id).await?;
        let after = CreditBalance {
            total: amount,
            used: 0,
            remaining: amount,
        };
        self.write_balance(user_id, after).await?;

        let delta = after.remaining - before.remaining;
        let (kind, magnitude) = if delta >= 0 {
            (TxnKind::Credit, delta)
        } else {
            (TxnKind::Debit, -delta)
        };
        self.append_txn(
            user_id,
            kind,
            magnitude,
            description,
            None,
            None,
            None,
            before.remaining,
            after.remaining,
        )
        .await
    }

    /// Charge usage after analysis. No pre-check: the balance may go
    /// negative, which the next admission gate will reject.
    pub async fn deduct_usage(
        &self,
        user_id: Uuid,
        amount: i64,
        job_id: Uuid,
        api_key_id: Option<Uuid>,
        description: &str,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(Error::InvalidState(format!(
                "debit amount must be positive, got {amount}"
            )));
        }

        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let before = self.balance(user_id).await?;
        let after = CreditBalance {
            total: before.total,
            used: before.used + amount,
            remaining: before.remaining - amount,
        };
        self.write_balance(user_id, after).await?;

        if after.remaining < 0 {
            warn!(
                user_id = %user_id,
                remaining = after.remaining,
                "usage charge drove balance into debt"
            );
        }

        self.append_txn(
            user_id,
            TxnKind::Debit,
            amount,
            description,
            Some(job_id),
            api_key_id,
            None,
            before.remaining,
            after.remaining,
        )
        .await
    }

    /// Return credits for a job; `used` is floor-clamped at zero
    pub async fn refund(
        &self,
        user_id: Uuid,
        amount: i64,
        job_id: Uuid,
        reason: &str,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(Error::InvalidState(format!(
                "refund amount must be positive, got {amount}"
            )));
        }

        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let before = self.balance(user_id).await?;
        let after = CreditBalance {
            total: before.total,
            used: (before.used - amount).max(0),
            remaining: before.remaining + amount,
        };
        self.write_balance(user_id, after).await?;
        self.append_txn(
            user_id,
            TxnKind::Refund,
            amount,
            reason,
            Some(job_id),
            None,
            None,
            before.remaining,
            after.remaining,
        )
        .await
    }

    /// Credit a captured payment, clearing any outstanding debt.
    /// Idempotent per payment id: a replay returns the original
    /// transaction without touching the balance.
    pub async fn add_credits_from_payment(
        &self,
        user_id: Uuid,
        amount: i64,
        payment_id: &str,
        description: &str,
    ) -> Result<PaymentCredit> {
        if amount <= 0 {
            return Err(Error::InvalidState(format!(
                "payment credit must be positive, got {amount}"
            )));
        }

        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.find_payment_txn(payment_id).await? {
            info!(
                payment_id,
                txn_id = %existing.id,
                "payment already credited, returning existing transaction"
            );
            return Ok(PaymentCredit {
                balance: self.balance(user_id).await?,
                txn: existing,
                debt_cleared: 0,
            });
        }

        let before = self.balance(user_id).await?;
        let debt = (-before.remaining).max(0);
        let after = CreditBalance {
            total: before.total + amount,
            used: before.used,
            remaining: before.remaining + amount,
        };
        self.write_balance(user_id, after).await?;

        let description = if debt > 0 {
            format!("{description} (Debt cleared: {debt} credits)")
        } else {
            description.to_string()
        };
        let txn = self
            .append_txn(
                user_id,
                TxnKind::Credit,
                amount,
                &description,
                None,
                None,
                Some(payment_id),
                before.remaining,
                after.remaining,
            )
            .await?;

        if debt > 0 {
            info!(user_id = %user_id, debt, "payment cleared outstanding debt");
        }

        Ok(PaymentCredit {
            balance: after,
            txn,
            debt_cleared: debt,
        })
    }

    /// Full transaction log for a user, oldest first
    pub async fn transactions_for(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, kind, amount, description, job_id, api_key_id, payment_id,
                   balance_before, balance_after, created_at
            FROM transactions WHERE user_id = ? ORDER BY created_at, id
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(txn_from_row).collect()
    }

    /// Replay the transaction log against the stored balance. A mismatch
    /// means a balance write landed without its transaction (or vice
    /// versa) and is reported at ERROR for operators.
    pub async fn audit_user(&self, user_id: Uuid) -> Result<LedgerAudit> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let balance = self.balance(user_id).await?;
        let txns = self.transactions_for(user_id).await?;
        let replayed: i64 = txns.iter().map(|t| t.kind.sign() * t.amount).sum();
        let consistent = replayed == balance.remaining;

        if !consistent {
            error!(
                user_id = %user_id,
                remaining = balance.remaining,
                replayed,
                "ledger drift: transaction log does not reproduce balance"
            );
        }

        Ok(LedgerAudit {
            user_id,
            remaining: balance.remaining,
            replayed,
            consistent,
        })
    }

    /// Startup reconciliation pass over every user. Drift cannot be
    /// repaired automatically, only surfaced.
    pub async fn audit_all(&self) -> Result<Vec<LedgerAudit>> {
        let rows = sqlx::query("SELECT id FROM users")
            .fetch_all(&self.pool)
            .await?;

        let mut drifted = Vec::new();
        for row in rows {
            let id: String = row.try_get("id")?;
            let audit = self.audit_user(parse_uuid(&id)?).await?;
            if !audit.consistent {
                drifted.push(audit);
            }
        }

        if drifted.is_empty() {
            info!("ledger audit clean");
        } else {
            error!(users = drifted.len(), "ledger audit found drifted balances");
        }
        Ok(drifted)
    }

    async fn find_payment_txn(&self, payment_id: &str) -> Result<Option<Transaction>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, kind, amount, description, job_id, api_key_id, payment_id,
                   balance_before, balance_after, created_at
            FROM transactions WHERE payment_id = ? AND kind = 'credit'
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(txn_from_row).transpose()
    }

    async fn write_balance(&self, user_id: Uuid, balance: CreditBalance) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE users
            SET credits_total = ?, credits_used = ?, credits_remaining = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(balance.total)
        .bind(balance.used)
        .bind(balance.remaining)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::Internal(format!("user not found: {user_id}")));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_txn(
        &self,
        user_id: Uuid,
        kind: TxnKind,
        amount: i64,
        description: &str,
        job_id: Option<Uuid>,
        api_key_id: Option<Uuid>,
        payment_id: Option<&str>,
        balance_before: i64,
        balance_after: i64,
    ) -> Result<Transaction> {
        let txn = Transaction {
            id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            description: description.to_string(),
            job_id,
            api_key_id,
            payment_id: payment_id.map(str::to_string),
            balance_before,
            balance_after,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, user_id, kind, amount, description, job_id, api_key_id, payment_id,
                 balance_before, balance_after, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(txn.id.to_string())
        .bind(txn.user_id.to_string())
        .bind(txn.kind.as_str())
        .bind(txn.amount)
        .bind(&txn.description)
        .bind(txn.job_id.map(|id| id.to_string()))
        .bind(txn.api_key_id.map(|id| id.to_string()))
        .bind(txn.payment_id.as_deref())
        .bind(txn.balance_before)
        .bind(txn.balance_after)
        .bind(txn.created_at)
        .execute(&self.pool)
        .await?;

        Ok(txn)
    }
}

fn txn_from_row(row: &SqliteRow) -> Result<Transaction> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let kind: String = row.try_get("kind")?;
    let job_id: Option<String> = row.try_get("job_id")?;
    let api_key_id: Option<String> = row.try_get("api_key_id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Transaction {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        kind: TxnKind::parse(&kind)?,
        amount: row.try_get("amount")?,
        description: row.try_get("description")?,
        job_id: job_id.as_deref().map(parse_uuid).transpose()?,
        api_key_id: api_key_id.as_deref().map(parse_uuid).transpose()?,
        payment_id: row.try_get("payment_id")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        created_at,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("bad uuid in ledger row: {e}")))
}
