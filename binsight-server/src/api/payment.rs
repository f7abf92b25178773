//! Payment gateway webhook
//!
//! The gateway signs the raw request body with HMAC-SHA256 over a shared
//! secret and may resend events for up to 24 hours, so handling is
//! idempotent end to end: the payment row's `credits_added` flag and the
//! ledger's per-payment transaction check each stop a replay from
//! crediting twice.

use crate::api::error::ApiError;
use crate::state::AppContext;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use binsight_common::{Error, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signature header sent by the gateway
const SIGNATURE_HEADER: &str = "x-razorpay-signature";

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    payment: PaymentWrapper,
}

#[derive(Debug, Deserialize)]
struct PaymentWrapper {
    entity: PaymentEntity,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: String,
    method: Option<String>,
    error_description: Option<String>,
}

/// POST /payment/webhook
pub async fn webhook(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::InvalidSignature)?;

    // The raw body is what was signed; parse only after verification
    verify_signature(&ctx.config.payment.webhook_secret, &body, signature)?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| Error::Internal(format!("malformed webhook payload: {e}")))?;

    match event.event.as_str() {
        "payment.captured" => handle_captured(&ctx, &event.payload.payment.entity, signature).await?,
        "payment.failed" => handle_failed(&ctx, &event.payload.payment.entity).await?,
        other => {
            // Unhandled event kinds are acknowledged so the gateway stops
            // resending them
            info!(event = other, "ignoring unhandled webhook event");
        }
    }

    Ok(Json(json!({"success": true})))
}

async fn handle_captured(
    ctx: &AppContext,
    entity: &PaymentEntity,
    signature: &str,
) -> Result<()> {
    let payment = ctx
        .payments
        .find_by_order_id(&entity.order_id)
        .await?
        .ok_or_else(|| Error::UnknownOrder(entity.order_id.clone()))?;

    if payment.credits_added {
        info!(
            order_id = %entity.order_id,
            "capture replay for an already-credited payment, no-op"
        );
        return Ok(());
    }

    let payment = ctx
        .payments
        .mark_captured(
            &entity.order_id,
            &entity.id,
            Some(signature),
            entity.method.as_deref(),
        )
        .await?;

    let credit = ctx
        .ledger
        .add_credits_from_payment(
            payment.user_id,
            payment.credits,
            &entity.id,
            &format!("{} purchase", payment.plan_name),
        )
        .await?;
    ctx.payments.set_credits_added(&entity.order_id).await?;

    info!(
        order_id = %entity.order_id,
        user_id = %payment.user_id,
        credits = payment.credits,
        debt_cleared = credit.debt_cleared,
        "payment captured and credited"
    );
    Ok(())
}

async fn handle_failed(ctx: &AppContext, entity: &PaymentEntity) -> Result<()> {
    let reason = entity
        .error_description
        .as_deref()
        .unwrap_or("payment failed");

    let payment = ctx
        .payments
        .find_by_order_id(&entity.order_id)
        .await?
        .ok_or_else(|| Error::UnknownOrder(entity.order_id.clone()))?;

    ctx.payments.mark_failed(&payment.order_id, reason).await?;

    // Notification delivery is the mailer's job; record the intent here
    warn!(
        order_id = %entity.order_id,
        user_id = %payment.user_id,
        reason,
        "payment failed, user notification queued"
    );
    Ok(())
}

/// Constant-time comparison of the presented signature against our own
/// HMAC-SHA256 of the raw body
pub fn verify_signature(secret: &str, body: &[u8], presented: &str) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("webhook secret unusable: {e}")))?;
    mac.update(body);
    let expected: String = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();

    if expected.as_bytes().ct_eq(presented.as_bytes()).into() {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}
