//! Request authentication extractors
//!
//! SDK routes present an API key in `X-Api-Key` (or `Authorization:
//! Bearer`); dashboard routes arrive behind the session middleware, which
//! injects the authenticated user id as `X-User-Id`. Admin routes match a
//! shared operator token when one is configured.

use crate::api::error::ApiError;
use crate::state::AppContext;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use binsight_common::model::{ApiKey, Capability};
use binsight_common::{Error, Result};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Authenticated API key for `/sdk` routes
pub struct ApiKeyAuth(pub ApiKey);

impl ApiKeyAuth {
    /// Capability gate; the key must carry the route's grant
    pub fn require(&self, cap: Capability) -> Result<()> {
        if self.0.has_capability(cap) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "api key lacks the '{}' capability",
                cap.as_str()
            )))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for ApiKeyAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = extract_token(parts)
            .ok_or_else(|| Error::InvalidApiKey("missing api key".to_string()))?;

        let key = ctx.api_keys.authenticate(&token).await?;

        // The key may outlive its owner's account
        let user = ctx.users.get(key.user_id).await?;
        if !user.active {
            return Err(Error::InvalidApiKey("account inactive".to_string()).into());
        }

        Ok(ApiKeyAuth(key))
    }
}

fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get("x-api-key") {
        return value.to_str().ok().map(str::to_string);
    }
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Authenticated dashboard user for `/user` routes
pub struct SessionUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppContext> for SessionUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> std::result::Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok())
            .ok_or_else(|| Error::Forbidden("valid session required".to_string()))?;

        let user = ctx.users.get(user_id).await.map_err(|_| {
            ApiError(Error::Forbidden("valid session required".to_string()))
        })?;
        if !user.active {
            return Err(Error::Forbidden("account inactive".to_string()).into());
        }

        Ok(SessionUser(user_id))
    }
}

/// Operator guard for `/admin` routes
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppContext> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> std::result::Result<Self, Self::Rejection> {
        let Some(expected) = ctx.config.admin_token.as_deref() else {
            return Ok(AdminAuth);
        };

        let presented = parts
            .headers
            .get("x-admin-token")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        if presented.as_bytes().ct_eq(expected.as_bytes()).into() {
            Ok(AdminAuth)
        } else {
            Err(Error::Forbidden("operator token required".to_string()).into())
        }
    }
}
