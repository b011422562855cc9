use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::LedgerError;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The user performing the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorId(pub String);

impl<S> FromRequestParts<S> for ActorId
where
    S: Send + Sync,
{
    type Rejection = LedgerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                LedgerError::invalid_request(format!("missing {} header", USER_ID_HEADER))
            })?;
        Ok(Self(value.to_string()))
    }
}
