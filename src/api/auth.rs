use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use subtle::ConstantTimeEq;

use crate::app_state::AppState;
use crate::error::ApiError;

/// Extractor that admits a request only when it carries
/// `Authorization: Bearer <API_KEY>`.
///
/// With no key configured every request is rejected.
#[derive(Debug, Clone, Copy)]
pub struct BearerAuth;

impl FromRequestParts<Arc<AppState>> for BearerAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        if authorize(state.settings.api_key.as_deref(), header) {
            Ok(BearerAuth)
        } else {
            tracing::debug!("Rejected request with missing or invalid bearer credential");
            Err(ApiError::Unauthorized)
        }
    }
}

/// Splits `<scheme> <credentials>` and returns the credentials when the
/// scheme is bearer (any case).
pub fn bearer_credentials(header: &str) -> Option<&str> {
    let (scheme, credentials) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || credentials.is_empty() {
        return None;
    }
    Some(credentials)
}

pub fn authorize(expected: Option<&str>, header: Option<&str>) -> bool {
    let (Some(expected), Some(header)) = (expected, header) else {
        return false;
    };
    match bearer_credentials(header) {
        Some(presented) => bool::from(presented.as_bytes().ct_eq(expected.as_bytes())),
        None => false,
    }
}
