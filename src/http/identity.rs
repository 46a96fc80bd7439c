use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use super::{AppError, AppState};

/// Who is calling. The customer id comes from a header set by the upstream auth
/// gateway; admin access is a bearer token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub customer: Option<String>,
    pub admin: bool,
}

impl Identity {
    pub fn require_customer(&self) -> Result<&str, AppError> {
        self.customer.as_deref().ok_or(AppError::Unauthorized)
    }

    /// Owners see their own bookings, admins see everything.
    pub fn may_access(&self, owner: Option<&str>) -> bool {
        self.admin || (owner.is_some() && owner == self.customer.as_deref())
    }
}

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn is_admin(parts: &Parts, state: &AppState) -> bool {
    match (&state.admin_token, bearer(parts)) {
        (Some(expected), Some(given)) => constant_time_eq(expected.as_bytes(), given.as_bytes()),
        _ => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let customer = parts
            .headers
            .get(state.customer_header.as_ref())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(Identity {
            customer,
            admin: is_admin(parts, state),
        })
    }
}

/// Extractor that only admits requests carrying the admin token.
#[derive(Debug, Clone, Copy)]
pub struct Admin;

impl FromRequestParts<AppState> for Admin {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.admin_token.is_none() {
            return Err(AppError::Forbidden);
        }
        if bearer(parts).is_none() {
            return Err(AppError::Unauthorized);
        }
        if !is_admin(parts, state) {
            tracing::warn!(uri = %parts.uri, "rejected admin token");
            return Err(AppError::Forbidden);
        }
        Ok(Admin)
    }
}
