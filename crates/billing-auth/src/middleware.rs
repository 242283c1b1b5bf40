//! Actix-web request extractors
//!
//! Bearer tokens are read from the `Authorization` header, falling back to
//! an `authorization` cookie holding either the token or the header value.

use crate::claims::Claims;
use crate::jwt::JwtService;
use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use billing_core::error::AppError;
use futures::future::{ready, Ready};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cookie consulted when no `Authorization` header is present
pub const AUTHORIZATION_COOKIE: &str = "authorization";

fn bearer_token(value: &str) -> Option<String> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}

fn request_token(req: &HttpRequest) -> Option<String> {
    if let Some(header) = req.headers().get(actix_web::http::header::AUTHORIZATION) {
        return header.to_str().ok().and_then(bearer_token);
    }
    let cookie = req.cookie(AUTHORIZATION_COOKIE)?;
    let value = cookie.value().trim();
    bearer_token(value).or_else(|| (!value.is_empty()).then(|| value.to_string()))
}

fn authenticate(req: &HttpRequest) -> Result<AuthenticatedUser, AppError> {
    let tokens = req.app_data::<web::Data<Arc<JwtService>>>().ok_or_else(|| {
        warn!("No token verifier registered in app data");
        AppError::Internal("authentication service not configured".to_string())
    })?;

    let token = request_token(req).ok_or_else(|| {
        debug!(path = %req.path(), "Request carries no bearer token");
        AppError::Unauthorized("no bearer token provided".to_string())
    })?;

    let claims = tokens.validate_token(&token)?;
    Ok(AuthenticatedUser { claims })
}

/// Caller presenting a valid bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub claims: Claims,
}

impl AuthenticatedUser {
    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub fn is_admin(&self) -> bool {
        self.claims.is_admin()
    }

    /// Require billing access to every org in `org_guids`
    pub fn authorize_orgs(&self, org_guids: &[String]) -> Result<(), AppError> {
        if self.claims.can_access_orgs(org_guids) {
            return Ok(());
        }
        warn!(
            subject = %self.claims.sub,
            requested = ?org_guids,
            "Billing access denied"
        );
        Err(AppError::Unauthorized(
            "you are not authorized to view billing data for the requested organisations"
                .to_string(),
        ))
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(authenticate(req).map_err(Into::into))
    }
}

/// Caller with platform-wide access
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

impl std::ops::Deref for AdminUser {
    type Target = AuthenticatedUser;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromRequest for AdminUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let admin = authenticate(req).and_then(|user| {
            if user.is_admin() {
                Ok(AdminUser(user))
            } else {
                warn!(subject = %user.subject(), "Admin access denied");
                Err(AppError::Unauthorized("admin access required".to_string()))
            }
        });
        ready(admin.map_err(Into::into))
    }
}
