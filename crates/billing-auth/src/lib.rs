//! Authentication and authorization for PaaS Billing
//!
//! This crate validates HS256 bearer tokens and decides which
//! organisations' billing data a caller may read.
//!
//! # Features
//!
//! - JWT token creation and validation
//! - Request extractors for authenticated callers and admins
//! - Per-organisation access checks
//!
//! # Examples
//!
//! ```no_run
//! use actix_web::HttpResponse;
//! use billing_auth::AuthenticatedUser;
//!
//! async fn org_report(user: AuthenticatedUser) -> HttpResponse {
//!     match user.authorize_orgs(&["org-1".to_string()]) {
//!         Ok(()) => HttpResponse::Ok().finish(),
//!         Err(e) => actix_web::ResponseError::error_response(&e),
//!     }
//! }
//! ```

pub mod claims;
pub mod jwt;
pub mod middleware;

pub use claims::{Claims, Role};
pub use jwt::JwtService;
pub use middleware::{AdminUser, AuthenticatedUser};
