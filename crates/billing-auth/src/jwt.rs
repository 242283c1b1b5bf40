//! Billing token signing and verification
//!
//! Tokens are HS256-signed with a secret shared with the issuer. Expiry is
//! enforced without leeway.

use crate::claims::{Claims, Role};
use billing_core::error::AppError;
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use tracing::{debug, error, warn};

/// Signs and verifies billing access tokens
#[derive(Clone)]
pub struct JwtService {
    expiration_secs: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    /// Build a service for `secret`; issued tokens live `expiration_secs`
    ///
    /// ```
    /// use billing_auth::{JwtService, Role};
    ///
    /// let tokens = JwtService::new("shared-secret", 900);
    /// let token = tokens.create_token_for("billing-ui", Role::Admin, vec![]).unwrap();
    /// assert!(tokens.validate_token(&token).unwrap().is_admin());
    /// ```
    pub fn new(secret: &str, expiration_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            expiration_secs,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Sign `claims`; an unset `exp` gets the service lifetime
    pub fn create_token(&self, claims: &Claims) -> Result<String, AppError> {
        let mut signed = claims.clone();
        if signed.exp == 0 {
            signed.exp = (Utc::now() + Duration::seconds(self.expiration_secs)).timestamp();
        }

        debug!(subject = %signed.sub, role = %signed.role, exp = signed.exp, "Signing billing token");
        encode(&Header::new(Algorithm::HS256), &signed, &self.encoding_key).map_err(|e| {
            error!(error = %e, "Could not sign billing token");
            AppError::Internal(format!("token signing failed: {}", e))
        })
    }

    /// Sign a token for `subject` with `role` over `orgs`
    pub fn create_token_for(
        &self,
        subject: &str,
        role: Role,
        orgs: Vec<String>,
    ) -> Result<String, AppError> {
        self.create_token(&Claims::new(subject, role, orgs))
    }

    /// Verify `token` and return its claims
    ///
    /// Expired tokens give `TokenExpired`; anything else that fails to verify
    /// gives `InvalidToken`.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                if matches!(e.kind(), ErrorKind::ExpiredSignature) {
                    warn!("Rejected expired billing token");
                    AppError::TokenExpired
                } else {
                    warn!(error = %e, "Rejected billing token");
                    AppError::InvalidToken(e.to_string())
                }
            })?;

        debug!(subject = %claims.sub, role = %claims.role, orgs = claims.orgs.len(), "Billing token accepted");
        Ok(claims)
    }

    pub fn expiration_secs(&self) -> i64 {
        self.expiration_secs
    }
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("expiration_secs", &self.expiration_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "billing-token-secret";

    #[test]
    fn test_round_trip_keeps_orgs() {
        let tokens = JwtService::new(SECRET, 600);
        let token = tokens
            .create_token_for("manager", Role::Billing, vec!["o1".to_string()])
            .unwrap();

        let claims = tokens.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "manager");
        assert_eq!(claims.role, Role::Billing);
        assert_eq!(claims.orgs, vec!["o1".to_string()]);

        let now = Utc::now().timestamp();
        assert!(claims.exp > now && claims.exp <= now + 600);
    }

    #[test]
    fn test_explicit_expiry_is_kept() {
        let tokens = JwtService::new(SECRET, 600);
        let claims = Claims::with_expiration("ops", Role::Admin, vec![], 30);
        let token = tokens.create_token(&claims).unwrap();
        assert_eq!(tokens.validate_token(&token).unwrap().exp, claims.exp);
    }

    #[test]
    fn test_expired_token_rejected() {
        let tokens = JwtService::new(SECRET, 600);
        let claims = Claims::with_expiration("ops", Role::Admin, vec![], -5);
        let token = tokens.create_token(&claims).unwrap();

        assert!(matches!(
            tokens.validate_token(&token),
            Err(AppError::TokenExpired)
        ));
    }

    #[test]
    fn test_garbage_and_foreign_tokens_rejected() {
        let tokens = JwtService::new(SECRET, 600);
        assert!(matches!(
            tokens.validate_token("not-a-token"),
            Err(AppError::InvalidToken(_))
        ));

        let foreign = JwtService::new("another-secret", 600)
            .create_token_for("ops", Role::Admin, vec![])
            .unwrap();
        assert!(matches!(
            tokens.validate_token(&foreign),
            Err(AppError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_debug_omits_secret() {
        let rendered = format!("{:?}", JwtService::new(SECRET, 600));
        assert!(rendered.contains("600"));
        assert!(!rendered.contains(SECRET));
    }
}
