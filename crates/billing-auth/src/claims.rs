//! JWT Claims structure
//!
//! Tokens carry a role and the organisations the bearer may bill.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Access level of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Platform-wide read access
    Admin,

    /// Billing access to the organisations listed in the token
    Billing,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Billing => write!(f, "billing"),
        }
    }
}

/// JWT Claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Subject (user or client id)
    pub sub: String,

    /// Access level
    pub role: Role,

    /// Organisations with billing access
    #[serde(default)]
    pub orgs: Vec<String>,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Create claims with no expiration set
    ///
    /// ```
    /// use billing_auth::{Claims, Role};
    ///
    /// let claims = Claims::new("billing-ui", Role::Billing, vec!["org-1".to_string()]);
    /// assert!(claims.can_access_orgs(&["org-1".to_string()]));
    /// ```
    pub fn new(subject: &str, role: Role, orgs: Vec<String>) -> Self {
        Self {
            sub: subject.to_string(),
            role,
            orgs,
            iat: Utc::now().timestamp(),
            exp: 0, // Will be set by JwtService
        }
    }

    /// Create claims expiring `expires_in_secs` from now
    pub fn with_expiration(subject: &str, role: Role, orgs: Vec<String>, expires_in_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            sub: subject.to_string(),
            role,
            orgs,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(expires_in_secs)).timestamp(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.exp <= Utc::now().timestamp()
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Whether the bearer may see billing data for every org in `requested`
    ///
    /// An empty request means every organisation, which only admins may see.
    pub fn can_access_orgs(&self, requested: &[String]) -> bool {
        if self.is_admin() {
            return true;
        }
        !requested.is_empty() && requested.iter().all(|org| self.orgs.contains(org))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orgs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_claims_with_expiration() {
        let claims = Claims::with_expiration("admin", Role::Admin, vec![], 3600);
        assert!(!claims.is_expired());

        let now = Utc::now().timestamp();
        assert!(claims.exp > now);
        assert!(claims.exp <= now + 3600);
    }

    #[test]
    fn test_expired_claims() {
        let mut claims = Claims::new("user", Role::Billing, vec![]);
        claims.exp = (Utc::now() - Duration::hours(1)).timestamp();
        assert!(claims.is_expired());
    }

    #[test]
    fn test_admin_sees_everything() {
        let claims = Claims::new("admin", Role::Admin, vec![]);
        assert!(claims.can_access_orgs(&[]));
        assert!(claims.can_access_orgs(&orgs(&["o1", "o2"])));
    }

    #[test]
    fn test_billing_role_limited_to_its_orgs() {
        let claims = Claims::new("manager", Role::Billing, orgs(&["o1", "o2"]));
        assert!(claims.can_access_orgs(&orgs(&["o1"])));
        assert!(claims.can_access_orgs(&orgs(&["o2", "o1"])));
        assert!(!claims.can_access_orgs(&orgs(&["o1", "o3"])));
        assert!(!claims.can_access_orgs(&[]));
    }

    #[test]
    fn test_role_serialization() {
        let claims = Claims::new("manager", Role::Billing, orgs(&["o1"]));
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["role"], "billing");
        assert_eq!(json["orgs"][0], "o1");

        let parsed: Claims = serde_json::from_value(serde_json::json!({
            "sub": "x", "role": "admin", "iat": 1, "exp": 2
        }))
        .unwrap();
        assert!(parsed.orgs.is_empty());
        assert!(parsed.is_admin());
    }
}
