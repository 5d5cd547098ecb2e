use serde::{Deserialize, Serialize};

/// Authorization scopes. `Admin` implies every other scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Admin,
    Analytics,
    Powerbi,
    Tableau,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
            Self::Analytics => "analytics",
            Self::Powerbi => "powerbi",
            Self::Tableau => "tableau",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            "analytics" => Some(Self::Analytics),
            "powerbi" => Some(Self::Powerbi),
            "tableau" => Some(Self::Tableau),
            _ => None,
        }
    }
}

/// Join scopes the way token claims carry them (`scope: "read write"`).
pub fn join_scopes(scopes: &[Scope]) -> String {
    scopes.iter().map(Scope::as_str).collect::<Vec<_>>().join(" ")
}

/// Parse a space-separated scope claim, dropping unknown tokens.
pub fn split_scopes(scope: &str) -> Vec<Scope> {
    scope.split_whitespace().filter_map(Scope::parse).collect()
}

/// An API key row as stored. `key_hash` is `salt$digest`; the plaintext key
/// exists only in the creation response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<Scope>,
    pub rate_limit: i64,
    pub is_active: bool,
    pub expires_at: Option<String>,
    pub last_used: Option<String>,
    pub usage_count: i64,
    pub created_at: String,
}

/// Creation response: the only place the plaintext key appears.
#[derive(Debug, Serialize)]
pub struct ApiKeyCreated {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub key_prefix: String,
    pub scopes: Vec<Scope>,
    pub rate_limit: i64,
    pub expires_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub rate_limit: Option<i64>,
    /// Days until expiry; omitted means no expiry.
    #[serde(default)]
    pub expires_in_days: Option<i64>,
}

fn default_scopes() -> Vec<Scope> {
    vec![Scope::Read]
}

/// JWT claims for issued bearer tokens (HS256).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub scope: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub aud: String,
    pub jti: String,
    pub api_key_name: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: String,
}

/// Authenticated identity attached to request extensions by the auth
/// middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: i64,
    pub api_key_name: String,
    pub scopes: Vec<Scope>,
    pub rate_limit: i64,
    pub jti: String,
}

impl AuthContext {
    pub fn has_scope(&self, required: Scope) -> bool {
        self.scopes.contains(&Scope::Admin) || self.scopes.contains(&required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_claim_round_trip() {
        let scopes = vec![Scope::Read, Scope::Analytics];
        let claim = join_scopes(&scopes);
        assert_eq!(claim, "read analytics");
        assert_eq!(split_scopes(&claim), scopes);
    }

    #[test]
    fn unknown_scope_tokens_are_dropped()  {
        assert_eq!(split_scopes("read superuser write"), vec![Scope::Read, Scope::Write]);
    }

    #[test]
    fn admin_implies_all() {
        let ctx = AuthContext {
            api_key_id: 1,
            api_key_name: "ops".to_string(),
            scopes: vec![Scope::Admin],
            rate_limit: 100,
            jti: "j".to_string(),
        };
        assert!(ctx.has_scope(Scope::Write));
        assert!(ctx.has_scope(Scope::Tableau));
    }

    #[test]
    fn read_does_not_imply_admin() {
        let ctx = AuthContext {
            api_key_id: 1,
            api_key_name: "reader".to_string(),
            scopes: vec![Scope::Read],
            rate_limit: 100,
            jti: "j".to_string(),
        };
        assert!(ctx.has_scope(Scope::Read));
        assert!(!ctx.has_scope(Scope::Admin));
    }

    #[test]
    fn key_hash_is_not_serialized() {
        let record = ApiKeyRecord {
            id: 1,
            name: "n".to_string(),
            key_hash: "salt$digest".to_string(),
            key_prefix: "osv_abcd".to_string(),
            scopes: vec![Scope::Read],
            rate_limit: 100,
            is_active: true,
            expires_at: None,
            last_used: None,
            usage_count: 0,
            created_at: "2025-01-01T00:00:00Z".to_string(),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert!(v.get("key_hash").is_none());
        assert_eq!(v["key_prefix"], "osv_abcd");
    }
}
