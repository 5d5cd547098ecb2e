use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{ApiError, ApiResult};
use crate::metadata_db::MetadataDb;
use crate::models::audit::AuditEvent;
use crate::models::auth::{
    ApiKeyCreated, ApiKeyRecord, Scope, TokenClaims, TokenResponse, join_scopes,
};

pub const KEY_NAMESPACE: &str = "osv_";
const TOKEN_ISSUER: &str = "osservatorio-istat";
const TOKEN_AUDIENCE: &str = "osservatorio-api";
/// Prefix length used as the lookup bucket (`osv_` + 8 chars).
const PREFIX_LEN: usize = 12;

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes[..]);
    bytes
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time byte comparison; no early exit on mismatch.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Salted SHA-256 of the full key, stored as `salt_hex$digest_hex`.
fn hash_key(key: &str) -> String {
    let salt = random_bytes::<16>();
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(key.as_bytes());
    format!("{}${:x}", hex(&salt), hasher.finalize())
}

fn verify_key_hash(key: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = (0..salt_hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(salt_hex.get(i..i + 2).unwrap_or("zz"), 16))
        .collect::<Result<Vec<u8>, _>>()
    else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(key.as_bytes());
    let digest = hex(&hasher.finalize());
    ct_eq(digest.as_bytes(), digest_hex.as_bytes())
}

/// API-key issuance/verification and bearer-token mint/verify/revoke.
/// Revocations are held in an in-memory set backed by the persistent
/// `token_revocations` table.
pub struct AuthService {
    db: Arc<MetadataDb>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl_secs: i64,
    default_rate_limit: i64,
    revoked: Mutex<HashSet<String>>,
}

impl AuthService {
    pub fn new(
        db: Arc<MetadataDb>,
        secret: Option<String>,
        token_ttl_minutes: i64,
        default_rate_limit: i64,
    ) -> Self {
        let secret = match secret {
            Some(s) if !s.is_empty() => s,
            _ => {
                let generated = hex(&random_bytes::<32>());
                tracing::warn!(
                    "no jwt_secret_key configured, generated an ephemeral secret; \
                     tokens will not survive a restart"
                );
                generated
            }
        };
        Self {
            db,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_ttl_secs: token_ttl_minutes * 60,
            default_rate_limit,
            revoked: Mutex::new(HashSet::new()),
        }
    }

    // ── Key lifecycle ──

    /// Issue a new API key. The plaintext is returned exactly once.
    pub fn create_key(
        &self,
        name: &str,
        scopes: &[Scope],
        rate_limit: Option<i64>,
        expires_in_days: Option<i64>,
    ) -> ApiResult<ApiKeyCreated> {
        if name.trim().is_empty() {
            return Err(ApiError::validation("key name must not be empty"));
        }
        if scopes.is_empty() {
            return Err(ApiError::validation("at least one scope is required"));
        }
        let suffix = URL_SAFE_NO_PAD.encode(random_bytes::<32>());
        let api_key = format!("{KEY_NAMESPACE}{suffix}");
        let key_prefix = api_key[..PREFIX_LEN].to_string();
        let key_hash = hash_key(&api_key);
        let rate_limit = rate_limit.unwrap_or(self.default_rate_limit);
        if rate_limit <= 0 {
            return Err(ApiError::validation("rate_limit must be positive"));
        }
        let expires_at = expires_in_days.map(|days| {
            (chrono::Utc::now() + chrono::Duration::days(days))
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string()
        });

        let audit = AuditEvent::ok("api_key_create", "api_key", Some(name.to_string()))
            .detail(format!("scopes={}", join_scopes(scopes)));
        let id = self.db.create_api_key(
            name,
            &key_hash,
            &key_prefix,
            scopes,
            rate_limit,
            expires_at.as_deref(),
            &audit,
        )?;

        Ok(ApiKeyCreated {
            id,
            name: name.to_string(),
            api_key,
            key_prefix,
            scopes: scopes.to_vec(),
            rate_limit,
            expires_at,
            created_at: now_ts(),
        })
    }

    /// Verify a plaintext key: prefix bucket lookup, constant-time hash
    /// compare, usage bump on match.
    pub fn verify_key(&self, api_key: &str) -> ApiResult<ApiKeyRecord> {
        if !api_key.starts_with(KEY_NAMESPACE) || api_key.len() < PREFIX_LEN {
            return Err(ApiError::unauthorized("invalid credentials"));
        }
        let prefix = &api_key[..PREFIX_LEN];
        let candidates = self.db.find_keys_by_prefix(prefix, &now_ts())?;
        for candidate in candidates {
            if verify_key_hash(api_key, &candidate.key_hash) {
                self.db.touch_key_usage(candidate.id)?;
                return Ok(candidate);
            }
        }
        // one message for unknown/inactive/expired keys
        Err(ApiError::unauthorized("invalid credentials"))
    }

    pub fn list_keys(&self) -> ApiResult<Vec<ApiKeyRecord>> {
        self.db.list_api_keys()
    }

    pub fn revoke_key(&self, id: i64, revoked_by: &str) -> ApiResult<bool> {
        let audit = AuditEvent::ok("api_key_revoke", "api_key", Some(id.to_string()))
            .user(revoked_by.to_string());
        self.db.revoke_api_key(id, &audit)
    }

    // ── Bearer tokens ──

    /// Mint a short-lived bearer token for a verified key.
    pub fn mint_token(&self, key: &ApiKeyRecord) -> ApiResult<TokenResponse> {
        let now = chrono::Utc::now().timestamp();
        let scope = join_scopes(&key.scopes);
        let claims = TokenClaims {
            sub: key.id.to_string(),
            scope: scope.clone(),
            exp: now + self.token_ttl_secs,
            iat: now,
            iss: TOKEN_ISSUER.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
            jti: URL_SAFE_NO_PAD.encode(random_bytes::<16>()),
            api_key_name: key.name.clone(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ApiError::internal(format!("token encoding failed: {e}")))?;
        Ok(TokenResponse {
            access_token: token,
            token_type: "bearer",
            expires_in: self.token_ttl_secs,
            scope,
        })
    }

    /// Verify signature, expiry, issuer, and revocation state. Audience
    /// verification is intentionally relaxed.
    pub fn verify_token(&self, token: &str) -> ApiResult<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.validate_aud = false;
        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| ApiError::unauthorized("invalid or expired token"))?;
        let claims = data.claims;

        if self.revoked.lock().unwrap().contains(&claims.jti)
            || self.db.is_token_revoked(&claims.jti)?
        {
            return Err(ApiError::unauthorized("invalid or expired token"));
        }
        Ok(claims)
    }

    /// Revoke a verified token until its natural expiry.
    pub fn revoke_token(&self, token: &str) -> ApiResult<()> {
        let claims = self.verify_token(token)?;
        self.revoked.lock().unwrap().insert(claims.jti.clone());
        self.db.revoke_token(&claims.jti, claims.exp)?;
        Ok(())
    }

    /// Purge expired revocations from memory and the store.
    pub fn cleanup_expired(&self) -> ApiResult<usize> {
        let now = chrono::Utc::now().timestamp();
        let removed = self.db.cleanup_expired_tokens(now)?;
        // memory set entries expire with token verification, clearing is safe
        if removed > 0 {
            self.revoked.lock().unwrap().clear();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        let db = Arc::new(MetadataDb::open_in_memory().unwrap());
        AuthService::new(db, Some("test-secret".to_string()), 60, 100)
    }

    #[test]
    fn key_format_and_single_plaintext_exposure() {
        let svc = service();
        let created = svc.create_key("tableau-reader", &[Scope::Read, Scope::Tableau], None, None)
            .unwrap();
        assert!(created.api_key.starts_with("osv_"));
        assert_eq!(created.api_key.len(), KEY_NAMESPACE.len() + 43);
        assert_eq!(created.key_prefix.len(), PREFIX_LEN);
        assert_eq!(created.rate_limit, 100);

        // subsequent listings never include the plaintext or the raw hash
        let listed = svc.list_keys().unwrap();
        let json = serde_json::to_value(&listed).unwrap();
        assert!(!json.to_string().contains(&created.api_key));
    }

    #[test]
    fn verify_accepts_the_issued_key_only() {
        let svc = service();
        let created = svc.create_key("svc", &[Scope::Read], None, None).unwrap();
        let record = svc.verify_key(&created.api_key).unwrap();
        assert_eq!(record.id, created.id);
        assert_eq!(record.usage_count, 0); // bumped after the read

        assert!(svc.verify_key("osv_definitely-not-a-key-aaaaaaaaaaaaaaaaaaa").is_err());
        assert!(svc.verify_key("wrong_prefix").is_err());
        // same prefix, different suffix
        let forged = format!("{}{}", &created.api_key[..PREFIX_LEN], "x".repeat(31));
        assert!(svc.verify_key(&forged).is_err());
    }

    #[test]
    fn verify_bumps_usage() {
        let svc = service();
        let created = svc.create_key("svc", &[Scope::Read], None, None).unwrap();
        svc.verify_key(&created.api_key).unwrap();
        let record = svc.verify_key(&created.api_key).unwrap();
        assert_eq!(record.usage_count, 1);
        assert!(record.last_used.is_some());
    }

    #[test]
    fn revoked_key_stops_verifying() {
        let svc = service();
        let created = svc.create_key("svc", &[Scope::Read], None, None).unwrap();
        svc.revoke_key(created.id, "admin").unwrap();
        let err = svc.verify_key(&created.api_key).unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }

    #[test]
    fn token_round_trip() {
        let svc = service();
        let created = svc.create_key("svc", &[Scope::Read, Scope::Analytics], None, None).unwrap();
        let record = svc.verify_key(&created.api_key).unwrap();
        let token = svc.mint_token(&record).unwrap();
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.expires_in, 3600);

        let claims = svc.verify_token(&token.access_token).unwrap();
        assert_eq!(claims.sub, record.id.to_string());
        assert_eq!(claims.scope, "read analytics");
        assert_eq!(claims.iss, "osservatorio-istat");
        assert_eq!(claims.aud, "osservatorio-api");
        assert!(claims.exp - claims.iat <= 3600);
        assert_eq!(claims.api_key_name, "svc");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let svc = service();
        let created = svc.create_key("svc", &[Scope::Read], None, None).unwrap();
        let record = svc.verify_key(&created.api_key).unwrap();
        let token = svc.mint_token(&record).unwrap().access_token;
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(svc.verify_token(&tampered).is_err());
        assert!(svc.verify_token("not-a-jwt").is_err());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let svc = service();
        let other = service();
        let created = other.create_key("svc", &[Scope::Read], None, None).unwrap();
        let record = other.verify_key(&created.api_key).unwrap();
        let foreign = other.mint_token(&record).unwrap().access_token;
        // `service()` instances use the same secret but separate stores; build
        // one with a different secret to prove signature checking
        let db = Arc::new(MetadataDb::open_in_memory().unwrap());
        let different = AuthService::new(db, Some("another-secret".to_string()), 60, 100);
        assert!(different.verify_token(&foreign).is_err());
        assert!(svc.verify_token(&foreign).is_ok());
    }

    #[test]
    fn revoked_token_is_rejected() {
        let svc = service();
        let created = svc.create_key("svc", &[Scope::Read], None, None).unwrap();
        let record = svc.verify_key(&created.api_key).unwrap();
        let token = svc.mint_token(&record).unwrap().access_token;
        assert!(svc.verify_token(&token).is_ok());
        svc.revoke_token(&token).unwrap();
        let err = svc.verify_token(&token).unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }

    #[test]
    fn hash_verification_is_salted() {
        let h1 = hash_key("osv_samekey");
        let h2 = hash_key("osv_samekey");
        assert_ne!(h1, h2); // different salts
        assert!(verify_key_hash("osv_samekey", &h1));
        assert!(verify_key_hash("osv_samekey", &h2));
        assert!(!verify_key_hash("osv_otherkey", &h1));
        assert!(!verify_key_hash("osv_samekey", "garbage"));
    }

    #[test]
    fn ct_eq_basic() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }

    #[test]
    fn invalid_create_inputs() {
        let svc = service();
        assert!(svc.create_key("", &[Scope::Read], None, None).is_err());
        assert!(svc.create_key("x", &[], None, None).is_err());
        assert!(svc.create_key("x", &[Scope::Read], Some(0), None).is_err());
    }
}
