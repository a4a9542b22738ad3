/// Identity gate for connection handshakes.
/// Verifies HMAC-signed bearer tokens and resolves them to a principal.
/// Token minting belongs to the external credential service; `mint` is the
/// hook it (and the tests) use.
use crate::db::{Database, DbPool};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// The single message every rejected handshake sees, regardless of the
/// underlying failure category (no account enumeration).
pub const OPAQUE_AUTH_ERROR: &str = "authentication error";

/// Authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
}

/// Failure categories, surfaced to logs only; clients always receive
/// [`OPAQUE_AUTH_ERROR`].
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("malformed token")]
    Malformed,

    #[error("bad token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token references unknown user")]
    UnknownUser,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Verifies bearer tokens of the form `{user_id}.{expires_unix}.{hex_sig}`
/// where the signature is HMAC-SHA256 over `{user_id}.{expires_unix}`.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        TokenVerifier {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn sign(&self, signing_input: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(signing_input.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Produce a valid token for `user_id`, expiring after `ttl`.
    pub fn mint(&self, user_id: &str, ttl: Duration) -> String {
        let expires = Self::now_unix() + ttl.as_secs() as i64;
        let signing_input = format!("{user_id}.{expires}");
        let signature = self.sign(&signing_input);
        format!("{signing_input}.{signature}")
    }

    /// Check signature and expiry; returns the embedded user id.
    pub fn parse(&self, token: &str) -> Result<String, AuthError> {
        let mut parts = token.rsplitn(3, '.');
        let signature = parts.next().ok_or(AuthError::Malformed)?;
        let expires_str = parts.next().ok_or(AuthError::Malformed)?;
        let user_id = parts.next().ok_or(AuthError::Malformed)?;
        if user_id.is_empty() || signature.is_empty() {
            return Err(AuthError::Malformed);
        }

        let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;
        let expires: i64 = expires_str.parse().map_err(|_| AuthError::Malformed)?;

        let signing_input = format!("{user_id}.{expires_str}");
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        if expires < Self::now_unix() {
            return Err(AuthError::Expired);
        }

        Ok(user_id.to_string())
    }

    /// Full handshake check: signature, expiry, and user lookup.
    pub async fn verify(
        &self,
        pool: &DbPool,
        token: Option<&str>,
    ) -> Result<Principal, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let user_id = self.parse(token)?;

        let user = Database::get_user_by_id(pool, &user_id)
            .await?
            .ok_or(AuthError::UnknownUser)?;

        Ok(Principal {
            user_id: user.id,
            username: user.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_mint_and_verify() {
        let pool = create_test_pool();
        let user = Database::create_user(&pool, "alice", "ehash", "phash")
            .await
            .expect("Failed to create user");

        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.mint(&user.id, Duration::from_secs(60));

        let principal = verifier
            .verify(&pool, Some(&token))
            .await
            .expect("Token should verify");
        assert_eq!(principal.user_id, user.id);
        assert_eq!(principal.username, "alice");
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let pool = create_test_pool();
        let verifier = TokenVerifier::new("test-secret");

        let result = verifier.verify(&pool, None).await;
        assert!(matches!(result, Err(AuthError::MissingToken)));
    }

    #[test]
    fn test_malformed_token_rejected() {
        let verifier = TokenVerifier::new("test-secret");

        assert!(matches!(verifier.parse(""), Err(AuthError::Malformed)));
        assert!(matches!(
            verifier.parse("no-separators"),
            Err(AuthError::Malformed)
        ));
        assert!(matches!(
            verifier.parse("user.notanumber.abcd"),
            Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.mint("u1", Duration::from_secs(60));

        // Swap the embedded user id; signature no longer matches
        let tampered = token.replacen("u1", "u2", 1);
        assert!(matches!(
            verifier.parse(&tampered),
            Err(AuthError::BadSignature)
        ));

        // A token minted under a different secret is rejected too
        let other = TokenVerifier::new("other-secret").mint("u1", Duration::from_secs(60));
        assert!(matches!(verifier.parse(&other), Err(AuthError::BadSignature)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.mint("u1", Duration::from_secs(0));

        // ttl 0 expires one second boundary in the past at worst
        std::thread::sleep(Duration::from_millis(1100));
        assert!(matches!(verifier.parse(&token), Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let pool = create_test_pool();
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.mint("ghost-user", Duration::from_secs(60));

        let result = verifier.verify(&pool, Some(&token)).await;
        assert!(matches!(result, Err(AuthError::UnknownUser)));
    }

    #[test]
    fn test_user_id_with_dots_survives_parsing() {
        // rsplitn keeps any dots inside the user id intact
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.mint("user.with.dots", Duration::from_secs(60));
        let parsed = verifier.parse(&token).expect("Token should parse");
        assert_eq!(parsed, "user.with.dots");
    }
}
