use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Claims carried by an admin session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    pub sub: String,
    pub user_id: i64,
    pub is_superuser: bool,
    pub iat: u64,
    pub exp: u64,
}

/// Issues and verifies HMAC-SHA256 signed tokens of the form
/// `v1.<claims-b64>.<sig-b64>`.
#[derive(Clone)]
pub struct TokenSigner {
    secret: String,
    lifetime: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            secret: secret.to_string(),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn issue(&self, username: &str, user_id: i64, is_superuser: bool) -> Result<(String, AuthClaims)> {
        let now = unix_now();
        let claims = AuthClaims {
            sub: username.to_string(),
            user_id,
            is_superuser,
            iat: now,
            exp: now + self.lifetime.as_secs(),
        };

        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let sig = sign(payload_b64.as_bytes(), self.secret.as_bytes());
        let token = format!("v1.{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(sig));
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> Result<AuthClaims> {
        let parts = token.split('.').collect::<Vec<_>>();
        if parts.len() != 3 || parts[0] != "v1" {
            return Err(anyhow!("invalid token format"));
        }

        let payload_b64 = parts[1];
        let sig_b64 = parts[2];

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .context("decode token payload")?;
        let expected_sig = sign(payload_b64.as_bytes(), self.secret.as_bytes());
        let provided_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .context("decode token signature")?;

        if !constant_time_eq(&expected_sig, &provided_sig) {
            return Err(anyhow!("invalid token signature"));
        }

        let claims: AuthClaims =
            serde_json::from_slice(&payload).context("parse token claims")?;
        if claims.exp <= unix_now() {
            return Err(anyhow!("token expired"));
        }

        Ok(claims)
    }
}

/// Tokens are cached and revoked by hash, never by value.
pub fn token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Constant-time credential comparison for the login route.
pub fn credentials_match(supplied: &str, expected: &str) -> bool {
    constant_time_eq(supplied.as_bytes(), expected.as_bytes())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload_b64);
    mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(
            "0123456789abcdef0123456789abcdef",
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn issued_tokens_verify() {
        let signer = signer();
        let (token, claims) = signer.issue("admin", 1, true).expect("issue");
        let verified = signer.verify(&token).expect("verify");
        assert_eq!(verified.sub, "admin");
        assert_eq!(verified.user_id, 1);
        assert!(verified.is_superuser);
        assert_eq!(verified.exp, claims.exp);
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let signer = signer();
        let (token, _) = signer.issue("admin", 1, true).expect("issue");

        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        let forged = URL_SAFE_NO_PAD.encode(
            br#"{"sub":"intruder","user_id":9,"is_superuser":true,"iat":0,"exp":99999999999}"#,
        );
        parts[1] = forged;
        assert!(signer.verify(&parts.join(".")).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (token, _) = signer().issue("admin", 1, false).expect("issue");
        let other = TokenSigner::new(
            "ffffffffffffffffffffffffffffffff",
            Duration::from_secs(3600),
        );
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = TokenSigner::new(
            "0123456789abcdef0123456789abcdef",
            Duration::from_secs(0),
        );
        let (token, _) = signer.issue("admin", 1, false).expect("issue");
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let signer = signer();
        assert!(signer.verify("not-a-token").is_err());
        assert!(signer.verify("v2.a.b").is_err());
        assert!(signer.verify("v1.!!!.???").is_err());
    }

    #[test]
    fn token_hash_is_stable_hex() {
        let hash = token_hash("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, token_hash("abc"));
        assert_ne!(hash, token_hash("abd"));
    }
}
