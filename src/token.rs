//! Signed, purpose-scoped, single-use action tokens.
//!
//! Wire format: `base64url(bincode(claims)) "." base64url(blake3_keyed(claims))`.
//! The signer only proves the token was minted here and is unexpired; the
//! single-use marker is the nonce recorded in the booking's consumed set.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

const KEY_CONTEXT: &str = "slotd 2025 action-token mac v1";
const GUEST_CONTEXT: &str = "slotd 2025 guest identity v1";
const MAX_TOKEN_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenPurpose {
    Cancel,
    Reschedule,
}

impl TokenPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenPurpose::Cancel => "cancel",
            TokenPurpose::Reschedule => "reschedule",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub booking_id: Ulid,
    pub purpose: TokenPurpose,
    /// Keyed hash of the guest's normalized identity.
    pub guest: [u8; 16],
    pub nonce: Ulid,
    pub expires_at: Ms,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Issues and verifies action tokens with a process secret.
pub struct TokenSigner {
    key: [u8; 32],
    ttl_ms: Ms,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").field("ttl_ms", &self.ttl_ms).finish()
    }
}

impl TokenSigner {
    pub fn new(secret: &[u8], ttl_ms: Ms) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret),
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    /// Fingerprint a guest identity so tokens don't carry the raw email.
    pub fn guest_fingerprint(&self, identity: &str) -> [u8; 16] {
        let mut hasher = blake3::Hasher::new_derive_key(GUEST_CONTEXT);
        hasher.update(&self.key);
        hasher.update(identity.as_bytes());
        let mut out = [0u8; 16];
        out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        out
    }

    pub fn issue(
        &self,
        booking_id: Ulid,
        purpose: TokenPurpose,
        guest_identity: &str,
        nonce: Ulid,
        now: Ms,
    ) -> String {
        let claims = TokenClaims {
            booking_id,
            purpose,
            guest: self.guest_fingerprint(guest_identity),
            nonce,
            expires_at: now.saturating_add(self.ttl_ms),
        };
        self.encode(&claims)
    }

    fn encode(&self, claims: &TokenClaims) -> String {
        // bincode of a fixed-shape struct cannot fail
        let payload = bincode::serialize(claims).unwrap_or_default();
        let tag = blake3::keyed_hash(&self.key, &payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag.as_bytes())
        )
    }

    /// Check format and signature only. Expiry is reported separately by
    /// [`TokenSigner::check_expiry`] so callers can order their checks.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(TokenError::Malformed);
        }
        let (payload_b64, tag_b64) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| TokenError::Malformed)?;

        let expected = blake3::keyed_hash(&self.key, &payload);
        if !constant_time_eq::constant_time_eq(expected.as_bytes(), &tag) {
            return Err(TokenError::BadSignature);
        }
        bincode::deserialize(&payload).map_err(|_| TokenError::Malformed)
    }

    pub fn check_expiry(claims: &TokenClaims, now: Ms) -> Result<(), TokenError> {
        if claims.expires_at <= now {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    /// Constant-time comparison of a claim's guest binding.
    pub fn guest_matches(&self, claims: &TokenClaims, guest_identity: &str) -> bool {
        constant_time_eq::constant_time_eq(&claims.guest, &self.guest_fingerprint(guest_identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Ms = 3_600_000;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"test-secret", 24 * HOUR)
    }

    #[test]
    fn issue_then_verify() {
        let s = signer();
        let bid = Ulid::new();
        let nonce = Ulid::new();
        let token = s.issue(bid, TokenPurpose::Cancel, "ada@example.com", nonce, 1_000);
        let claims = s.verify(&token).unwrap();
        assert_eq!(claims.booking_id, bid);
        assert_eq!(claims.purpose, TokenPurpose::Cancel);
        assert_eq!(claims.nonce, nonce);
        assert_eq!(claims.expires_at, 1_000 + 24 * HOUR);
        assert!(s.guest_matches(&claims, "ada@example.com"));
        assert!(!s.guest_matches(&claims, "eve@example.com"));
    }

    #[test]
    fn tampered_payload_rejected() {
        let s = signer();
        let token = s.issue(Ulid::new(), TokenPurpose::Cancel, "a@b.c", Ulid::new(), 0);
        let (_, tag) = token.split_once('.').unwrap();

        // Payload from another token, tag from this one
        let forged_claims = s.issue(Ulid::new(), TokenPurpose::Reschedule, "a@b.c", Ulid::new(), 0);
        let (forged_payload, _) = forged_claims.split_once('.').unwrap();
        let spliced = format!("{forged_payload}.{tag}");
        assert_eq!(s.verify(&spliced), Err(TokenError::BadSignature));
    }

    #[test]
    fn other_secret_rejected() {
        let a = signer();
        let b = TokenSigner::new(b"another-secret", 24 * HOUR);
        let token = a.issue(Ulid::new(), TokenPurpose::Cancel, "a@b.c", Ulid::new(), 0);
        assert_eq!(b.verify(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn malformed_tokens() {
        let s = signer();
        assert_eq!(s.verify("no-dot-here"), Err(TokenError::Malformed));
        assert_eq!(s.verify("!!!.???"), Err(TokenError::Malformed));
        assert_eq!(s.verify(&"a".repeat(MAX_TOKEN_LEN + 1)), Err(TokenError::Malformed));
    }

    #[test]
    fn expiry_boundary() {
        let s = signer();
        let token = s.issue(Ulid::new(), TokenPurpose::Reschedule, "a@b.c", Ulid::new(), 0);
        let claims = s.verify(&token).unwrap();
        assert!(TokenSigner::check_expiry(&claims, 24 * HOUR - 1).is_ok());
        assert_eq!(
            TokenSigner::check_expiry(&claims, 24 * HOUR),
            Err(TokenError::Expired)
        );
    }
}
