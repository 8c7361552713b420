//! Token Service (C4): short-lived, HMAC-signed download tokens for
//! artifact bytes, mirroring the original's `artifacts/tokens.py` format
//! exactly — `b64url(artifact_id.expiry) + "." + b64url(hmac)`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::Secret;
use crate::error::TokenError;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime, seconds, used when the caller doesn't override it.
pub const DEFAULT_TTL_SECONDS: u64 = 600;

/// An artifact id and expiry recovered from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub artifact_id: String,
    pub expires_at: i64,
}

/// Issues and verifies download tokens for one artifact server.
pub struct TokenService {
    secret: Secret,
    ttl_seconds: u64,
    public_base_url: Option<String>,
    server_port: u16,
}

impl TokenService {
    #[must_use]
    pub fn new(secret: Secret, ttl_seconds: u64, public_base_url: Option<String>, server_port: u16) -> Self {
        Self { secret, ttl_seconds, public_base_url, server_port }
    }

    /// Mint a token for `artifact_id`, expiring `ttl_seconds` from `now`.
    #[must_use]
    pub fn create_token_at(&self, artifact_id: &str, now: i64) -> String {
        let expires_at = now + i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        let message = format!("{artifact_id}.{expires_at}");
        let sig = self.sign(message.as_bytes());
        format!("{}.{}", URL_SAFE_NO_PAD.encode(message), URL_SAFE_NO_PAD.encode(sig))
    }

    /// Mint a token for `artifact_id` expiring `ttl_seconds` from now.
    #[must_use]
    pub fn create_token(&self, artifact_id: &str) -> String {
        self.create_token_at(artifact_id, now_unix())
    }

    /// Verify a token against a specific artifact id at a given instant.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidFormat`] if the token isn't two
    /// dot-separated base64url segments whose decoded message is itself
    /// `artifact_id.expiry`, [`TokenError::InvalidSignature`] if the HMAC
    /// doesn't match, [`TokenError::Expired`] if `now` is past the encoded
    /// expiry, or [`TokenError::MismatchedArtifact`] if the token is valid
    /// but for a different artifact.
    pub fn verify_token_for_at(
        &self,
        token: &str,
        artifact_id: &str,
        now: i64,
    ) -> Result<VerifiedToken, TokenError> {
        let verified = self.verify_token_at(token, now)?;
        if verified.artifact_id != artifact_id {
            return Err(TokenError::MismatchedArtifact);
        }
        Ok(verified)
    }

    /// Verify a token without pinning it to a particular artifact id.
    ///
    /// # Errors
    ///
    /// See [`Self::verify_token_for_at`].
    pub fn verify_token_at(&self, token: &str, now: i64) -> Result<VerifiedToken, TokenError> {
        let (message_b64, sig_b64) = token.split_once('.').ok_or(TokenError::InvalidFormat)?;

        let message = URL_SAFE_NO_PAD.decode(message_b64).map_err(|_| TokenError::InvalidFormat)?;
        let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::InvalidFormat)?;

        let mut mac = HmacSha256::new_from_slice(self.secret.bytes()).expect("HMAC accepts any key length");
        mac.update(&message);
        mac.verify_slice(&sig).map_err(|_| TokenError::InvalidSignature)?;

        let message_str = String::from_utf8(message).map_err(|_| TokenError::InvalidFormat)?;
        let (artifact_id, expires_at_str) = message_str.rsplit_once('.').ok_or(TokenError::InvalidFormat)?;
        let expires_at: i64 = expires_at_str.parse().map_err(|_| TokenError::InvalidFormat)?;

        if now > expires_at {
            return Err(TokenError::Expired);
        }

        Ok(VerifiedToken { artifact_id: artifact_id.to_owned(), expires_at })
    }

    /// Build the public URL a client should use to fetch an artifact,
    /// using `ARTIFACTS_PUBLIC_BASE_URL` if configured, else
    /// `http://localhost:{port}`.
    #[must_use]
    pub fn create_download_url(&self, artifact_id: &str) -> String {
        let token = self.create_token(artifact_id);
        let base = self
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.server_port));
        format!("{}/artifacts/{}?token={}", base.trim_end_matches('/'), artifact_id, token)
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.secret.bytes()).expect("HMAC accepts any key length");
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(Secret::Fixed(b"test-secret".to_vec()), 600, None, 8000)
    }

    #[test]
    fn round_trips_a_fresh_token() {
        let svc = service();
        let token = svc.create_token_at("art_abc123", 1_000);
        let verified = svc.verify_token_at(&token, 1_100).expect("should verify");
        assert_eq!(verified.artifact_id, "art_abc123");
        assert_eq!(verified.expires_at, 1_600);
    }

    #[test]
    fn rejects_expired_token() {
        let svc = service();
        let token = svc.create_token_at("art_abc123", 1_000);
        let err = svc.verify_token_at(&token, 1_601).unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn rejects_tampered_signature() {
        let svc = service();
        let token = svc.create_token_at("art_abc123", 1_000);
        let (message, _sig) = token.split_once('.').unwrap();
        let other = service();
        let forged_sig = other.sign(b"garbage");
        let forged = format!("{}.{}", message, URL_SAFE_NO_PAD.encode(forged_sig));
        let err = svc.verify_token_at(&forged, 1_100).unwrap_err();
        assert_eq!(err, TokenError::InvalidSignature);
    }

    #[test]
    fn rejects_malformed_token() {
        let svc = service();
        let err = svc.verify_token_at("not-a-token", 1_100).unwrap_err();
        assert_eq!(err, TokenError::InvalidFormat);
    }

    #[test]
    fn mismatched_artifact_is_rejected() {
        let svc = service();
        let token = svc.create_token_at("art_abc123", 1_000);
        let err = svc.verify_token_for_at(&token, "art_other", 1_100).unwrap_err();
        assert_eq!(err, TokenError::MismatchedArtifact);
    }

    #[test]
    fn download_url_uses_configured_base() {
        let svc = TokenService::new(Secret::Fixed(b"k".to_vec()), 600, Some("https://cdn.example.com/".into()), 8000);
        let url = svc.create_download_url("art_abc123");
        assert!(url.starts_with("https://cdn.example.com/artifacts/art_abc123?token="));
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_single_bit_flip_breaks_verification(
                artifact_id in "[a-z0-9_]{1,20}",
                flip_byte in 0_usize..64,
                flip_bit in 0_u8..8,
            ) {
                let svc = service();
                let token = svc.create_token_at(&artifact_id, 1_000);
                let mut bytes: Vec<u8> = token.clone().into_bytes();
                let idx = flip_byte % bytes.len();
                bytes[idx] ^= 1 << flip_bit;
                let Ok(flipped) = String::from_utf8(bytes) else { return Ok(()) };
                if flipped == token {
                    return Ok(());
                }
                prop_assert!(svc.verify_token_at(&flipped, 1_100).is_err());
            }
        }
    }
}
