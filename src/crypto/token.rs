// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Sealed capability tokens for URL-embedded identifiers
//!
//! Subscription, update, and receipt identifiers are never exposed directly;
//! they are sealed into an opaque token that is safe to embed in a URL.
//!
//! **Token Format**:
//! ```text
//! base64url( nonce (12 bytes) | ciphertext+tag )
//! ```
//!
//! - Algorithm: AES-256-GCM, keyed by a server-held secret
//! - Nonce: 12 bytes (96 bits), random per seal
//! - Plaintext: the identifier string, optionally prefixed with an 8-byte
//!   big-endian issued-at timestamp (unix millis) when a TTL is configured
//!
//! Tokens are unforgeable and unreadable by clients, and round-trip exactly:
//! `unseal(seal(x)) == x` for every valid `x`. Composite identifiers are
//! `:`-joined before sealing (`subId:updateId`, `subId:updateId:receiptId`,
//! `subId:receiptId`) and split after unsealing.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::Utc;
use rand::RngCore;
use std::time::Duration;
use thiserror::Error;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Issued-at prefix length when a TTL is configured.
const ISSUED_AT_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum TokenError {
    /// The token is malformed, tampered with, or expired.
    #[error("invalid or expired token")]
    InvalidToken,

    /// The codec itself is misconfigured. Never returned for valid input.
    #[error("token codec misconfigured: {0}")]
    Crypto(String),
}

/// Seals and unseals identifiers with a symmetric, authenticated cipher.
#[derive(Clone)]
pub struct TokenCodec {
    cipher: Aes256Gcm,
    ttl: Option<Duration>,
}

impl TokenCodec {
    /// Create a codec from a raw 32-byte key.
    pub fn new(key: &[u8; 32], ttl: Option<Duration>) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key is always valid");
        Self { cipher, ttl }
    }

    /// Create a codec from a base64-encoded 32-byte secret, as configured.
    pub fn from_base64(secret: &str, ttl: Option<Duration>) -> Result<Self, TokenError> {
        let bytes = STANDARD
            .decode(secret.trim())
            .map_err(|err| TokenError::Crypto(format!("token key is not valid base64: {err}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            TokenError::Crypto(format!(
                "token key must decode to 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key, ttl))
    }

    /// Create a codec with a freshly generated random key.
    ///
    /// Tokens sealed with an ephemeral key do not survive a restart.
    pub fn random(ttl: Option<Duration>) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key, ttl)
    }

    /// Seal a plain identifier into an opaque URL-safe token.
    pub fn seal(&self, plain: &str) -> Result<String, TokenError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut message = Vec::with_capacity(ISSUED_AT_LEN + plain.len());
        if self.ttl.is_some() {
            let issued_at = Utc::now().timestamp_millis();
            message.extend_from_slice(&issued_at.to_be_bytes());
        }
        message.extend_from_slice(plain.as_bytes());

        let ciphertext = self
            .cipher
            .encrypt(nonce, message.as_slice())
            .map_err(|_| TokenError::Crypto("AES-GCM encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Unseal a token back into the plain identifier.
    ///
    /// Fails with [`TokenError::InvalidToken`] on malformed encoding, failed
    /// integrity verification, or expiry; the reason is deliberately not
    /// distinguished to callers.
    pub fn unseal(&self, token: &str) -> Result<String, TokenError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| TokenError::InvalidToken)?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(TokenError::InvalidToken);
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        let message = self
            .cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| TokenError::InvalidToken)?;

        let plain = match self.ttl {
            None => message,
            Some(ttl) => {
                if message.len() < ISSUED_AT_LEN {
                    return Err(TokenError::InvalidToken);
                }
                let (stamp, rest) = message.split_at(ISSUED_AT_LEN);
                let stamp: [u8; 8] = stamp.try_into().map_err(|_| TokenError::InvalidToken)?;
                let issued_at = i64::from_be_bytes(stamp);
                let age = Utc::now().timestamp_millis().saturating_sub(issued_at);
                if age < 0 || age as u128 > ttl.as_millis() {
                    return Err(TokenError::InvalidToken);
                }
                rest.to_vec()
            }
        };

        String::from_utf8(plain).map_err(|_| TokenError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal_round_trip() {
        let codec = TokenCodec::random(None);
        let plain = "0a4f6a39-6f3b-4a5e-9c83-000000000001:0a4f6a39-6f3b-4a5e-9c83-000000000002";
        let token = codec.seal(plain).unwrap();
        assert_eq!(codec.unseal(&token).unwrap(), plain);
    }

    #[test]
    fn test_tokens_are_unique_per_seal() {
        let codec = TokenCodec::random(None);
        let a = codec.seal("same").unwrap();
        let b = codec.seal("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let codec = TokenCodec::random(None);
        let token = codec.seal("subscription-id").unwrap();
        let mut sealed = URL_SAFE_NO_PAD.decode(token.as_bytes()).unwrap();
        for bit in 0..8 {
            let mut tampered = sealed.clone();
            tampered[sealed.len() / 2] ^= 1 << bit;
            let tampered_token = URL_SAFE_NO_PAD.encode(&tampered);
            assert!(matches!(
                codec.unseal(&tampered_token),
                Err(TokenError::InvalidToken)
            ));
        }
        // Truncation is rejected too.
        sealed.truncate(NONCE_LEN + TAG_LEN - 1);
        let short = URL_SAFE_NO_PAD.encode(&sealed);
        assert!(matches!(codec.unseal(&short), Err(TokenError::InvalidToken)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let codec = TokenCodec::random(None);
        assert!(matches!(
            codec.unseal("not base64 at all!!"),
            Err(TokenError::InvalidToken)
        ));
        assert!(matches!(codec.unseal(""), Err(TokenError::InvalidToken)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealer = TokenCodec::random(None);
        let other = TokenCodec::random(None);
        let token = sealer.seal("subscription-id").unwrap();
        assert!(matches!(other.unseal(&token), Err(TokenError::InvalidToken)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let codec = TokenCodec::random(Some(Duration::ZERO));
        let token = codec.seal("subscription-id").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(codec.unseal(&token), Err(TokenError::InvalidToken)));
    }

    #[test]
    fn test_unexpired_token_accepted() {
        let codec = TokenCodec::random(Some(Duration::from_secs(3600)));
        let token = codec.seal("subscription-id").unwrap();
        assert_eq!(codec.unseal(&token).unwrap(), "subscription-id");
    }

    #[test]
    fn test_key_material_round_trips_through_base64() {
        let mut key = [7u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let secret = STANDARD.encode(key);
        let a = TokenCodec::from_base64(&secret, None).unwrap();
        let b = TokenCodec::from_base64(&secret, None).unwrap();
        let token = a.seal("shared").unwrap();
        assert_eq!(b.unseal(&token).unwrap(), "shared");
    }

    #[test]
    fn test_bad_key_material_rejected() {
        assert!(matches!(
            TokenCodec::from_base64("too-short", None),
            Err(TokenError::Crypto(_))
        ));
    }
}
