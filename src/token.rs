//! session-gate/src/token.rs
//! Session token verification and claim parsing.
//!
//! A token is `base64url(payload) "." base64url(HMAC-SHA256(base64url(payload)))`,
//! both halves without padding. The MAC covers the *encoded* payload, so tokens
//! minted by the issuing service keep verifying byte for byte.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8], message: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac
}

/// Produces a token for `payload`. The gate itself never issues tokens; this
/// exists for tooling and tests that need to speak the same format.
pub fn sign(payload: &str, secret: &[u8]) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(payload);
    let signature = mac_for(secret, encoded.as_bytes()).finalize().into_bytes();
    format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(signature))
}

/// Authenticates `token` and returns its decoded payload.
pub fn verify(token: &str, secret: &[u8]) -> Option<String> {
    let mut parts = token.split('.');
    let (Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    let signature = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;
    // verify_slice compares in constant time
    mac_for(secret, payload_b64.as_bytes())
        .verify_slice(&signature)
        .ok()?;

    let raw = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    String::from_utf8(raw).ok()
}

/// Key/value claims carried in a token payload (`k1=v1;k2=v2`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Claims(HashMap<String, String>);

impl Claims {
    /// Empty segments and segments without `=` are skipped; later duplicates win.
    pub fn parse(payload: &str) -> Self {
        let map = payload
            .split(';')
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Claims(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Expiry in Unix seconds. Missing or unparsable values count as 0,
    /// which is always in the past.
    pub fn expires_at(&self) -> i64 {
        self.get("exp")
            .and_then(|exp| exp.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        self.expires_at() <= now_unix
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn test_sign_verify_roundtrip() {
        for payload in ["", "exp=10", "user=steve;exp=1999999999;role=admin", "ünïcode=✓"] {
            let token = sign(payload, SECRET);
            assert!(!token.contains('='));
            assert_eq!(verify(&token, SECRET).as_deref(), Some(payload));
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign("exp=10", SECRET);
        assert_eq!(verify(&token, b"other-secret"), None);
    }

    #[test]
    fn test_signature_bit_flip_rejected() {
        let token = sign("user=alex;exp=1999999999", SECRET);
        let (payload, sig) = token.split_once('.').unwrap();
        let sig_bytes = URL_SAFE_NO_PAD.decode(sig).unwrap();
        for byte in 0..sig_bytes.len() {
            for bit in 0..8 {
                let mut flipped = sig_bytes.clone();
                flipped[byte] ^= 1 << bit;
                let forged = format!("{payload}.{}", URL_SAFE_NO_PAD.encode(&flipped));
                assert_eq!(verify(&forged, SECRET), None);
            }
        }
    }

    #[test]
    fn test_payload_tamper_rejected() {
        let token = sign("exp=10", SECRET);
        let (_, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{sig}", URL_SAFE_NO_PAD.encode("exp=99999999999"));
        assert_eq!(verify(&forged, SECRET), None);
    }

    #[test]
    fn test_part_count() {
        let token = sign("exp=10", SECRET);
        assert_eq!(verify("", SECRET), None);
        assert_eq!(verify("no-dot-here", SECRET), None);
        assert_eq!(verify(&format!("{token}.extra"), SECRET), None);
        assert_eq!(verify(&format!("x.{token}"), SECRET), None);
    }

    #[test]
    fn test_signature_over_encoded_payload() {
        let encoded = URL_SAFE_NO_PAD.encode("exp=10");
        let sig = mac_for(SECRET, encoded.as_bytes()).finalize().into_bytes();
        let token = format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(sig));
        assert_eq!(token, sign("exp=10", SECRET));
    }

    #[test]
    fn test_undecodable_payload_rejected() {
        let payload = "not*base64";
        let sig = mac_for(SECRET, payload.as_bytes()).finalize().into_bytes();
        let token = format!("{payload}.{}", URL_SAFE_NO_PAD.encode(sig));
        assert_eq!(verify(&token, SECRET), None);
    }

    #[test]
    fn test_claims_parse() {
        let claims = Claims::parse("user=steve;;exp=10;junk;token=a=b;");
        assert_eq!(claims.len(), 3);
        assert_eq!(claims.get("user"), Some("steve"));
        assert_eq!(claims.get("token"), Some("a=b"));
        assert_eq!(claims.get("junk"), None);
        assert_eq!(claims.expires_at(), 10);
    }

    #[test]
    fn test_claims_order_independent() {
        let a = Claims::parse("exp=10;foo=bar");
        let b = Claims::parse("foo=bar;exp=10");
        assert_eq!(a, b);
        assert_eq!(a.expires_at(), b.expires_at());
        assert_eq!(Claims::parse("exp=1;exp=20").expires_at(), 20);
    }

    #[test]
    fn test_claims_expiry() {
        assert!(Claims::parse("").is_expired_at(0));
        assert!(Claims::parse("exp=soon").is_expired_at(0));
        assert!(Claims::parse("exp=100").is_expired_at(100));
        assert!(!Claims::parse("exp=101").is_expired_at(100));
    }
}
