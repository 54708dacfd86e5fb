//! Processor webhook signature verification.
//!
//! The processor signs each delivery with a header of the form
//! `t=<unix seconds>,v1=<hex hmac>` where the MAC is HMAC-SHA256 over
//! `"{t}.{raw body}"`. Verification is constant-time and bounded by a
//! timestamp tolerance to blunt replay.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default replay tolerance, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    MalformedHeader,

    #[error("signature timestamp outside tolerance ({age}s old, tolerance {tolerance}s)")]
    TimestampOutOfTolerance { age: i64, tolerance: i64 },

    #[error("signature does not match payload")]
    Mismatch,
}

/// Verifies processor webhook signatures against a shared signing secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the secret through Debug output.
        f.debug_struct("SignatureVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verify `header` against the raw request body. `now` is unix seconds.
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<(), SignatureError> {
        let (timestamp, signature) = parse_header(header)?;

        let age = (now - timestamp).abs();
        if age > self.tolerance_secs {
            return Err(SignatureError::TimestampOutOfTolerance {
                age,
                tolerance: self.tolerance_secs,
            });
        }

        let expected = hex::decode(signature).map_err(|_| SignatureError::MalformedHeader)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }
}

fn parse_header(header: &str) -> Result<(i64, &str), SignatureError> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse::<i64>().ok(),
            Some(("v1", v)) => signature = Some(v),
            _ => {}
        }
    }
    match (timestamp, signature) {
        (Some(t), Some(s)) if !s.is_empty() => Ok((t, s)),
        _ => Err(SignatureError::MalformedHeader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={sig}")
    }

    #[test]
    fn valid_signature_is_accepted() {
        let verifier = SignatureVerifier::new(SECRET.as_bytes());
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, SECRET, 1_700_000_000);
        assert_eq!(verifier.verify(payload, &header, 1_700_000_000), Ok(()));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let verifier = SignatureVerifier::new(SECRET.as_bytes());
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, "wrong_secret", 1_700_000_000);
        assert_eq!(
            verifier.verify(payload, &header, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn modified_payload_is_rejected() {
        let verifier = SignatureVerifier::new(SECRET.as_bytes());
        let header = sign(b"original", SECRET, 1_700_000_000);
        assert_eq!(
            verifier.verify(b"tampered", &header, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let verifier = SignatureVerifier::new(SECRET.as_bytes());
        let payload = b"{}";
        let header = sign(payload, SECRET, 1_700_000_000);
        let result = verifier.verify(payload, &header, 1_700_000_000 + 600);
        assert!(matches!(
            result,
            Err(SignatureError::TimestampOutOfTolerance { age: 600, .. })
        ));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let verifier = SignatureVerifier::new(SECRET.as_bytes());
        for header in ["", "t=abc,v1=00", "v1=00", "t=123", "t=123,v1="] {
            assert_eq!(
                verifier.verify(b"{}", header, 123),
                Err(SignatureError::MalformedHeader),
                "accepted {header:?}"
            );
        }
    }
}
