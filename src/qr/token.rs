//! Short-lived signed QR tokens.
//!
//! A token binds a customer (the subject) to the millisecond it was issued.
//! It is valid for one window after issuance and only if its signature
//! recomputes identically. Tokens are generated on the presenting device
//! without a server round trip and are never persisted.
//!
//! ## Signing
//! - [`Signer::Legacy`]: `base64(subject + "-" + issued_ms)` truncated to 16
//!   characters. No secret. This is the scheme deployed clients produce.
//! - [`Signer::Keyed`]: HMAC-SHA256 over the same message, hex-encoded and
//!   truncated to 16 characters.
//!
//! The legacy encoding is reversible and, for subjects longer than about ten
//! characters, the truncated prefix never reaches the timestamp. Freshness
//! then rests on `issuedAtMs` alone and every token of a subject shares one
//! signature. Configure a signing secret to get the keyed scheme.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

/// Validity window of a token (60 seconds).
pub const WINDOW_MS: i64 = 60_000;

/// Signatures are truncated to this many characters.
pub const SIGNATURE_LEN: usize = 16;

// ── Token ────────────────────────────────────────────────────────

/// The three fields carried through the scan medium as a flat JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrToken {
    /// Customer identity the token refers to.
    #[serde(alias = "userId")]
    pub subject_id: String,
    /// Issuance time, Unix epoch milliseconds.
    #[serde(alias = "timestamp")]
    pub issued_at_ms: i64,
    pub signature: String,
}

impl QrToken {
    /// Encode for rendering into a QR image.
    pub fn to_payload(&self) -> String {
        // Plain struct of strings and integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Why a token failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenRejection {
    #[error("token expired {age_ms}ms after issuance")]
    Expired { age_ms: i64 },
    #[error("token signature does not match")]
    InvalidSignature,
}

// ── Signer ───────────────────────────────────────────────────────

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Default)]
pub enum Signer {
    #[default]
    Legacy,
    Keyed(Vec<u8>),
}

impl Signer {
    /// Keyed when a secret is configured, legacy otherwise.
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => Self::Keyed(s.as_bytes().to_vec()),
            _ => Self::Legacy,
        }
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, Self::Keyed(_))
    }

    pub fn sign(&self, subject_id: &str, issued_at_ms: i64) -> String {
        let message = format!("{subject_id}-{issued_at_ms}");
        let mut encoded = match self {
            Self::Legacy => base64::engine::general_purpose::STANDARD.encode(message.as_bytes()),
            Self::Keyed(key) => {
                let mut mac =
                    HmacSha256::new_from_slice(key).expect("HMAC can accept any key length");
                mac.update(message.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
        };
        // Both encodings are ASCII, so truncating by byte count is safe.
        encoded.truncate(SIGNATURE_LEN);
        encoded
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => f.write_str("Signer::Legacy"),
            Self::Keyed(_) => f.write_str("Signer::Keyed(..)"),
        }
    }
}

// ── Protocol ─────────────────────────────────────────────────────

/// Generation and validation under one signer and window.
#[derive(Debug, Clone)]
pub struct QrProtocol {
    signer: Signer,
    window_ms: i64,
}

impl Default for QrProtocol {
    fn default() -> Self {
        Self {
            signer: Signer::Legacy,
            window_ms: WINDOW_MS,
        }
    }
}

impl QrProtocol {
    pub fn new(signer: Signer, window: Duration) -> Self {
        Self {
            signer,
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn generate(&self, subject_id: &str, now_ms: i64) -> QrToken {
        QrToken {
            subject_id: subject_id.to_string(),
            issued_at_ms: now_ms,
            signature: self.signer.sign(subject_id, now_ms),
        }
    }

    /// Pure predicate: fresh and correctly signed.
    pub fn validate(
        &self,
        subject_id: &str,
        issued_at_ms: i64,
        signature: &str,
        now_ms: i64,
    ) -> bool {
        self.check(subject_id, issued_at_ms, signature, now_ms).is_ok()
    }

    /// Same as [`Self::validate`] but reports the reason on failure.
    pub fn check(
        &self,
        subject_id: &str,
        issued_at_ms: i64,
        signature: &str,
        now_ms: i64,
    ) -> Result<(), TokenRejection> {
        let age_ms = now_ms.saturating_sub(issued_at_ms);
        if age_ms > self.window_ms {
            return Err(TokenRejection::Expired { age_ms });
        }

        let expected = self.generate(subject_id, issued_at_ms).signature;
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(TokenRejection::InvalidSignature);
        }
        Ok(())
    }

    pub fn check_token(&self, token: &QrToken, now_ms: i64) -> Result<(), TokenRejection> {
        self.check(&token.subject_id, token.issued_at_ms, &token.signature, now_ms)
    }
}

/// Generate with the default (legacy, 60 s) protocol.
pub fn generate(subject_id: &str, now_ms: i64) -> QrToken {
    QrProtocol::default().generate(subject_id, now_ms)
}

/// Validate with the default (legacy, 60 s) protocol.
pub fn validate(subject_id: &str, issued_at_ms: i64, signature: &str, now_ms: i64) -> bool {
    QrProtocol::default().validate(subject_id, issued_at_ms, signature, now_ms)
}

/// Whole seconds left in the window after `elapsed_ms`, floored, never negative.
pub fn countdown_secs(elapsed_ms: i64, window_ms: i64) -> u64 {
    let remaining = window_ms.saturating_sub(elapsed_ms).max(0);
    u64::try_from(remaining / 1_000).unwrap_or(0)
}

/// Constant-time byte comparison to prevent timing attacks.
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

// ── Tests ────────────────────────────────────────────────────────
