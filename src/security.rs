//! Webhook signature verification at the HTTP boundary.
//!
//! Two schemes are in play: a timestamped HMAC header (`t=<unix>,v1=<hex>`)
//! for the calendar source, and plain shared-secret headers for the rest.
//! A source with no configured secret passes verification; that condition is
//! logged once at startup so it never goes unnoticed in production.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew for the timestamped HMAC scheme.
const TIMESTAMP_TOLERANCE_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    Ok,
    /// Verification skipped because no secret is configured.
    Skipped,
    Rejected(&'static str),
}

impl SignatureCheck {
    pub fn is_ok(&self) -> bool {
        !matches!(self, SignatureCheck::Rejected(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            SignatureCheck::Rejected(r) => r,
            _ => "",
        }
    }
}

/// Verify a `t=<unix_seconds>,v1=<hex>` signature header.
///
/// The MAC is HMAC-SHA256 over `"{t}." + raw_body` with the configured
/// signing key, compared constant-time against `v1`.
pub fn verify_timestamped_hmac(
    signing_key: &str,
    header_value: Option<&str>,
    raw_body: &[u8],
    now_unix: i64,
) -> SignatureCheck {
    if signing_key.is_empty() {
        return SignatureCheck::Skipped;
    }
    let Some(header) = header_value else {
        return SignatureCheck::Rejected("missing_signature_header");
    };

    let mut ts: Option<i64> = None;
    let mut sig: Option<&str> = None;
    for kv in header.split(',') {
        match kv.trim().split_once('=') {
            Some(("t", v)) => ts = v.parse().ok(),
            Some(("v1", v)) => sig = Some(v),
            _ => {}
        }
    }
    let (Some(ts), Some(sig)) = (ts, sig) else {
        return SignatureCheck::Rejected("invalid_signature_header_format");
    };

    if ts <= 0 || (now_unix - ts).abs() > TIMESTAMP_TOLERANCE_SECS {
        return SignatureCheck::Rejected("timestamp_out_of_tolerance");
    }

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(format!("{}.", ts).as_bytes());
    mac.update(raw_body);
    let digest = hex::encode(mac.finalize().into_bytes());

    if constant_time_eq(digest.as_bytes(), sig.as_bytes()) {
        SignatureCheck::Ok
    } else {
        SignatureCheck::Rejected("signature_mismatch")
    }
}

/// Verify a plain HMAC-SHA256 hex signature over the raw body (no timestamp).
pub fn verify_body_hmac(
    secret: &str,
    header_value: Option<&str>,
    raw_body: &[u8],
) -> SignatureCheck {
    if secret.is_empty() {
        return SignatureCheck::Skipped;
    }
    let Some(received) = header_value else {
        return SignatureCheck::Rejected("missing_signature_header");
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(raw_body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if constant_time_eq(expected.as_bytes(), received.trim().as_bytes()) {
        SignatureCheck::Ok
    } else {
        SignatureCheck::Rejected("signature_mismatch")
    }
}

/// Compare a header value against a configured shared secret.
pub fn verify_shared_secret(expected: &str, provided: Option<&str>) -> SignatureCheck {
    if expected.is_empty() {
        return SignatureCheck::Skipped;
    }
    let Some(provided) = provided else {
        return SignatureCheck::Rejected("missing_shared_secret");
    };
    if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        SignatureCheck::Ok
    } else {
        SignatureCheck::Rejected("shared_secret_mismatch")
    }
}

/// Constant-time byte comparison. Length differences short-circuit, which is
/// fine: length is not secret here.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
