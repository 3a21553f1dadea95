//! RFC 6238 time-based one-time passwords (HMAC-SHA1, 6 digits, 30 s step).
//!
//! Everything here is a pure function of the secret and a unix timestamp.
//! Lockout bookkeeping lives in [`crate::session_auth`].

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;
use subtle::ConstantTimeEq;

pub const STEP_SECS: u64 = 30;
pub const DIGITS: u32 = 6;
/// Accepted clock skew, in steps, on either side of the current step.
pub const WINDOW: u64 = 1;
/// 160 bits, the RFC 4226 recommended secret length.
pub const SECRET_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

pub fn generate_secret() -> Vec<u8> {
    let mut bytes = vec![0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn encode_secret(secret: &[u8]) -> String {
    BASE32_NOPAD.encode(secret)
}

/// Decode a base32 secret, tolerating lowercase, spaces and `=` padding.
pub fn decode_secret(encoded: &str) -> Option<Vec<u8>> {
    let cleaned: String = encoded
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    BASE32_NOPAD.decode(cleaned.as_bytes()).ok()
}

pub fn time_step(unix_secs: u64) -> u64 {
    unix_secs / STEP_SECS
}

/// RFC 4226 HOTP value for `counter`.
pub fn hotp(secret: &[u8], counter: u64) -> u32 {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return 0,
    };
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);

    binary % 10u32.pow(DIGITS)
}

pub fn format_code(value: u32) -> String {
    format!("{value:0width$}", width = DIGITS as usize)
}

/// The code a correctly synced authenticator shows at `unix_secs`.
pub fn code_at(secret: &[u8], unix_secs: u64) -> String {
    format_code(hotp(secret, time_step(unix_secs)))
}

/// Check `code` against the current step and `WINDOW` steps either side.
///
/// Returns the matching step, or `None`. Every candidate is compared in
/// constant time so the position of a match is not observable.
pub fn verify(secret: &[u8], code: &str, unix_secs: u64) -> Option<u64> {
    let code = code.trim();
    if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let current = time_step(unix_secs);
    let first = current.saturating_sub(WINDOW);
    let mut matched = None;
    for step in first..=current + WINDOW {
        let candidate = format_code(hotp(secret, step));
        if bool::from(candidate.as_bytes().ct_eq(code.as_bytes())) && matched.is_none() {
            matched = Some(step);
        }
    }
    matched
}

/// `otpauth://` URI understood by authenticator apps.
pub fn provisioning_uri(secret_b32: &str, account: &str, issuer: &str) -> String {
    let label = format!("{issuer}:{account}");
    format!(
        "otpauth://totp/{}?secret={secret_b32}&issuer={}&algorithm=SHA1&digits={DIGITS}&period={STEP_SECS}",
        urlencoding::encode(&label),
        urlencoding::encode(issuer),
    )
}
