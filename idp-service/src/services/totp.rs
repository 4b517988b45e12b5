//! RFC 6238 verification for enrolled authenticator apps.

use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};

const DIGITS: usize = 6;
/// Accept one step either side of the current window.
const SKEW: u8 = 1;
const STEP_SECONDS: u64 = 30;

fn build(secret_base32: &str) -> Result<TOTP, anyhow::Error> {
    let bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow::anyhow!("Invalid TOTP secret: {:?}", e))?;
    Ok(TOTP::new_unchecked(Algorithm::SHA1, DIGITS, SKEW, STEP_SECONDS, bytes))
}

/// A malformed secret never verifies.
pub fn verify_totp(secret_base32: &str, code: &str, at: DateTime<Utc>) -> bool {
    let code = code.trim();
    if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    match build(secret_base32) {
        Ok(totp) => totp.check(code, at.timestamp().max(0) as u64),
        Err(e) => {
            tracing::error!("Stored TOTP secret is unusable: {}", e);
            false
        }
    }
}

/// Current code for a secret; used by enrolment checks and tests.
pub fn generate_totp(secret_base32: &str, at: DateTime<Utc>) -> Result<String, anyhow::Error> {
    Ok(build(secret_base32)?.generate(at.timestamp().max(0) as u64))
}
