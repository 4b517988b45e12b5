use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, Rng, RngCore};

/// URL-safe random token carrying `bytes` bytes of entropy.
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Zero-padded decimal code, e.g. a 6-digit OTP.
pub fn numeric_code(digits: u32) -> String {
    let upper = 10u32.pow(digits);
    format!("{:0width$}", OsRng.gen_range(0..upper), width = digits as usize)
}
