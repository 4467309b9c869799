//! Session identifier and CSRF token generation
//!
//! Both values come from the OS random source and are rendered as lowercase
//! hex. Identifiers are 32 raw bytes; CSRF tokens are the SHA-256 digest of
//! 32 raw bytes.

use argon2::password_hash::rand_core::{OsRng, RngCore};
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Number of random bytes behind a session identifier
const SESSION_ID_BYTES: usize = 32;

/// Length of an identifier once hex encoded
pub const SESSION_ID_LEN: usize = SESSION_ID_BYTES * 2;

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// New session identifier, 64 lowercase hex characters
pub fn generate_session_id() -> String {
    HEXLOWER.encode(&random_bytes())
}

/// Whether a client-supplied value can be a session identifier
///
/// Anything else is never used as a store key.
pub fn is_well_formed_id(value: &str) -> bool {
    value.len() == SESSION_ID_LEN && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// New CSRF token, 64 lowercase hex characters
pub fn generate_csrf_token() -> String {
    let digest = Sha256::digest(random_bytes());
    HEXLOWER.encode(&digest)
}

/// Constant-time token comparison. An empty expected token matches nothing.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}
