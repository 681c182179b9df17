//! PBKDF2/HMAC-SHA256 password challenge
//!
//! The server sends a hex random code (the PBKDF2 salt), a hex token and an
//! iteration count. The client answers with:
//!
//! ```text
//! K          = PBKDF2-HMAC-SHA256(password, hex_decode(random_code), iterations, 32)
//! client_key = HMAC-SHA256(K, "Client Key")
//! stored_key = SHA256(client_key)
//! proof      = hex(HMAC-SHA256(stored_key, hex_decode(token)) XOR client_key)
//! ```
//!
//! The server never proves knowledge of the password back to the client, so
//! this exchange authenticates the client only.

use crate::protocol::PasswordChallenge;
use crate::{Error, Result};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;

/// Compute the hex-encoded proof for a password challenge
pub fn derive_proof(password: &str, challenge: &PasswordChallenge) -> Result<String> {
    compute_proof(
        password,
        &challenge.random_code,
        &challenge.token,
        challenge.iterations,
    )
}

/// Compute the proof from its raw inputs
pub fn compute_proof(
    password: &str,
    random_code: &str,
    token: &str,
    iterations: u32,
) -> Result<String> {
    if iterations == 0 {
        return Err(Error::Authentication(
            "server sent an iteration count of zero".into(),
        ));
    }
    let salt = hex_decode(random_code, "random code")?;
    let token = hex_decode(token, "token")?;

    // K := PBKDF2(password, salt, iterations)
    let mut derived = [0u8; KEY_LEN];
    pbkdf2::<HmacSha256>(password.as_bytes(), &salt, iterations, &mut derived)
        .map_err(|_| Error::Authentication("PBKDF2 key derivation failed".into()))?;

    // ClientKey := HMAC(K, "Client Key")
    let client_key = hmac(&derived, b"Client Key")?;

    // StoredKey := SHA256(ClientKey)
    let stored_key = Sha256::digest(client_key);

    let mut proof = hmac(&stored_key, &token)?;
    for (proof_byte, key_byte) in proof.iter_mut().zip(client_key.iter()) {
        *proof_byte ^= key_byte;
    }

    Ok(hex_encode(&proof))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::Authentication("HMAC key error".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

fn hex_decode(s: &str, what: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Protocol(format!("odd-length hex {} in challenge", what)));
    }
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Protocol(format!("invalid hex {} in challenge", what)));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| Error::Protocol(format!("invalid hex {} in challenge", what)))
        })
        .collect()
}
