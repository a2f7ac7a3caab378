//! Password-envelope encryption for secret material at rest.
//!
//! An envelope is the triple `(salt, nonce, ciphertext)`: a fresh 16-byte
//! salt feeds Argon2id to derive a 256-bit key from the password, and a
//! fresh 24-byte nonce feeds XChaCha20-Poly1305 to seal the secret under
//! that key. Both are drawn from the OS RNG on every seal, so a
//! `(key, nonce)` pair can never repeat across records.
//!
//! Any AEAD failure on open (tag mismatch, truncated ciphertext, wrong
//! password) is reported as `WrongPassword` without further distinction.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::sensitive::{SensitiveBytes, SensitiveBytes32};
use crate::error::{KeyError, Result};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

// RFC 9106 second recommended parameters. Changing these breaks every
// envelope already on disk.
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 65_536;
const ARGON2_PARALLELISM: u32 = 4;

/// A sealed secret as it is persisted: cleartext salt and nonce, AEAD
/// ciphertext with the Poly1305 tag appended.
pub struct Envelope {
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Fill `buf` from the OS RNG. RNG failure is `OutOfEntropy`.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|_| KeyError::OutOfEntropy)
}

fn derive_key(password: &[u8], salt: &[u8]) -> Result<SensitiveBytes32> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(KEY_LEN),
    )
    .map_err(|e| KeyError::Internal(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| KeyError::Internal(format!("argon2: {e}")))?;
    let key = SensitiveBytes32::new(output);
    output.zeroize();
    Ok(key)
}

fn cipher_for(key: &SensitiveBytes32) -> Result<XChaCha20Poly1305> {
    XChaCha20Poly1305::new_from_slice(key.as_ref())
        .map_err(|e| KeyError::Internal(format!("aead init: {e}")))
}

/// Seal `secret` under `password` with fresh salt and nonce.
pub fn seal(secret: &[u8], password: &str) -> Result<Envelope> {
    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt)?;
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let key = derive_key(password.as_bytes(), &salt)?;
    let ciphertext = cipher_for(&key)?
        .encrypt(XNonce::from_slice(&nonce), secret)
        .map_err(|_| KeyError::Internal("aead seal failed".into()))?;

    Ok(Envelope {
        salt,
        nonce,
        ciphertext,
    })
}

/// Open an envelope with `password`, recomputing the Argon2id key from the
/// stored salt.
pub fn open(salt: &[u8], nonce: &[u8], ciphertext: &[u8], password: &str) -> Result<SensitiveBytes> {
    if nonce.len() != NONCE_LEN {
        return Err(KeyError::WrongPassword);
    }
    let key = derive_key(password.as_bytes(), salt)?;
    let plaintext = cipher_for(&key)?
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeyError::WrongPassword)?;
    Ok(SensitiveBytes::new(plaintext))
}
