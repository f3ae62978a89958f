//! NaCl box glue.
//!
//! Payloads are sealed with Curve25519-XSalsa20-Poly1305 (`crypto_box`'s
//! `SalsaBox`) in libsodium's `box_easy` layout, so ciphertext is 16 bytes
//! longer than plaintext. The nonce is always the frame header.

use std::fmt;

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{CodecError, CodecResult};
use crate::frame::Nonce;

pub use crypto_box::{PublicKey, SecretKey};

/// Size of public and secret keys.
pub const KEY_SIZE: usize = 32;

/// Authentication tag overhead added by a box.
pub const BOX_OVERHEAD: usize = 16;

/// A Curve25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self::from_secret_bytes(bytes)
    }

    /// Key pair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Key pair from a hex-encoded secret key (surrounding whitespace ignored).
    pub fn from_hex(encoded: &str) -> CodecResult<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CodecError::InvalidKey(format!("not hex: {e}")))?;
        let bytes = <[u8; KEY_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
            CodecError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Secret half.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Hex encoding of the public key.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Public key from a slice of exactly 32 bytes.
pub fn public_key_from_slice(bytes: &[u8]) -> Option<PublicKey> {
    <[u8; KEY_SIZE]>::try_from(bytes).ok().map(PublicKey::from)
}

/// Public key from 64 hex characters.
pub fn public_key_from_hex(encoded: &str) -> CodecResult<PublicKey> {
    if encoded.len() != KEY_SIZE * 2 {
        return Err(CodecError::InvalidKey(format!(
            "expected {} hex characters, got {}",
            KEY_SIZE * 2,
            encoded.len()
        )));
    }
    let bytes = hex::decode(encoded).map_err(|e| CodecError::InvalidKey(e.to_string()))?;
    public_key_from_slice(&bytes).ok_or_else(|| CodecError::InvalidKey("bad length".into()))
}

/// Seal `plaintext` for `their_pk` with `our_sk`.
pub fn encrypt_payload(
    their_pk: &PublicKey,
    our_sk: &SecretKey,
    nonce: &Nonce,
    plaintext: &[u8],
) -> CodecResult<Vec<u8>> {
    SalsaBox::new(their_pk, our_sk)
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| CodecError::CantEncryptPayload)
}

/// Open a box from `their_pk` with `our_sk`.
pub fn decrypt_payload(
    their_pk: &PublicKey,
    our_sk: &SecretKey,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> CodecResult<Vec<u8>> {
    SalsaBox::new(their_pk, our_sk)
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CodecError::CantDecryptPayload)
}

/// Prove the session key belongs to the holder of a permanent key.
///
/// Seals `server_session_pk || client_pk` with the server's permanent
/// secret key for the client, using the nonce of the `server-auth` frame.
pub fn sign_keys(
    client_pk: &PublicKey,
    server_session_pk: &PublicKey,
    server_permanent_sk: &SecretKey,
    nonce: &Nonce,
) -> CodecResult<Vec<u8>> {
    let mut keys = Vec::with_capacity(KEY_SIZE * 2);
    keys.extend_from_slice(server_session_pk.as_bytes());
    keys.extend_from_slice(client_pk.as_bytes());
    encrypt_payload(client_pk, server_permanent_sk, nonce, &keys)
}
