//! Cryptographic primitives: the [`Cipher`] capability interface, the
//! AES-256-GCM implementation behind it, the HMAC [`Verifier`], and password
//! key derivation.
//!
//! Cipher calls are synchronous: they are CPU-bound and fast compared to the
//! storage round-trips that surround them.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use coffer_base::canon::Context;
use coffer_base::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// AEAD key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;
/// AEAD IV length in bytes (96-bit GCM nonce).
pub const IV_LEN: usize = 12;
/// AEAD tag length in bytes (128-bit GCM tag).
pub const TAG_LEN: usize = 16;
/// MAC key length in bytes (512-bit HMAC key).
pub const MAC_KEY_LEN: usize = 64;
/// MAC output length in bytes.
pub const MAC_LEN: usize = 32;

/// Capability interface for authenticated encryption bound to a [`Context`].
///
/// The context's [canonical encoding](Context::encode) is the AAD: a
/// ciphertext decrypts only under the exact context it was produced with.
pub trait Cipher: Send + Sync + fmt::Debug {
    /// Encrypt `plaintext` under `context`.
    fn encrypt(&self, plaintext: &[u8], context: &Context) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext` under `context`, failing `Decrypt` on any
    /// key, AAD, or integrity mismatch.
    fn decrypt(&self, ciphertext: &[u8], context: &Context) -> Result<Vec<u8>>;
}

/// AES-256-GCM cipher over a single key.
///
/// Output layout is `iv || ciphertext || tag` with a fresh random IV per
/// encryption.
pub struct AeadCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl AeadCipher {
    /// Wrap an existing key.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self::new(random_bytes())
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&*self.key).expect("32-byte key is always valid")
    }
}

impl fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AeadCipher(..)")
    }
}

impl Cipher for AeadCipher {
    fn encrypt(&self, plaintext: &[u8], context: &Context) -> Result<Vec<u8>> {
        let iv: [u8; IV_LEN] = random_bytes();
        let aad = context.encode();
        let sealed = self
            .aead()
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Corrupt("aead encryption failed".into()))?;
        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], context: &Context) -> Result<Vec<u8>> {
        if ciphertext.len() < IV_LEN + TAG_LEN {
            return Err(Error::Corrupt(format!(
                "ciphertext of {} bytes is too short",
                ciphertext.len()
            )));
        }
        let (iv, sealed) = ciphertext.split_at(IV_LEN);
        let aad = context.encode();
        self.aead()
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Decrypt("context or key mismatch".into()))
    }
}

/// HMAC-SHA-256 signer and verifier under a 512-bit key.
#[derive(Clone)]
pub struct Verifier {
    key: Zeroizing<[u8; MAC_KEY_LEN]>,
}

impl Verifier {
    /// Wrap an existing key.
    pub fn new(key: [u8; MAC_KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self::new(random_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, msg: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&*self.key).expect("any key length is valid");
        mac.update(msg);
        mac.finalize().into_bytes().into()
    }

    /// Verify a signature in constant time, failing `AuthFailed`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<()> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&*self.key).expect("any key length is valid");
        mac.update(msg);
        mac.verify_slice(signature)
            .map_err(|_| Error::AuthFailed("signature mismatch".into()))
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Verifier(..)")
    }
}

/// Derive a 256-bit key from a password with PBKDF2-HMAC-SHA-256.
///
/// The password is NFKD-normalised first so that visually identical
/// passwords typed on different platforms derive the same key.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let normalized: String = password.nfkd().collect();
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(normalized.as_bytes(), salt, iterations, &mut *key);
    key
}

/// Random bytes from the operating system CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}
