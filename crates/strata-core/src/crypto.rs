//! Cryptographic primitives shared across the service.
//!
//! Provides the HMAC-SHA256 helper used by request signing, a streaming
//! SHA-256 hasher for content addressing, the AES-256-GCM envelope that
//! protects access-key secrets at rest, and the random generators for
//! credentials. All randomness comes from the thread-local CSPRNG.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use rand::RngExt;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of the AES-256-GCM master key.
pub const MASTER_KEY_LEN: usize = 32;

/// Length in bytes of the AES-GCM nonce prepended to every sealed secret.
const NONCE_LEN: usize = 12;

/// Length in bytes of the AES-GCM authentication tag appended by seal.
const TAG_LEN: usize = 16;

/// Length in characters of a generated access key id.
const ACCESS_KEY_ID_LEN: usize = 20;

/// Length in characters of a generated secret access key.
const SECRET_ACCESS_KEY_LEN: usize = 40;

/// Errors produced by the secret envelope.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The master key is not exactly 32 bytes.
    #[error("master key must be {MASTER_KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The sealed value is not valid base64 or is too short to contain a
    /// nonce and tag.
    #[error("sealed secret is malformed")]
    MalformedCiphertext,

    /// Authenticated decryption failed (wrong key or tampered data).
    #[error("secret decryption failed")]
    DecryptFailed,
}

/// Compute HMAC-SHA256 and return the raw 32-byte digest.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can accept keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compute the SHA-256 hash of `data` and return it as lowercase hex.
///
/// # Examples
///
/// ```
/// use strata_core::crypto::sha256_hex;
///
/// assert_eq!(
///     sha256_hex(b""),
///     "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
/// );
/// ```
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental SHA-256 hasher for streamed content.
///
/// Wraps [`sha2::Sha256`] so blob writers can hash while copying chunks
/// without buffering the whole payload.
#[derive(Debug, Default, Clone)]
pub struct StreamingSha256 {
    inner: Sha256,
}

impl StreamingSha256 {
    /// Create a fresh hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of data into the hasher.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Consume the hasher and return the lowercase hex digest.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// AES-256-GCM envelope for secrets stored in the metadata database.
///
/// The sealed format is `base64(nonce ‖ ciphertext ‖ tag)` with a 12-byte
/// random nonce and the 16-byte tag the AEAD appends. The same master key
/// must be configured on every node that reads the store.
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}

impl SecretBox {
    /// Create a secret box from a raw 32-byte master key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the key is not 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != MASTER_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Create a secret box from a base64-encoded 32-byte master key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if decoding fails or the
    /// decoded key is not 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let key = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidKeyLength(0))?;
        Self::new(&key)
    }

    /// Encrypt `plaintext` and return the sealed base64 string.
    #[must_use]
    pub fn seal(&self, plaintext: &[u8]) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .expect("AES-GCM encryption is infallible for in-memory buffers");

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        BASE64_STANDARD.encode(sealed)
    }

    /// Decrypt a sealed base64 string back to the plaintext bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedCiphertext`] if the input cannot be
    /// decoded, or [`CryptoError::DecryptFailed`] if authentication fails.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64_STANDARD
            .decode(sealed)
            .map_err(|_| CryptoError::MalformedCiphertext)?;

        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::MalformedCiphertext);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Decrypt a sealed secret and return it as a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Same as [`SecretBox::open`], plus [`CryptoError::DecryptFailed`] if
    /// the plaintext is not valid UTF-8.
    pub fn open_string(&self, sealed: &str) -> Result<String, CryptoError> {
        let bytes = self.open(sealed)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::DecryptFailed)
    }
}

/// Generate a fresh 32-byte master key.
#[must_use]
pub fn generate_master_key() -> [u8; MASTER_KEY_LEN] {
    let mut key = [0u8; MASTER_KEY_LEN];
    rand::rng().fill(&mut key);
    key
}

/// Generate a 20-character access key id (uppercase letters and digits).
///
/// # Examples
///
/// ```
/// use strata_core::crypto::generate_access_key_id;
///
/// let id = generate_access_key_id();
/// assert_eq!(id.len(), 20);
/// assert!(id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
/// ```
#[must_use]
pub fn generate_access_key_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    random_string(ALPHABET, ACCESS_KEY_ID_LEN)
}

/// Generate a 40-character secret access key (mixed case, digits, symbols).
#[must_use]
pub fn generate_secret_access_key() -> String {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/=_-";
    random_string(ALPHABET, SECRET_ACCESS_KEY_LEN)
}

/// Generate a random password of the given length for CLI-created users.
#[must_use]
pub fn generate_password(len: usize) -> String {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
    random_string(ALPHABET, len)
}

/// Draw `len` characters uniformly from `alphabet` using the thread CSPRNG.
fn random_string(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(alphabet[rng.random_range(0..alphabet.len())]))
        .collect()
}
