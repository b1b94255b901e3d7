//! Credential encryption boundary.
//!
//! The networked engine's password is encrypted with an injected [`SecretCodec`]
//! before it is stored in [`ConnectionParams`](crate::models::ConnectionParams) and
//! decrypted only when connect options are built. Plaintext is never logged.

use crate::error::{DbError, DbResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An `encrypt`/`decrypt` capability pair.
pub trait SecretCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> DbResult<String>;
    fn decrypt(&self, ciphertext: &str) -> DbResult<String>;
}

type CodecFn = dyn Fn(&str) -> DbResult<String> + Send + Sync;

/// Adapts a pair of functions into a [`SecretCodec`].
#[derive(Clone)]
pub struct FnCodec {
    encrypt: Arc<CodecFn>,
    decrypt: Arc<CodecFn>,
}

impl FnCodec {
    pub fn new<E, D>(encrypt: E, decrypt: D) -> Self
    where
        E: Fn(&str) -> DbResult<String> + Send + Sync + 'static,
        D: Fn(&str) -> DbResult<String> + Send + Sync + 'static,
    {
        Self {
            encrypt: Arc::new(encrypt),
            decrypt: Arc::new(decrypt),
        }
    }
}

impl SecretCodec for FnCodec {
    fn encrypt(&self, plaintext: &str) -> DbResult<String> {
        (self.encrypt)(plaintext)
    }

    fn decrypt(&self, ciphertext: &str) -> DbResult<String> {
        (self.decrypt)(ciphertext)
    }
}

impl fmt::Debug for FnCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCodec")
    }
}

/// Codec keyed by random bytes generated when it is created.
///
/// This only obfuscates: it XORs the secret with the repeating key and base64
/// encodes the result. It keeps passwords out of logs and debug output for the life
/// of one process, and its output is only readable by the same instance. It is not
/// encryption. For that, wrap a real cipher or key-management service in a
/// [`FnCodec`].
pub struct EphemeralCodec {
    key: [u8; 32],
}

impl EphemeralCodec {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    fn apply(&self, bytes: &mut [u8]) {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b ^= self.key[i % self.key.len()];
        }
    }
}

impl Default for EphemeralCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretCodec for EphemeralCodec {
    fn encrypt(&self, plaintext: &str) -> DbResult<String> {
        let mut bytes = plaintext.as_bytes().to_vec();
        self.apply(&mut bytes);
        Ok(STANDARD.encode(bytes))
    }

    fn decrypt(&self, ciphertext: &str) -> DbResult<String> {
        let mut bytes = STANDARD
            .decode(ciphertext)
            .map_err(|e| DbError::secret(format!("ciphertext is not base64: {e}")))?;
        self.apply(&mut bytes);
        String::from_utf8(bytes).map_err(|_| DbError::secret("decrypted secret is not UTF-8"))
    }
}

impl fmt::Debug for EphemeralCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCodec").finish_non_exhaustive()
    }
}

/// A ciphertext produced by a [`SecretCodec`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedSecret(String);

impl EncryptedSecret {
    /// Encrypt `plaintext` with `codec`.
    pub fn seal(plaintext: &str, codec: &dyn SecretCodec) -> DbResult<Self> {
        codec.encrypt(plaintext).map(Self)
    }

    /// Wrap an already-encrypted value, e.g. one read back from configuration.
    pub fn from_ciphertext(ciphertext: impl Into<String>) -> Self {
        Self(ciphertext.into())
    }

    pub fn ciphertext(&self) -> &str {
        &self.0
    }

    pub fn reveal(&self, codec: &dyn SecretCodec) -> DbResult<String> {
        codec.decrypt(&self.0)
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptedSecret(****)")
    }
}
