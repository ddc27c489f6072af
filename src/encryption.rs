//! # Encryption Adapters
//!
//! Byte-to-byte ciphers applied to record payload after compression. Like
//! the compression codecs, a method is chosen by name at configuration time
//! and the name travels with the cluster configuration. Changing the method
//! on a non-empty cluster is refused upstream — stored records would become
//! undecipherable.
//!
//! Methods:
//!
//! - `nothing` — identity, the default
//! - `aes-gcm` — AES-256-GCM with a random 96-bit nonce prepended to each
//!   ciphertext; the key is configured as base64 and must decode to 32 bytes

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use eyre::{bail, ensure, eyre, Result, WrapErr};

pub const NOTHING_ENCRYPTION: &str = "nothing";
pub const AES_GCM_ENCRYPTION: &str = "aes-gcm";

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

pub trait Encryption: Send + Sync {
    fn name(&self) -> &'static str;

    fn encrypt(&self, content: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, content: &[u8]) -> Result<Vec<u8>>;
}

/// Identity transform.
pub struct NothingEncryption;

impl Encryption for NothingEncryption {
    fn name(&self) -> &'static str {
        NOTHING_ENCRYPTION
    }

    fn encrypt(&self, content: &[u8]) -> Result<Vec<u8>> {
        Ok(content.to_vec())
    }

    fn decrypt(&self, content: &[u8]) -> Result<Vec<u8>> {
        Ok(content.to_vec())
    }
}

/// AES-256-GCM with per-record random nonces.
pub struct AesGcmEncryption {
    cipher: Aes256Gcm,
}

impl AesGcmEncryption {
    pub fn new(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64)
            .wrap_err("encryption key is not valid base64")?;
        ensure!(
            key_bytes.len() == KEY_SIZE,
            "aes-gcm key must decode to {} bytes, got {}",
            KEY_SIZE,
            key_bytes.len()
        );

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }
}

impl Encryption for AesGcmEncryption {
    fn name(&self) -> &'static str {
        AES_GCM_ENCRYPTION
    }

    fn encrypt(&self, content: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, content)
            .map_err(|e| eyre!("aes-gcm encryption failed: {}", e))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, content: &[u8]) -> Result<Vec<u8>> {
        ensure!(
            content.len() >= NONCE_SIZE,
            "ciphertext too short to carry a nonce: {} bytes",
            content.len()
        );

        let nonce = Nonce::from_slice(&content[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &content[NONCE_SIZE..])
            .map_err(|e| eyre!("aes-gcm decryption failed: {}", e))
    }
}

/// Resolves an encryption method by its configured name; `key` is the
/// opaque key string from the cluster configuration.
pub fn encryption_by_name(name: &str, key: Option<&str>) -> Result<Arc<dyn Encryption>> {
    match name {
        NOTHING_ENCRYPTION => Ok(Arc::new(NothingEncryption)),
        AES_GCM_ENCRYPTION => {
            let key = key.ok_or_else(|| eyre!("encryption method '{}' requires a key", name))?;
            Ok(Arc::new(AesGcmEncryption::new(key)?))
        }
        other => bail!("unknown encryption method '{}'", other),
    }
}
