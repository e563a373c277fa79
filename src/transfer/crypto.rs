//! Credential handling seam
//!
//! The request tier encrypts auth data for the worker that claimed a job;
//! only that worker holds the matching private key. Real key exchange lives
//! behind these traits. The implementations here bind ciphertexts to a key
//! id without hiding anything and exist for tests and local runs.

use uuid::Uuid;

use crate::transfer::error::{Result, TransferError};
use crate::transfer::state::WorkerKeys;

/// Encrypts auth data for a worker and decrypts it on the worker side
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, public_key: &str, plaintext: &str) -> Result<String>;

    fn decrypt(&self, private_key: &str, ciphertext: &str) -> Result<String>;
}

/// Produces the key material a worker publishes when claiming a job
pub trait KeyMaterialGenerator: Send + Sync {
    fn generate(&self) -> WorkerKeys;
}

const PUBLIC_PREFIX: &str = "pub-";
const PRIVATE_PREFIX: &str = "priv-";

/// Keys are `pub-<id>` / `priv-<id>` pairs sharing a random id
#[derive(Debug, Default)]
pub struct RandomKeyGenerator;

impl KeyMaterialGenerator for RandomKeyGenerator {
    fn generate(&self) -> WorkerKeys {
        let key_id = Uuid::new_v4().simple().to_string();
        WorkerKeys {
            session_key: Uuid::new_v4().simple().to_string(),
            public_key: format!("{}{}", PUBLIC_PREFIX, key_id),
            private_key: format!("{}{}", PRIVATE_PREFIX, key_id),
        }
    }
}

/// Leaves the plaintext readable, prefixed with the recipient key id
///
/// Decryption still refuses a private key from a different pair, so a job
/// handed to the wrong worker fails loudly.
#[derive(Debug, Default)]
pub struct PassthroughCipher;

impl PassthroughCipher {
    fn key_id<'a>(key: &'a str, prefix: &str) -> Result<&'a str> {
        key.strip_prefix(prefix)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransferError::Crypto(format!("malformed key, expected {}<id>", prefix)))
    }
}

impl CredentialCipher for PassthroughCipher {
    fn encrypt(&self, public_key: &str, plaintext: &str) -> Result<String> {
        let key_id = Self::key_id(public_key, PUBLIC_PREFIX)?;
        Ok(format!("{}.{}", key_id, plaintext))
    }

    fn decrypt(&self, private_key: &str, ciphertext: &str) -> Result<String> {
        let key_id = Self::key_id(private_key, PRIVATE_PREFIX)?;
        let (recipient, plaintext) = ciphertext
            .split_once('.')
            .ok_or_else(|| TransferError::Crypto("malformed ciphertext".to_string()))?;
        if recipient != key_id {
            return Err(TransferError::Crypto(
                "ciphertext was encrypted for a different key".to_string(),
            ));
        }
        Ok(plaintext.to_string())
    }
}
