//! Credential vault: symmetric encryption of the third-party API key under the
//! process secret.
//!
//! Ciphertexts look like `v1:<base64(nonce || aes-256-gcm ciphertext)>` and are
//! stored next to the fingerprint of the secret that produced them, so a
//! rotated or ephemeral secret is detected before any decryption attempt.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;

use crate::db::models::StoredCredential;
use crate::db::Database;
use crate::error::VaultError;

/// Name under which the pick-generation API key is stored.
pub const PICKS_API_KEY: &str = "openai_api_key";

const FORMAT_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Configured,
    /// Generated at startup; lost on restart unless the operator persists it.
    Ephemeral,
}

/// The process-wide secret, resolved once at startup.
#[derive(Clone)]
pub struct ProcessSecret {
    value: String,
    source: SecretSource,
}

impl ProcessSecret {
    pub fn source(&self) -> SecretSource {
        self.source
    }

    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for ProcessSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSecret")
            .field("source", &self.source)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Use the configured secret, or generate an ephemeral one and tell the
/// operator about it.
///
/// Credentials sealed under an ephemeral secret cannot be opened after a
/// restart unless the printed value is exported as `APP_SECRET`.
pub fn resolve_secret(configured: Option<&str>) -> ProcessSecret {
    if let Some(value) = configured.map(str::trim).filter(|v| !v.is_empty()) {
        return ProcessSecret {
            value: value.to_string(),
            source: SecretSource::Configured,
        };
    }

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let value = STANDARD.encode(bytes);

    warn!("APP_SECRET not set: generated an ephemeral secret; stored credentials will not survive a restart");
    // Printed to stderr only, never through the log pipeline (which the
    // diagnostics API can read back).
    eprintln!("Generated APP_SECRET (export it to keep credentials readable): {}", value);

    ProcessSecret {
        value,
        source: SecretSource::Ephemeral,
    }
}

pub struct CredentialVault {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl CredentialVault {
    pub fn new(secret: &ProcessSecret) -> Self {
        Self::from_secret_str(secret.expose())
    }

    fn from_secret_str(secret: &str) -> Self {
        let key_bytes = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        let mut hasher = Sha256::new();
        hasher.update(b"bet-autopicks/fingerprint/");
        hasher.update(secret.as_bytes());
        let fingerprint = hasher
            .finalize()
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect::<String>();

        CredentialVault {
            cipher,
            fingerprint,
        }
    }

    /// Fingerprint of the current secret; safe to store and log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| anyhow!("credential encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        Ok(format!("{}{}", FORMAT_PREFIX, STANDARD.encode(blob)))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let encoded = ciphertext
            .strip_prefix(FORMAT_PREFIX)
            .ok_or(VaultError::InvalidCredential)?;
        let blob = STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::InvalidCredential)?;
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::InvalidCredential);
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::InvalidCredential)?;
        String::from_utf8(plain).map_err(|_| VaultError::InvalidCredential)
    }

    /// Decrypt a stored credential, rejecting it early when it was sealed
    /// under a different secret.
    pub fn open(&self, stored: &StoredCredential) -> Result<String, VaultError> {
        if stored.secret_fingerprint != self.fingerprint {
            return Err(VaultError::InvalidCredential);
        }
        self.decrypt(&stored.ciphertext)
    }

    /// Encrypt `plaintext` and persist it under `name`.
    pub fn seal_into(&self, db: &Database, name: &str, plaintext: &str) -> Result<()> {
        let ciphertext = self.encrypt(plaintext)?;
        db.store_credential(name, &ciphertext, &self.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(secret: &str) -> CredentialVault {
        CredentialVault::new(&resolve_secret(Some(secret)))
    }

    #[test]
    fn test_round_trip_under_fixed_secret() {
        let v = vault("correct horse battery staple");
        let long = "x".repeat(512);
        for plain in ["sk-test-123", "", "ünïcödé key with spaces", long.as_str()] {
            let sealed = v.encrypt(plain).unwrap();
            assert!(sealed.starts_with("v1:"));
            assert_eq!(v.decrypt(&sealed).unwrap(), plain);
        }
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let v = vault("s3cret");
        assert_ne!(v.encrypt("same").unwrap(), v.encrypt("same").unwrap());
    }

    #[test]
    fn test_other_secret_cannot_decrypt() {
        let sealed = vault("first").encrypt("sk-live").unwrap();
        assert_eq!(
            vault("second").decrypt(&sealed),
            Err(VaultError::InvalidCredential)
        );
    }

    #[test]
    fn test_garbage_ciphertext_is_invalid() {
        let v = vault("s3cret");
        assert_eq!(v.decrypt("plaintext-key"), Err(VaultError::InvalidCredential));
        assert_eq!(v.decrypt("v1:%%%"), Err(VaultError::InvalidCredential));
        assert_eq!(v.decrypt("v1:AAAA"), Err(VaultError::InvalidCredential));
    }

    #[test]
    fn test_open_checks_fingerprint() {
        let db = Database::open_in_memory().unwrap();
        let first = vault("first");
        first.seal_into(&db, PICKS_API_KEY, "sk-live").unwrap();
        let stored = db.get_credential(PICKS_API_KEY).unwrap().unwrap();

        assert_eq!(first.open(&stored).unwrap(), "sk-live");
        assert_eq!(vault("second").open(&stored), Err(VaultError::InvalidCredential));
        assert_eq!(stored.secret_fingerprint, first.fingerprint());
        assert_eq!(first.fingerprint().len(), 16);
    }

    #[test]
    fn test_resolve_secret_prefers_configured() {
        let configured = resolve_secret(Some("  abc  "));
        assert_eq!(configured.source(), SecretSource::Configured);
        assert_eq!(configured.expose(), "abc");

        let ephemeral = resolve_secret(Some("   "));
        assert_eq!(ephemeral.source(), SecretSource::Ephemeral);
        assert!(!ephemeral.expose().is_empty());
        assert!(!format!("{:?}", ephemeral).contains(ephemeral.expose()));
    }
}
