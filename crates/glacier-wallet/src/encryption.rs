//! AES-256-GCM encryption of wallet seed material.
//!
//! The key is 32 random bytes kept hex-encoded in a key file next to the
//! database. Each wallet record stores `nonce || ciphertext+tag` of its
//! mnemonic plus the fingerprint of the key that produced it.
//!
//! # Wire format
//! ```text
//! nonce (12 bytes) || ciphertext + auth_tag
//! ```
//!
//! The wallet's name, network and address type are bound as associated
//! data, so a ciphertext copied onto another record fails to decrypt.

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use glacier_core::types::{AddressType, Network};
use rand::RngCore;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::WalletError;

/// BLAKE3 context for key fingerprints.
const FINGERPRINT_CONTEXT: &str = "glacier-wallet seed key fingerprint v1";

const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Minimum encrypted payload size (nonce + auth tag).
const MIN_ENCRYPTED_LEN: usize = NONCE_LEN + 16;

/// How the key was obtained when the cipher was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    /// Read from an existing, valid key file.
    Loaded,
    /// No key file existed; a new one was written.
    Created,
    /// The key file was unreadable; it was moved aside and replaced.
    /// Seeds encrypted under the old key can no longer be decrypted.
    Regenerated,
}

/// Seed cipher bound to one key.
pub struct SeedCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
    fingerprint: String,
    status: KeyStatus,
}

impl SeedCipher {
    /// Use an explicit key.
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        let fingerprint = fingerprint(&key);
        Self { key: Zeroizing::new(key), fingerprint, status: KeyStatus::Loaded }
    }

    /// Open the key file at `path`, creating it if missing and replacing it
    /// if corrupt.
    pub fn load_or_create(path: &Path) -> Result<Self, WalletError> {
        match fs::read_to_string(path) {
            Ok(text) => match parse_key(&text) {
                Some(key) => Ok(Self::from_key(key)),
                None => {
                    let backup = path.with_extension("corrupt");
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        "seed key file is corrupt; regenerating, existing encrypted seeds become unreadable"
                    );
                    fs::rename(path, &backup)
                        .map_err(|e| WalletError::Encryption(format!("move aside {}: {e}", path.display())))?;
                    let mut cipher = Self::create(path)?;
                    cipher.status = KeyStatus::Regenerated;
                    Ok(cipher)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cipher = Self::create(path)?;
                info!(path = %path.display(), fingerprint = %cipher.fingerprint, "created seed key file");
                Ok(cipher)
            }
            Err(e) => Err(WalletError::Encryption(format!("read {}: {e}", path.display()))),
        }
    }

    fn create(path: &Path) -> Result<Self, WalletError> {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| WalletError::Encryption(format!("create {}: {e}", parent.display())))?;
        }
        let encoded = Zeroizing::new(hex::encode(key));
        fs::write(path, encoded.as_bytes())
            .map_err(|e| WalletError::Encryption(format!("write {}: {e}", path.display())))?;
        restrict_permissions(path)?;

        let mut cipher = Self::from_key(key);
        cipher.status = KeyStatus::Created;
        Ok(cipher)
    }

    pub fn status(&self) -> KeyStatus {
        self.status
    }

    /// Hex fingerprint of the key, stored with every ciphertext.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt `plaintext`, binding `aad`. Returns `nonce || ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, WalletError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| WalletError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
            .map_err(|e| WalletError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt).
    ///
    /// `fingerprint` is the one stored with the ciphertext; a mismatch means
    /// the key file was replaced since the seed was written.
    pub fn decrypt(
        &self,
        encrypted: &[u8],
        aad: &[u8],
        fingerprint: &str,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        if fingerprint != self.fingerprint {
            return Err(WalletError::Encryption(format!(
                "seed was encrypted under key {fingerprint}, current key is {}; \
                 restore the original key file or re-import the wallet from its mnemonic",
                self.fingerprint
            )));
        }
        if encrypted.len() < MIN_ENCRYPTED_LEN {
            return Err(WalletError::Encryption(format!(
                "encrypted seed too short: {} < {MIN_ENCRYPTED_LEN}",
                encrypted.len()
            )));
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| WalletError::Encryption(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: ciphertext, aad })
            .map(Zeroizing::new)
            .map_err(|_| WalletError::Encryption("seed authentication failed".into()))
    }
}

/// Associated data binding a seed ciphertext to its wallet record.
pub fn seed_aad(name: &str, network: Network, address_type: AddressType) -> Vec<u8> {
    format!("glacier-seed\0{name}\0{network}\0{address_type}").into_bytes()
}

fn fingerprint(key: &[u8; KEY_LEN]) -> String {
    let digest = blake3::derive_key(FINGERPRINT_CONTEXT, key);
    hex::encode(&digest[..8])
}

fn parse_key(text: &str) -> Option<[u8; KEY_LEN]> {
    let bytes = Zeroizing::new(hex::decode(text.trim()).ok()?);
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).ok()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), WalletError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| WalletError::Encryption(format!("chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), WalletError> {
    Ok(())
}
