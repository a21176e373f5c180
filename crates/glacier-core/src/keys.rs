//! Seed handling and BIP-32 key derivation.
//!
//! Paths follow `m/{purpose}'/{coin}'/0'/0/{index}`: the purpose segment is
//! chosen by address type (BIP-44/49/84/86) and the coin segment by network
//! (0 on mainnet, 1 on testnet and regtest). Only the external chain is
//! used; change goes to fresh external addresses.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::address::AddressCodec;
use crate::constants::MAX_ADDRESS_INDEX;
use crate::error::{AddressError, KeyError};
use crate::types::{AddressType, Network};

/// BIP-32 seed bytes (16 to 64 bytes, normally the 64-byte BIP-39 seed).
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: Vec<u8>,
}

impl Seed {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, KeyError> {
        if !(16..=64).contains(&bytes.len()) {
            return Err(KeyError::InvalidSeed(format!(
                "seed must be 16 to 64 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed").field("bytes", &"[REDACTED]").finish()
    }
}

/// A derived key pair and the path it came from.
pub struct DerivedKey {
    pub private_key: SecretKey,
    pub public_key: PublicKey,
    pub path: DerivationPath,
    pub index: u32,
}

impl DerivedKey {
    /// Encode this key's public half as an address.
    pub fn address(&self, network: Network, address_type: AddressType) -> Result<String, AddressError> {
        AddressCodec::encode(&self.public_key, network, address_type)
    }

    /// Compressed public key, hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .field("path", &self.path.to_string())
            .finish()
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.private_key.non_secure_erase();
    }
}

/// Deterministic path-based key derivation.
///
/// Holds only a secp256k1 context; seeds are passed per call and never
/// retained.
pub struct KeyDerivationEngine {
    secp: Secp256k1<All>,
}

impl KeyDerivationEngine {
    pub fn new() -> Self {
        Self { secp: Secp256k1::new() }
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// The derivation path for `index` under a network and address type.
    pub fn derivation_path(
        network: Network,
        address_type: AddressType,
        index: u32,
    ) -> Result<DerivationPath, KeyError> {
        if index > MAX_ADDRESS_INDEX {
            return Err(KeyError::InvalidPath(format!("index {index} is out of range")));
        }
        let path = Self::path_string(network, address_type, index);
        DerivationPath::from_str(&path).map_err(|e| KeyError::InvalidPath(format!("{path}: {e}")))
    }

    /// `m/{purpose}'/{coin}'/0'/0/{index}` as text, the form stored with
    /// each address.
    pub fn path_string(network: Network, address_type: AddressType, index: u32) -> String {
        format!("m/{}'/{}'/0'/0/{}", address_type.purpose(), network.coin_type(), index)
    }

    /// Derive the key at `index`. Pure: same inputs, same output.
    pub fn derive(
        &self,
        seed: &Seed,
        network: Network,
        address_type: AddressType,
        index: u32,
    ) -> Result<DerivedKey, KeyError> {
        let path = Self::derivation_path(network, address_type, index)?;
        self.derive_path(seed, network, &path, index)
    }

    /// Derive the key at an explicit path string, as stored alongside an
    /// address.
    pub fn derive_at(&self, seed: &Seed, network: Network, path: &str) -> Result<DerivedKey, KeyError> {
        let parsed = DerivationPath::from_str(path)
            .map_err(|e| KeyError::InvalidPath(format!("{path}: {e}")))?;
        let index = parsed
            .as_ref()
            .last()
            .map(|child| match *child {
                bitcoin::bip32::ChildNumber::Normal { index } => index,
                bitcoin::bip32::ChildNumber::Hardened { index } => index,
            })
            .ok_or_else(|| KeyError::InvalidPath(format!("{path}: empty path")))?;
        self.derive_path(seed, network, &parsed, index)
    }

    fn derive_path(
        &self,
        seed: &Seed,
        network: Network,
        path: &DerivationPath,
        index: u32,
    ) -> Result<DerivedKey, KeyError> {
        let master = Xpriv::new_master(network.to_bitcoin(), seed.as_bytes())
            .map_err(|e| KeyError::InvalidSeed(e.to_string()))?;
        let child = master
            .derive_priv(&self.secp, path)
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        let private_key = child.private_key;
        let public_key = PublicKey::from_secret_key(&self.secp, &private_key);
        Ok(DerivedKey { private_key, public_key, path: path.clone(), index })
    }

    /// Search indices `0..limit` for the key that encodes to `address`.
    pub fn find_key_for_address(
        &self,
        seed: &Seed,
        network: Network,
        address_type: AddressType,
        address: &str,
        limit: u32,
    ) -> Result<Option<DerivedKey>, KeyError> {
        for index in 0..limit {
            let key = self.derive(seed, network, address_type, index)?;
            if key.address(network, address_type).ok().as_deref() == Some(address) {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}

impl Default for KeyDerivationEngine {
    fn default() -> Self {
        Self::new()
    }
}
