//! Address encoding and classification.
//!
//! [`AddressCodec::encode`] turns a compressed secp256k1 public key into an
//! address string for a (network, address type) pair:
//!
//! | type          | script          | encoding             |
//! |---------------|-----------------|----------------------|
//! | legacy        | P2PKH           | base58check          |
//! | segwit        | P2WPKH          | bech32, witness v0   |
//! | nested-segwit | P2SH(P2WPKH)    | base58check          |
//! | taproot       | P2TR key-path   | bech32m, witness v1  |
//!
//! [`AddressCodec::classify`] goes the other way using prefixes only.

use bitcoin::hashes::{hash160, Hash};
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{PublicKey, Secp256k1};

use crate::bech32;
use crate::error::AddressError;
use crate::types::{AddressType, Network};

/// Stateless encoder/classifier for wallet addresses.
pub struct AddressCodec;

impl AddressCodec {
    /// Encode `public_key` as an address of `address_type` on `network`.
    pub fn encode(
        public_key: &PublicKey,
        network: Network,
        address_type: AddressType,
    ) -> Result<String, AddressError> {
        let key_hash = hash160::Hash::hash(&public_key.serialize()).to_byte_array();
        match address_type {
            AddressType::Legacy => Ok(base58check(network.p2pkh_version(), &key_hash)),
            AddressType::Segwit => bech32::encode(network.hrp(), 0, &key_hash),
            AddressType::NestedSegwit => {
                let redeem = p2wpkh_redeem_script(&key_hash);
                let script_hash = hash160::Hash::hash(&redeem).to_byte_array();
                Ok(base58check(network.p2sh_version(), &script_hash))
            }
            AddressType::Taproot => {
                bech32::encode(network.hrp(), 1, &taproot_output_key(public_key))
            }
        }
    }

    /// Classify an address string by prefix.
    ///
    /// Bech32-family addresses are identified by their human-readable
    /// prefix and the version character after the separator (`q` for
    /// witness v0, `p` for v1). Base58 addresses are identified by their
    /// leading character; testnet and regtest share those, so both report
    /// [`Network::Testnet`].
    pub fn classify(address: &str) -> Result<(Network, AddressType), AddressError> {
        let lower = address.to_ascii_lowercase();

        for network in [Network::Regtest, Network::Mainnet, Network::Testnet] {
            let prefix = format!("{}1", network.hrp());
            if let Some(rest) = lower.strip_prefix(&prefix) {
                return match rest.chars().next() {
                    Some('q') => Ok((network, AddressType::Segwit)),
                    Some('p') => Ok((network, AddressType::Taproot)),
                    Some(c) => Err(AddressError::InvalidCharacter(c)),
                    None => Err(AddressError::InvalidLength),
                };
            }
        }

        match address.chars().next() {
            Some('1') => Ok((Network::Mainnet, AddressType::Legacy)),
            Some('3') => Ok((Network::Mainnet, AddressType::NestedSegwit)),
            Some('m') | Some('n') => Ok((Network::Testnet, AddressType::Legacy)),
            Some('2') => Ok((Network::Testnet, AddressType::NestedSegwit)),
            _ => Err(AddressError::Unrecognized(address.to_string())),
        }
    }

    /// The network `classify` reports for addresses encoded on `network`
    /// with `address_type`.
    pub fn classified_network(network: Network, address_type: AddressType) -> Network {
        if address_type.is_base58() { network.base58_family() } else { network }
    }
}

/// `OP_0 <20-byte key hash>`, the script a nested-segwit P2SH commits to.
pub fn p2wpkh_redeem_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.push(0x00);
    script.push(0x14);
    script.extend_from_slice(key_hash);
    script
}

/// BIP-86 output key: the x-only internal key tweaked with no script tree.
fn taproot_output_key(public_key: &PublicKey) -> [u8; 32] {
    let secp = Secp256k1::verification_only();
    let (internal, _parity) = public_key.x_only_public_key();
    let (tweaked, _parity) = internal.tap_tweak(&secp, None);
    tweaked.to_inner().serialize()
}

fn base58check(version: u8, payload: &[u8; 20]) -> String {
    let mut data = Vec::with_capacity(21);
    data.push(version);
    data.extend_from_slice(payload);
    bs58::encode(data).with_check().into_string()
}
