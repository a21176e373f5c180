//! BIP-39 mnemonic generation, parsing and seed extraction.

use bip39::{Language, Mnemonic};
use glacier_core::keys::Seed;

use crate::error::WalletError;

/// Words in a freshly generated mnemonic.
pub const MNEMONIC_WORDS: usize = 24;

/// Generate a new random 24-word English mnemonic.
pub fn generate() -> Result<Mnemonic, WalletError> {
    Mnemonic::generate_in(Language::English, MNEMONIC_WORDS)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic phrase of any standard length.
///
/// Normalizes whitespace and converts to lowercase before parsing.
pub fn parse(phrase: &str) -> Result<Mnemonic, WalletError> {
    let normalized = phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    Mnemonic::parse_in(Language::English, &normalized)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// The 64-byte BIP-39 seed with an empty passphrase.
pub fn to_seed(mnemonic: &Mnemonic) -> Result<Seed, WalletError> {
    Ok(Seed::from_bytes(mnemonic.to_seed("").to_vec())?)
}
