//! Wallet constants. All monetary values in satoshis (1 BTC = 10^8 sat).

pub const COIN: u64 = 100_000_000;

/// Outputs below this value are not created; change under it is folded
/// into the fee.
pub const DUST_LIMIT: u64 = 546;

/// Confirmations a coinbase output needs before it can be spent.
/// The same on every network.
pub const COINBASE_MATURITY: u32 = 100;

// --- derivation path segments ---

pub const PURPOSE_LEGACY: u32 = 44;
pub const PURPOSE_NESTED_SEGWIT: u32 = 49;
pub const PURPOSE_SEGWIT: u32 = 84;
pub const PURPOSE_TAPROOT: u32 = 86;

pub const BITCOIN_COIN_TYPE: u32 = 0;
/// Shared by testnet and regtest.
pub const TEST_COIN_TYPE: u32 = 1;

/// Highest non-hardened child index.
pub const MAX_ADDRESS_INDEX: u32 = (1 << 31) - 1;

// --- size estimation (virtual bytes) ---

/// Version, locktime, counts and segwit marker, rounded up.
pub const TX_OVERHEAD_VBYTES: u64 = 11;

/// Output value and script length prefix.
pub const OUTPUT_BASE_VBYTES: u64 = 9;
/// P2PKH output: 25-byte script.
pub const LEGACY_OUTPUT_VBYTES: u64 = OUTPUT_BASE_VBYTES + 25;
/// P2SH output: 23-byte script.
pub const NESTED_SEGWIT_OUTPUT_VBYTES: u64 = OUTPUT_BASE_VBYTES + 23;
/// P2WPKH output: 22-byte script.
pub const SEGWIT_OUTPUT_VBYTES: u64 = OUTPUT_BASE_VBYTES + 22;
/// P2TR output: 34-byte script.
pub const TAPROOT_OUTPUT_VBYTES: u64 = OUTPUT_BASE_VBYTES + 34;

/// Per-input estimate for P2PKH.
pub const LEGACY_INPUT_VBYTES: u64 = 148;
/// Per-input estimate for P2SH-P2WPKH.
pub const NESTED_SEGWIT_INPUT_VBYTES: u64 = 91;
/// Per-input estimate for P2WPKH.
pub const SEGWIT_INPUT_VBYTES: u64 = 68;
/// Per-input estimate for P2TR key-path.
pub const TAPROOT_INPUT_VBYTES: u64 = 58;

/// Fixed part of a data-carrier output: value, script length, OP_RETURN
/// and a one-byte push opcode. Memos over 75 bytes need `OP_PUSHDATA1`
/// and one more byte.
pub const DATA_CARRIER_BASE_VBYTES: u64 = 11;

/// Largest memo carried in a data-carrier output.
pub const MAX_MEMO_BYTES: usize = 80;

/// A single-input selection may overshoot the requirement by at most
/// `SINGLE_INPUT_RATIO_NUM / SINGLE_INPUT_RATIO_DEN`.
pub const SINGLE_INPUT_RATIO_NUM: u64 = 3;
pub const SINGLE_INPUT_RATIO_DEN: u64 = 2;

/// Consolidation needs at least this many inputs.
pub const MIN_CONSOLIDATION_INPUTS: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dust_limit_is_standard() {
        assert_eq!(DUST_LIMIT, 546);
    }

    #[test]
    fn taproot_outputs_are_the_largest_single_key_outputs() {
        assert_eq!(TAPROOT_OUTPUT_VBYTES, 43);
        assert!(TAPROOT_OUTPUT_VBYTES > LEGACY_OUTPUT_VBYTES);
        assert!(LEGACY_OUTPUT_VBYTES > NESTED_SEGWIT_OUTPUT_VBYTES);
        assert!(NESTED_SEGWIT_OUTPUT_VBYTES > SEGWIT_OUTPUT_VBYTES);
    }

    #[test]
    fn input_estimates_order() {
        assert!(LEGACY_INPUT_VBYTES > NESTED_SEGWIT_INPUT_VBYTES);
        assert!(NESTED_SEGWIT_INPUT_VBYTES > SEGWIT_INPUT_VBYTES);
        assert!(SEGWIT_INPUT_VBYTES > TAPROOT_INPUT_VBYTES);
    }
}
