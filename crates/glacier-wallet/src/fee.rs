//! Linear transaction size and fee estimate.
//!
//! ```text
//! vsize = overhead + inputs × input_vbytes + Σ output sizes + extra
//! fee   = fee_rate × vsize
//! ```
//!
//! Outputs are sized by their script: a P2TR or P2WSH output is 43 vbytes,
//! a P2WPKH output 31. Estimates round up so the fee never falls below
//! `fee_rate × vsize` of the signed transaction.

use bitcoin::Script;
use glacier_core::constants::{DATA_CARRIER_BASE_VBYTES, OUTPUT_BASE_VBYTES, TX_OVERHEAD_VBYTES};
use glacier_core::types::AddressType;

/// Fee parameters for one transaction shape. Only the input count varies
/// during selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeModel {
    /// sat/vB.
    pub fee_rate: u64,
    /// Per-input size for the wallet's address type.
    pub input_vbytes: u64,
    /// Sum of output sizes.
    pub output_vbytes: u64,
    /// Additional vbytes, e.g. a data-carrier output.
    pub extra_vbytes: u64,
}

impl FeeModel {
    /// `own_outputs` outputs paying back to the wallet's own address type.
    pub fn new(fee_rate: u64, address_type: AddressType, own_outputs: usize) -> Self {
        Self {
            fee_rate,
            input_vbytes: address_type.input_vbytes(),
            output_vbytes: address_type.output_vbytes().saturating_mul(own_outputs as u64),
            extra_vbytes: 0,
        }
    }

    /// Add an output paying to `script`.
    pub fn with_output(mut self, script: &Script) -> Self {
        self.output_vbytes += output_vbytes(script);
        self
    }

    /// Add a data-carrier output holding `memo_len` bytes.
    pub fn with_data_carrier(mut self, memo_len: usize) -> Self {
        self.extra_vbytes += data_carrier_vbytes(memo_len);
        self
    }

    pub fn vsize(&self, inputs: usize) -> u64 {
        TX_OVERHEAD_VBYTES
            .saturating_add(compact_size_len(inputs as u64) - 1)
            .saturating_add(self.input_vbytes.saturating_mul(inputs as u64))
            .saturating_add(self.output_vbytes)
            .saturating_add(self.extra_vbytes)
    }

    pub fn fee_for(&self, inputs: usize) -> u64 {
        self.fee_rate.saturating_mul(self.vsize(inputs))
    }
}

/// Serialized size of one output paying to `script`.
pub fn output_vbytes(script: &Script) -> u64 {
    let len = script.len() as u64;
    OUTPUT_BASE_VBYTES - 1 + compact_size_len(len) + len
}

/// Size of an `OP_RETURN <memo>` output.
pub fn data_carrier_vbytes(memo_len: usize) -> u64 {
    let pushdata1 = if memo_len > 75 { 1 } else { 0 };
    DATA_CARRIER_BASE_VBYTES + pushdata1 + memo_len as u64
}

fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
