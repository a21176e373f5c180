//! Bech32 and bech32m encoding for witness-program addresses.
//!
//! Witness version 0 uses the original bech32 checksum ([BIP-173]); versions
//! 1 through 16 use bech32m ([BIP-350]). The two differ only in the constant
//! XORed into the polymod result.
//!
//! [BIP-173]: https://github.com/bitcoin/bips/blob/master/bip-0173.mediawiki
//! [BIP-350]: https://github.com/bitcoin/bips/blob/master/bip-0350.mediawiki

use crate::error::AddressError;

/// Bech32 character set for encoding 5-bit values.
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Bech32 checksum constant (BIP-173).
const BECH32_CONST: u32 = 1;

/// Bech32m checksum constant (BIP-350).
const BECH32M_CONST: u32 = 0x2bc830a3;

/// Maximum total length of an encoded string.
const MAX_LENGTH: usize = 90;

/// Checksum variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    Bech32,
    Bech32m,
}

impl Variant {
    fn constant(self) -> u32 {
        match self {
            Variant::Bech32 => BECH32_CONST,
            Variant::Bech32m => BECH32M_CONST,
        }
    }

    /// The variant a given witness version must be encoded with.
    pub fn for_witness_version(version: u8) -> Self {
        if version == 0 { Variant::Bech32 } else { Variant::Bech32m }
    }
}

/// Encode a segwit address: `hrp`, witness version and witness program.
///
/// The checksum variant is chosen from the witness version.
pub fn encode(hrp: &str, witness_version: u8, program: &[u8]) -> Result<String, AddressError> {
    if witness_version > 16 {
        return Err(AddressError::InvalidVersion(witness_version));
    }
    check_program_length(witness_version, program.len())?;

    let program_5bit = convert_bits(program, 8, 5, true).ok_or(AddressError::InvalidPadding)?;
    let mut data = Vec::with_capacity(1 + program_5bit.len());
    data.push(witness_version);
    data.extend_from_slice(&program_5bit);

    encode_raw(hrp, &data, Variant::for_witness_version(witness_version))
}

/// Decode a segwit address into `(hrp, witness_version, program)`.
///
/// Rejects a witness version encoded with the wrong checksum variant.
pub fn decode(s: &str) -> Result<(String, u8, Vec<u8>), AddressError> {
    let (hrp, data, variant) = decode_raw(s)?;
    let (&version, payload) = data.split_first().ok_or(AddressError::InvalidLength)?;
    if version > 16 {
        return Err(AddressError::InvalidVersion(version));
    }
    if variant != Variant::for_witness_version(version) {
        return Err(AddressError::WrongVariant { version });
    }
    let program = convert_bits(payload, 5, 8, false).ok_or(AddressError::InvalidPadding)?;
    check_program_length(version, program.len())?;
    Ok((hrp, version, program))
}

/// Encode `hrp` and 5-bit `data` with a checksum of the given variant.
pub fn encode_raw(hrp: &str, data: &[u8], variant: Variant) -> Result<String, AddressError> {
    if hrp.is_empty() || !hrp.bytes().all(|c| (33..=126).contains(&c)) {
        return Err(AddressError::InvalidHrp);
    }
    if hrp.len() + 1 + data.len() + 6 > MAX_LENGTH {
        return Err(AddressError::InvalidLength);
    }
    let hrp = hrp.to_ascii_lowercase();
    let checksum = create_checksum(&hrp, data, variant);

    let mut result = String::with_capacity(hrp.len() + 1 + data.len() + 6);
    result.push_str(&hrp);
    result.push('1');
    for &d in data.iter().chain(checksum.iter()) {
        let c = CHARSET.get(d as usize).ok_or(AddressError::InvalidPadding)?;
        result.push(*c as char);
    }
    Ok(result)
}

/// Decode a checksummed string into `(hrp, data, variant)` where `data`
/// excludes the checksum and the variant is whichever constant verified.
pub fn decode_raw(s: &str) -> Result<(String, Vec<u8>, Variant), AddressError> {
    let has_lower = s.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = s.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(AddressError::MixedCase);
    }
    if s.len() > MAX_LENGTH {
        return Err(AddressError::InvalidLength);
    }

    let s_lower = s.to_ascii_lowercase();
    let sep_pos = s_lower.rfind('1').ok_or(AddressError::MissingSeparator)?;
    if sep_pos == 0 {
        return Err(AddressError::InvalidHrp);
    }
    if sep_pos + 7 > s_lower.len() {
        return Err(AddressError::InvalidLength);
    }

    let hrp = &s_lower[..sep_pos];
    if !hrp.bytes().all(|c| (33..=126).contains(&c)) {
        return Err(AddressError::InvalidHrp);
    }

    let mut data = Vec::with_capacity(s_lower.len() - sep_pos - 1);
    for c in s_lower[sep_pos + 1..].chars() {
        let pos = CHARSET
            .iter()
            .position(|&ch| ch as char == c)
            .ok_or(AddressError::InvalidCharacter(c))?;
        data.push(pos as u8);
    }

    let variant = verify_checksum(hrp, &data).ok_or(AddressError::InvalidChecksum)?;
    data.truncate(data.len() - 6);
    Ok((hrp.to_string(), data, variant))
}

fn check_program_length(version: u8, len: usize) -> Result<(), AddressError> {
    if !(2..=40).contains(&len) || (version == 0 && len != 20 && len != 32) {
        return Err(AddressError::InvalidProgramLength(len));
    }
    Ok(())
}

// --- checksum internals ---

/// Compute the bech32 polymod over a sequence of 5-bit values.
fn polymod(values: &[u8]) -> u32 {
    const GEN: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];
    let mut chk: u32 = 1;
    for &v in values {
        let b = chk >> 25;
        chk = ((chk & 0x1ffffff) << 5) ^ (v as u32);
        for (i, &g) in GEN.iter().enumerate() {
            if (b >> i) & 1 != 0 {
                chk ^= g;
            }
        }
    }
    chk
}

/// Expand the HRP into 5-bit groups: high bits, a zero, then low bits.
fn hrp_expand(hrp: &str) -> Vec<u8> {
    let mut ret = Vec::with_capacity(hrp.len() * 2 + 1);
    ret.extend(hrp.bytes().map(|c| c >> 5));
    ret.push(0);
    ret.extend(hrp.bytes().map(|c| c & 31));
    ret
}

fn create_checksum(hrp: &str, data: &[u8], variant: Variant) -> [u8; 6] {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0; 6]);
    let pm = polymod(&values) ^ variant.constant();
    let mut out = [0u8; 6];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ((pm >> (5 * (5 - i))) & 31) as u8;
    }
    out
}

fn verify_checksum(hrp: &str, data: &[u8]) -> Option<Variant> {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    match polymod(&values) {
        BECH32_CONST => Some(Variant::Bech32),
        BECH32M_CONST => Some(Variant::Bech32m),
        _ => None,
    }
}

/// Regroup bits between widths (8-bit bytes to 5-bit groups and back).
pub fn convert_bits(data: &[u8], from_bits: u32, to_bits: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut ret = Vec::with_capacity(data.len() * from_bits as usize / to_bits as usize + 1);
    let maxv = (1u32 << to_bits) - 1;
    for &value in data {
        let v = value as u32;
        if v >> from_bits != 0 {
            return None;
        }
        acc = (acc << from_bits) | v;
        bits += from_bits;
        while bits >= to_bits {
            bits -= to_bits;
            ret.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            ret.push(((acc << (to_bits - bits)) & maxv) as u8);
        }
    } else if bits >= from_bits || ((acc << (to_bits - bits)) & maxv) != 0 {
        return None;
    }
    Some(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    const P2WPKH_PROGRAM: &str = "751e76e8199196d454941c45d1b3a323f1433bd6";

    // --- checksum vectors ---

    #[test]
    fn bech32_vector_empty_data() {
        let (hrp, data, variant) = decode_raw("A12UEL5L").unwrap();
        assert_eq!(hrp, "a");
        assert!(data.is_empty());
        assert_eq!(variant, Variant::Bech32);
    }

    #[test]
    fn bech32m_vector_empty_data() {
        let (hrp, data, variant) = decode_raw("a1lqfn3a").unwrap();
        assert_eq!(hrp, "a");
        assert!(data.is_empty());
        assert_eq!(variant, Variant::Bech32m);
    }

    #[test]
    fn encode_raw_reproduces_vectors() {
        assert_eq!(encode_raw("a", &[], Variant::Bech32).unwrap(), "a12uel5l");
        assert_eq!(encode_raw("a", &[], Variant::Bech32m).unwrap(), "a1lqfn3a");
    }

    // --- segwit address vectors ---

    #[test]
    fn decode_bip173_p2wpkh() {
        let (hrp, version, program) = decode("BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4").unwrap();
        assert_eq!(hrp, "bc");
        assert_eq!(version, 0);
        assert_eq!(hex::encode(program), P2WPKH_PROGRAM);
    }

    #[test]
    fn encode_bip173_p2wpkh() {
        let program = hex::decode(P2WPKH_PROGRAM).unwrap();
        assert_eq!(
            encode("bc", 0, &program).unwrap(),
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
    }

    #[test]
    fn decode_bip173_testnet_p2wsh() {
        let (hrp, version, program) =
            decode("tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7").unwrap();
        assert_eq!(hrp, "tb");
        assert_eq!(version, 0);
        assert_eq!(
            hex::encode(program),
            "1863143c14c5166804bd19203356da136c985678cd4d27a1b8c6329604903262"
        );
    }

    #[test]
    fn decode_bip350_v1_40_byte_program() {
        let (hrp, version, program) = decode(
            "bc1pw508d6qejxtdg4y5r3zarvary0c5xw7kw508d6qejxtdg4y5r3zarvary0c5xw7kt5nd6y",
        )
        .unwrap();
        assert_eq!(hrp, "bc");
        assert_eq!(version, 1);
        assert_eq!(hex::encode(program), format!("{P2WPKH_PROGRAM}{P2WPKH_PROGRAM}"));
    }

    #[test]
    fn encode_bip350_taproot_generator_key() {
        let program =
            hex::decode("79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798").unwrap();
        assert_eq!(
            encode("bc", 1, &program).unwrap(),
            "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0"
        );
    }

    #[test]
    fn decode_bip350_v16() {
        let (_, version, program) = decode("BC1SW50QGDZ25J").unwrap();
        assert_eq!(version, 16);
        assert_eq!(hex::encode(program), "751e");
    }

    // --- rejection ---

    #[test]
    fn v0_with_bech32m_checksum_rejected() {
        let program = hex::decode(P2WPKH_PROGRAM).unwrap();
        let mut data = vec![0u8];
        data.extend(convert_bits(&program, 8, 5, true).unwrap());
        let wrong = encode_raw("bc", &data, Variant::Bech32m).unwrap();
        assert_eq!(decode(&wrong).unwrap_err(), AddressError::WrongVariant { version: 0 });
    }

    #[test]
    fn v1_with_bech32_checksum_rejected() {
        let program = [0x42u8; 32];
        let mut data = vec![1u8];
        data.extend(convert_bits(&program, 8, 5, true).unwrap());
        let wrong = encode_raw("bcrt", &data, Variant::Bech32).unwrap();
        assert_eq!(decode(&wrong).unwrap_err(), AddressError::WrongVariant { version: 1 });
    }

    #[test]
    fn single_character_error_detected() {
        let good = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        let mut chars: Vec<char> = good.chars().collect();
        chars[10] = if chars[10] == 'q' { 'p' } else { 'q' };
        let bad: String = chars.into_iter().collect();
        assert_eq!(decode(&bad).unwrap_err(), AddressError::InvalidChecksum);
    }

    #[test]
    fn mixed_case_rejected() {
        assert_eq!(
            decode("bc1qW508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4").unwrap_err(),
            AddressError::MixedCase
        );
    }

    #[test]
    fn missing_separator_rejected() {
        assert_eq!(decode("bcqqqqqqqq").unwrap_err(), AddressError::MissingSeparator);
    }

    #[test]
    fn invalid_character_rejected() {
        assert_eq!(decode("bc1qb508d6").unwrap_err(), AddressError::InvalidCharacter('b'));
    }

    #[test]
    fn v0_program_length_enforced() {
        assert_eq!(
            encode("bc", 0, &[0u8; 21]).unwrap_err(),
            AddressError::InvalidProgramLength(21)
        );
    }

    #[test]
    fn witness_version_above_16_rejected() {
        assert_eq!(encode("bc", 17, &[0u8; 32]).unwrap_err(), AddressError::InvalidVersion(17));
    }

    // --- convert_bits ---

    #[test]
    fn convert_bits_regroups_and_restores() {
        let bytes = [0xffu8, 0x00, 0xa5];
        let five = convert_bits(&bytes, 8, 5, true).unwrap();
        assert!(five.iter().all(|&v| v < 32));
        assert_eq!(convert_bits(&five, 5, 8, false).unwrap(), bytes);
    }

    #[test]
    fn convert_bits_rejects_out_of_range_input() {
        assert!(convert_bits(&[32], 5, 8, false).is_none());
    }
}
