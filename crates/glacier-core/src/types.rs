//! Shared domain types: networks, address types, UTXOs, wallet and
//! transaction records.
//!
//! All monetary values are in satoshis. Timestamps are unix seconds.

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{
    BITCOIN_COIN_TYPE, COINBASE_MATURITY, LEGACY_INPUT_VBYTES, LEGACY_OUTPUT_VBYTES,
    NESTED_SEGWIT_INPUT_VBYTES, NESTED_SEGWIT_OUTPUT_VBYTES, PURPOSE_LEGACY, PURPOSE_NESTED_SEGWIT,
    PURPOSE_SEGWIT, PURPOSE_TAPROOT, SEGWIT_INPUT_VBYTES, SEGWIT_OUTPUT_VBYTES, TAPROOT_INPUT_VBYTES,
    TAPROOT_OUTPUT_VBYTES, TEST_COIN_TYPE,
};
use crate::error::{AddressError, ChainError};

/// Bitcoin network a wallet lives on.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub const ALL: [Network; 3] = [Network::Mainnet, Network::Testnet, Network::Regtest];

    /// Human-readable prefix for bech32-family addresses.
    pub fn hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet => "tb",
            Network::Regtest => "bcrt",
        }
    }

    /// Look up a network from a bech32 human-readable prefix.
    pub fn from_hrp(hrp: &str) -> Result<Self, AddressError> {
        match hrp {
            "bc" => Ok(Network::Mainnet),
            "tb" => Ok(Network::Testnet),
            "bcrt" => Ok(Network::Regtest),
            _ => Err(AddressError::UnknownNetwork(hrp.to_string())),
        }
    }

    /// BIP-44 coin-type segment. Testnet and regtest share one value.
    pub fn coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => BITCOIN_COIN_TYPE,
            Network::Testnet | Network::Regtest => TEST_COIN_TYPE,
        }
    }

    /// Base58 version byte for P2PKH addresses.
    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6f,
        }
    }

    /// Base58 version byte for P2SH addresses.
    pub fn p2sh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet | Network::Regtest => 0xc4,
        }
    }

    /// The network a base58 address reports. Regtest shares testnet's
    /// version bytes, so base58 strings cannot tell the two apart.
    pub fn base58_family(&self) -> Network {
        match self {
            Network::Mainnet => Network::Mainnet,
            Network::Testnet | Network::Regtest => Network::Testnet,
        }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(AddressError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Output script family a wallet derives addresses for.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "kebab-case")]
pub enum AddressType {
    /// P2PKH, base58check.
    Legacy,
    /// P2WPKH, bech32 witness v0.
    Segwit,
    /// P2SH-wrapped P2WPKH, base58check.
    NestedSegwit,
    /// P2TR key-path, bech32m witness v1.
    Taproot,
}

impl AddressType {
    pub const ALL: [AddressType; 4] = [
        AddressType::Legacy,
        AddressType::Segwit,
        AddressType::NestedSegwit,
        AddressType::Taproot,
    ];

    /// BIP-44/49/84/86 purpose segment.
    pub fn purpose(&self) -> u32 {
        match self {
            AddressType::Legacy => PURPOSE_LEGACY,
            AddressType::NestedSegwit => PURPOSE_NESTED_SEGWIT,
            AddressType::Segwit => PURPOSE_SEGWIT,
            AddressType::Taproot => PURPOSE_TAPROOT,
        }
    }

    /// Estimated virtual size of one input spending this output type.
    pub fn input_vbytes(&self) -> u64 {
        match self {
            AddressType::Legacy => LEGACY_INPUT_VBYTES,
            AddressType::NestedSegwit => NESTED_SEGWIT_INPUT_VBYTES,
            AddressType::Segwit => SEGWIT_INPUT_VBYTES,
            AddressType::Taproot => TAPROOT_INPUT_VBYTES,
        }
    }

    /// Size of one output paying to this address type.
    pub fn output_vbytes(&self) -> u64 {
        match self {
            AddressType::Legacy => LEGACY_OUTPUT_VBYTES,
            AddressType::NestedSegwit => NESTED_SEGWIT_OUTPUT_VBYTES,
            AddressType::Segwit => SEGWIT_OUTPUT_VBYTES,
            AddressType::Taproot => TAPROOT_OUTPUT_VBYTES,
        }
    }

    /// Whether addresses of this type are base58check rather than bech32.
    pub fn is_base58(&self) -> bool {
        matches!(self, AddressType::Legacy | AddressType::NestedSegwit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::Legacy => "legacy",
            AddressType::Segwit => "segwit",
            AddressType::NestedSegwit => "nested-segwit",
            AddressType::Taproot => "taproot",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressType {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "p2pkh" => Ok(AddressType::Legacy),
            "segwit" | "p2wpkh" | "native-segwit" => Ok(AddressType::Segwit),
            "nested-segwit" | "nested_segwit" | "p2sh-segwit" => Ok(AddressType::NestedSegwit),
            "taproot" | "p2tr" => Ok(AddressType::Taproot),
            other => Err(AddressError::UnknownAddressType(other.to_string())),
        }
    }
}

/// A transaction id, stored in the byte order it is displayed in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({self})")
    }
}

impl FromStr for Txid {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ChainError::InvalidResponse(format!("txid {s}: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::InvalidResponse(format!("txid {s}: expected 32 bytes")))?;
        Ok(Txid(arr))
    }
}

impl From<bitcoin::Txid> for Txid {
    fn from(txid: bitcoin::Txid) -> Self {
        let mut bytes = txid.to_byte_array();
        bytes.reverse();
        Txid(bytes)
    }
}

impl From<Txid> for bitcoin::Txid {
    fn from(txid: Txid) -> Self {
        let mut bytes = txid.0;
        bytes.reverse();
        bitcoin::Txid::from_byte_array(bytes)
    }
}

impl Serialize for Txid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to a specific output of a transaction.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Lifecycle state of a tracked output.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum UtxoState {
    Unspent,
    /// Reserved by a caller; not a selection candidate.
    Locked,
    /// Pinned out of the spendable pool with a memo.
    Frozen,
    Spent,
}

impl fmt::Display for UtxoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UtxoState::Unspent => "UNSPENT",
            UtxoState::Locked => "LOCKED",
            UtxoState::Frozen => "FROZEN",
            UtxoState::Spent => "SPENT",
        })
    }
}

/// A wallet-owned output tracked by the UTXO store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub address: String,
    pub wallet: String,
    pub state: UtxoState,
    pub memo: Option<String>,
    pub confirmations: u32,
    pub coinbase: bool,
    /// Owner tag while LOCKED.
    pub locked_by: Option<String>,
    /// Spending transaction once SPENT.
    pub spent_by: Option<Txid>,
    pub updated_at: i64,
}

impl Utxo {
    /// A freshly discovered, unspent output.
    pub fn discovered(wallet: &str, output: &ScannedOutput) -> Self {
        Self {
            outpoint: output.outpoint,
            amount: output.amount,
            address: output.address.clone(),
            wallet: wallet.to_string(),
            state: UtxoState::Unspent,
            memo: None,
            confirmations: output.confirmations,
            coinbase: output.coinbase,
            locked_by: None,
            spent_by: None,
            updated_at: now_secs(),
        }
    }

    /// Coinbase outputs need [`COINBASE_MATURITY`] confirmations on every network.
    pub fn is_mature(&self) -> bool {
        !self.coinbase || self.confirmations >= COINBASE_MATURITY
    }

    /// Eligible for automatic coin selection.
    pub fn is_spendable(&self) -> bool {
        self.state == UtxoState::Unspent && self.is_mature()
    }

    pub fn is_frozen(&self) -> bool {
        self.state == UtxoState::Frozen
    }
}

/// One derived address and where it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AddressRecord {
    pub address: String,
    pub wallet: String,
    pub index: u32,
    pub path: String,
    /// Compressed SEC1 public key, hex.
    pub public_key: String,
}

/// Persisted wallet record, one per name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WalletRecord {
    pub name: String,
    pub network: Network,
    pub address_type: AddressType,
    /// `nonce || ciphertext` of the mnemonic.
    pub encrypted_seed: Vec<u8>,
    /// Fingerprint of the key that produced `encrypted_seed`.
    pub key_fingerprint: String,
    pub addresses: Vec<String>,
    /// Next derivation index. Never decremented.
    pub next_index: u32,
    pub created_at: i64,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Send,
    Freeze,
    Consolidation,
}

/// Record of a broadcast transaction. Only `status` changes after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TransactionRecord {
    pub txid: Txid,
    pub wallet: String,
    pub kind: TransactionKind,
    pub timestamp: i64,
    pub amount: u64,
    pub fee: u64,
    pub memo: Option<String>,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub change_address: Option<String>,
    pub status: TxStatus,
}

/// One entry of a UTXO's state history. `to == None` records removal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UtxoTransition {
    pub outpoint: OutPoint,
    pub wallet: String,
    pub from: Option<UtxoState>,
    pub to: Option<UtxoState>,
    pub reason: String,
    pub at: i64,
}

/// An unspent output reported by a chain scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedOutput {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub address: String,
    pub confirmations: u32,
    pub coinbase: bool,
}

/// One output of a fetched transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputInfo {
    pub vout: u32,
    pub amount: u64,
    pub address: Option<String>,
}

/// Confirmation depth and outputs of a fetched transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransactionInfo {
    pub txid: Txid,
    pub confirmations: u32,
    pub outputs: Vec<TxOutputInfo>,
}

impl RawTransactionInfo {
    /// Parse the verbose transaction object shared by bitcoind's
    /// `getrawtransaction` and Electrum's verbose `blockchain.transaction.get`.
    pub fn from_verbose_json(value: &serde_json::Value) -> Result<Self, ChainError> {
        let txid = value
            .get("txid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChainError::InvalidResponse("transaction without txid".into()))?
            .parse::<Txid>()?;
        let confirmations = value
            .get("confirmations")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        let vouts = value
            .get("vout")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ChainError::InvalidResponse(format!("transaction {txid} without vout")))?;

        let mut outputs = Vec::with_capacity(vouts.len());
        for out in vouts {
            let vout = out
                .get("n")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| ChainError::InvalidResponse("output without index".into()))?;
            let btc = out
                .get("value")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| ChainError::InvalidResponse("output without value".into()))?;
            let spk = out.get("scriptPubKey");
            let address = spk
                .and_then(|s| s.get("address"))
                .and_then(|a| a.as_str())
                .or_else(|| {
                    spk.and_then(|s| s.get("addresses"))
                        .and_then(|a| a.as_array())
                        .and_then(|a| a.first())
                        .and_then(|a| a.as_str())
                })
                .map(str::to_string);
            outputs.push(TxOutputInfo { vout: vout as u32, amount: btc_to_sats(btc)?, address });
        }

        Ok(Self { txid, confirmations, outputs })
    }

    /// Index of the first output paying `amount` to `address`.
    pub fn find_output(&self, address: &str, amount: u64) -> Option<u32> {
        self.outputs
            .iter()
            .find(|o| o.amount == amount && o.address.as_deref() == Some(address))
            .map(|o| o.vout)
    }
}

/// Convert a BTC-denominated float from an RPC reply into satoshis.
pub fn btc_to_sats(btc: f64) -> Result<u64, ChainError> {
    bitcoin::Amount::from_btc(btc)
        .map(|a| a.to_sat())
        .map_err(|e| ChainError::InvalidResponse(format!("amount {btc}: {e}")))
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
