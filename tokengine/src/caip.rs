//! # CAIP Identifier Model
//!
//! Chain-agnostic identifiers glue the ledger and the adapters together.
//! Three formats matter here:
//!
//! - **CAIP-2** chain IDs: `namespace:reference`, e.g. `eip155:11155111`.
//! - **CAIP-10** account IDs: a chain ID prefix plus a chain-native
//!   address. Adapters accept the prefixed or bare form and normalize.
//! - **CAIP-19** asset IDs: an asset namespace plus reference, e.g.
//!   `erc20:0x1c7d…`, `cad29:72`, `fa2:KT1…`, or the native-coin
//!   sentinel `slip44:<n>`.
//!
//! Everything in this module is an immutable, canonical string wrapper.
//! Canonicalization (lowercasing, prefix stripping, checksum validation)
//! happens exactly once, at parse time; after that the types compare and
//! hash as plain strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// ChainId (CAIP-2)
// ---------------------------------------------------------------------------

/// A validated CAIP-2 chain identifier: `namespace:reference`.
///
/// The namespace selects the adapter family (`eip155`, `convex`,
/// `tezos`); the reference selects the concrete network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    /// Parses a CAIP-2 chain ID.
    ///
    /// Requires exactly one `namespace:reference` split with both parts
    /// non-empty. The reference must not itself contain a colon.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Format`] on missing or empty parts.
    pub fn parse(s: &str) -> EngineResult<Self> {
        let s = s.trim();
        let mut parts = s.splitn(2, ':');
        let namespace = parts.next().unwrap_or("");
        let reference = parts.next().unwrap_or("");
        if namespace.is_empty() || reference.is_empty() {
            return Err(EngineError::Format(format!(
                "chain ID must be namespace:reference, got {s:?}"
            )));
        }
        if reference.contains(':') {
            return Err(EngineError::Format(format!(
                "chain ID reference must not contain ':', got {s:?}"
            )));
        }
        Ok(ChainId(s.to_string()))
    }

    /// The namespace part, e.g. `eip155`.
    pub fn namespace(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The reference part, e.g. `11155111`.
    pub fn reference(&self) -> &str {
        self.0.splitn(2, ':').nth(1).unwrap_or("")
    }

    /// The full canonical string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChainId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainId::parse(s)
    }
}

// ---------------------------------------------------------------------------
// AssetId (CAIP-19)
// ---------------------------------------------------------------------------

/// A canonical CAIP-19 asset identifier string.
///
/// Construction goes through an adapter's `parse_asset` /
/// `to_caip_asset_id`, which enforce per-namespace rules. The wrapper
/// itself only guarantees the `namespace:reference` shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    /// Wraps a string an adapter has already canonicalized.
    ///
    /// Crate-internal: external callers obtain `AssetId`s from adapters.
    pub(crate) fn from_canonical(s: impl Into<String>) -> Self {
        AssetId(s.into())
    }

    /// The asset namespace, e.g. `erc20` or `slip44`.
    pub fn namespace(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The asset reference, e.g. a contract address or SLIP-44 coin type.
    pub fn reference(&self) -> &str {
        self.0.splitn(2, ':').nth(1).unwrap_or("")
    }

    /// The full canonical string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TokenKey
// ---------------------------------------------------------------------------

/// The ledger's credit index: a chain paired with an asset on it.
///
/// Rendered and persisted as `"<chain>/<asset>"`, e.g.
/// `eip155:11155111/erc20:0x1c7d…`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenKey {
    chain: ChainId,
    asset: AssetId,
}

impl TokenKey {
    /// Pairs a chain with a canonical asset on that chain.
    pub fn new(chain: ChainId, asset: AssetId) -> Self {
        TokenKey { chain, asset }
    }

    /// The chain half of the key.
    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    /// The asset half of the key.
    pub fn asset(&self) -> &AssetId {
        &self.asset
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain, self.asset)
    }
}

impl FromStr for TokenKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chain, asset) = s.split_once('/').ok_or_else(|| {
            EngineError::Format(format!("token key must be chain/asset, got {s:?}"))
        })?;
        if asset.is_empty() {
            return Err(EngineError::Format(format!(
                "token key has empty asset part: {s:?}"
            )));
        }
        Ok(TokenKey {
            chain: ChainId::parse(chain)?,
            asset: AssetId::from_canonical(asset),
        })
    }
}

impl Serialize for TokenKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A chain-native address in one of the three shapes the supported
/// chain families use.
///
/// Each variant holds the canonical form: numeric account indexes are
/// plain integers, EVM addresses are lowercase 40-hex-char strings
/// without the `0x` prefix, and Base58 addresses keep their checked
/// Base58Check spelling.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    /// Account-model chain: a non-negative account index (`#11` / `11`).
    Account(u64),
    /// EVM chain: 20-byte address as lowercase hex, no `0x`.
    Evm(String),
    /// Base58Check-addressed chain: e.g. `tz1…` or `KT1…`.
    Base58(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Account(n) => write!(f, "#{n}"),
            Address::Evm(hex) => f.write_str(hex),
            Address::Base58(s) => f.write_str(s),
        }
    }
}

// ---------------------------------------------------------------------------
// UserKey
// ---------------------------------------------------------------------------

/// Canonical string ledger index for a user, derived from a validated
/// [`Address`] by the owning adapter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    /// Wraps an adapter-canonicalized address string.
    pub fn new(s: impl Into<String>) -> Self {
        UserKey(s.into())
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Address> for UserKey {
    fn from(addr: &Address) -> Self {
        UserKey(addr.to_string())
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TxId
// ---------------------------------------------------------------------------

/// A canonical 32-byte transaction identifier.
///
/// Unique per distinct transaction on a given chain. Rendered as
/// lowercase hex without a prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId([u8; 32]);

impl TxId {
    /// Wraps exactly 32 bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        TxId(bytes)
    }

    /// Parses a hex string (with or without `0x`), requiring exactly
    /// 32 bytes. Returns `None` for anything else.
    pub fn parse_hex(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if s.len() != 64 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Some(TxId(id))
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, no prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Strips a CAIP-10 chain-ID prefix from an account string if present.
///
/// Returns the prefix (if any) and the bare address part. The caller is
/// responsible for checking the prefix matched its own chain: a prefixed
/// address carries the chain it belongs to, and an adapter must refuse
/// addresses prefixed for a different chain.
pub(crate) fn split_caip10(s: &str) -> (Option<&str>, &str) {
    match s.rfind(':') {
        Some(idx) => (Some(&s[..idx]), &s[idx + 1..]),
        None => (None, s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_parses_namespace_and_reference() {
        let id = ChainId::parse("eip155:11155111").unwrap();
        assert_eq!(id.namespace(), "eip155");
        assert_eq!(id.reference(), "11155111");
        assert_eq!(id.to_string(), "eip155:11155111");
    }

    #[test]
    fn chain_id_rejects_malformed() {
        assert!(ChainId::parse("eip155").is_err());
        assert!(ChainId::parse(":ref").is_err());
        assert!(ChainId::parse("ns:").is_err());
        assert!(ChainId::parse("").is_err());
        assert!(ChainId::parse("a:b:c").is_err());
    }

    #[test]
    fn token_key_round_trips_as_string() {
        let key = TokenKey::new(
            ChainId::parse("convex:test").unwrap(),
            AssetId::from_canonical("cad29:72"),
        );
        let s = key.to_string();
        assert_eq!(s, "convex:test/cad29:72");
        let back: TokenKey = s.parse().unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn token_key_serde_uses_string_form() {
        let key = TokenKey::new(
            ChainId::parse("eip155:1").unwrap(),
            AssetId::from_canonical("slip44:60"),
        );
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"eip155:1/slip44:60\"");
        let back: TokenKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn token_key_rejects_missing_slash() {
        assert!("eip155:1".parse::<TokenKey>().is_err());
        assert!("eip155:1/".parse::<TokenKey>().is_err());
    }

    #[test]
    fn address_display_is_canonical() {
        assert_eq!(Address::Account(11).to_string(), "#11");
        assert_eq!(
            Address::Evm("a752b195b4e7b1af82ca472756edfdb13bc9c79d".into()).to_string(),
            "a752b195b4e7b1af82ca472756edfdb13bc9c79d"
        );
        assert_eq!(
            Address::Base58("tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb".into()).to_string(),
            "tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb"
        );
    }

    #[test]
    fn tx_id_parses_32_byte_hex_only() {
        let hex64 = "9d3a3663d32b9ff5cf2d393e433b7b31489d13b398133a35c4bb6e2085bd8e83";
        let id = TxId::parse_hex(hex64).unwrap();
        assert_eq!(id.to_hex(), hex64);
        assert_eq!(TxId::parse_hex(&format!("0x{hex64}")).unwrap(), id);

        assert!(TxId::parse_hex("abcd").is_none());
        assert!(TxId::parse_hex(&hex64[..62]).is_none());
        assert!(TxId::parse_hex(&format!("{hex64}ff")).is_none());
        assert!(TxId::parse_hex(&hex64.replace('9', "z")).is_none());
    }

    #[test]
    fn split_caip10_finds_last_colon() {
        let (prefix, addr) = split_caip10("eip155:1:0xabc");
        assert_eq!(prefix, Some("eip155:1"));
        assert_eq!(addr, "0xabc");

        let (prefix, addr) = split_caip10("0xabc");
        assert_eq!(prefix, None);
        assert_eq!(addr, "0xabc");
    }
}
