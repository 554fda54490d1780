//! Asset identifiers, metadata and the allocation output codec
//!
//! This module provides functionality for:
//! - Splitting 64-bit asset guids into base and NFT components
//! - The binary asset metadata records built during UTXO sanitization
//! - Encoding/decoding asset allocations carried in an OP_RETURN output,
//!   including the per-asset notary signature slot
//! - Reading and writing transaction memos embedded after the payload

use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Address, Network, Script, ScriptBuf, Transaction, TxOut, WPubkeyHash};
use bitcoin::hashes::Hash;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};

/// Transaction version for plain coin transfers.
pub const TX_VERSION_STANDARD: i32 = 2;
/// Transaction version creating a new asset.
pub const TX_VERSION_ASSET_ACTIVATE: i32 = 130;
/// Transaction version updating asset metadata.
pub const TX_VERSION_ASSET_UPDATE: i32 = 131;
/// Transaction version moving asset allocations between addresses.
pub const TX_VERSION_ALLOCATION_SEND: i32 = 132;
/// Transaction version burning an allocation (outputs may exceed inputs).
pub const TX_VERSION_ALLOCATION_BURN: i32 = 133;
/// Transaction version minting an allocation from a cross-chain proof.
pub const TX_VERSION_ALLOCATION_MINT: i32 = 134;

/// Length of a notary co-signature (recoverable ECDSA).
pub const NOTARY_SIG_LEN: usize = 65;
/// Placeholder signature meaning "notarization required but not yet done".
pub const EMPTY_NOTARY_SIG: [u8; NOTARY_SIG_LEN] = [0u8; NOTARY_SIG_LEN];

/// True when the version byte marks an asset transaction of any kind.
pub fn is_allocation_version(version: i32) -> bool {
    (TX_VERSION_ASSET_ACTIVATE..=TX_VERSION_ALLOCATION_MINT).contains(&version)
}

/// Lower 32 bits of a guid identify the base asset; the upper 32 bits
/// carry an optional NFT id.
pub fn base_asset_id(asset_guid: u64) -> u64 {
    asset_guid & 0xffff_ffff
}

/// Compose a full asset guid from an NFT id and a base asset id.
pub fn compose_asset_id(nft_id: u64, base_id: u64) -> u64 {
    (nft_id << 32) | base_asset_id(base_id)
}

/// LEB128-style variable length integers used inside the allocation payload.
pub mod varint {
    use crate::error::{Result, WalletError};

    /// Append a u64 as a variable-length integer.
    pub fn encode_to(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// Decode a variable-length integer, advancing `offset`.
    pub fn decode(bytes: &[u8], offset: &mut usize) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *bytes
                .get(*offset)
                .ok_or_else(|| WalletError::AllocationCodec("truncated varint".to_string()))?;
            *offset += 1;
            if shift > 63 {
                return Err(WalletError::AllocationCodec("varint overflow".to_string()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

/// A single asset amount assigned to a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationOutput {
    /// Index of the transaction output receiving the amount
    pub output_index: u32,
    /// Asset amount in the asset's smallest unit
    pub value: u64,
}

/// One asset's allocation entry inside the OP_RETURN payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Full asset guid (base id plus optional NFT id)
    pub asset_guid: u64,
    /// Amounts assigned to transaction outputs
    pub outputs: Vec<AllocationOutput>,
    /// Notary signature slot: `None` when the asset needs no notarization,
    /// all-zero when notarization is required but pending
    pub notary_sig: Option<Vec<u8>>,
}

impl Allocation {
    /// True when this entry carries the all-zero placeholder, i.e. a
    /// notary signature is required but has not been obtained yet.
    pub fn awaits_notarization(&self) -> bool {
        self.notary_sig.as_deref() == Some(&EMPTY_NOTARY_SIG[..])
    }
}

/// Serialize allocation entries into the OP_RETURN payload form.
pub fn encode_allocations(allocations: &[Allocation]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    varint::encode_to(allocations.len() as u64, &mut buf);
    for allocation in allocations {
        varint::encode_to(allocation.asset_guid, &mut buf);
        varint::encode_to(allocation.outputs.len() as u64, &mut buf);
        for output in &allocation.outputs {
            varint::encode_to(u64::from(output.output_index), &mut buf);
            varint::encode_to(output.value, &mut buf);
        }
        match &allocation.notary_sig {
            Some(sig) => {
                if sig.len() != NOTARY_SIG_LEN {
                    return Err(WalletError::AllocationCodec(format!(
                        "notary signature must be {} bytes, got {}",
                        NOTARY_SIG_LEN,
                        sig.len()
                    )));
                }
                buf.push(NOTARY_SIG_LEN as u8);
                buf.extend_from_slice(sig);
            }
            None => buf.push(0),
        }
    }
    Ok(buf)
}

/// Decode the OP_RETURN payload back into allocation entries.
pub fn decode_allocations(payload: &[u8]) -> Result<Vec<Allocation>> {
    let mut offset = 0usize;
    let count = varint::decode(payload, &mut offset)?;
    let mut allocations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let asset_guid = varint::decode(payload, &mut offset)?;
        let output_count = varint::decode(payload, &mut offset)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let output_index = varint::decode(payload, &mut offset)?;
            let value = varint::decode(payload, &mut offset)?;
            outputs.push(AllocationOutput {
                output_index: u32::try_from(output_index).map_err(|_| {
                    WalletError::AllocationCodec("output index out of range".to_string())
                })?,
                value,
            });
        }
        let sig_len = *payload
            .get(offset)
            .ok_or_else(|| WalletError::AllocationCodec("truncated signature length".to_string()))?
            as usize;
        offset += 1;
        let notary_sig = if sig_len == 0 {
            None
        } else {
            if sig_len != NOTARY_SIG_LEN {
                return Err(WalletError::AllocationCodec(format!(
                    "unexpected signature length {}",
                    sig_len
                )));
            }
            let end = offset
                .checked_add(sig_len)
                .filter(|end| *end <= payload.len())
                .ok_or_else(|| {
                    WalletError::AllocationCodec("truncated signature".to_string())
                })?;
            let sig = payload[offset..end].to_vec();
            offset = end;
            Some(sig)
        };
        allocations.push(Allocation {
            asset_guid,
            outputs,
            notary_sig,
        });
    }
    Ok(allocations)
}

/// Build the OP_RETURN script carrying the given allocations.
pub fn allocation_script(allocations: &[Allocation]) -> Result<ScriptBuf> {
    let payload = encode_allocations(allocations)?;
    let push = PushBytesBuf::try_from(payload)
        .map_err(|_| WalletError::AllocationCodec("payload exceeds push limit".to_string()))?;
    Ok(Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push)
        .into_script())
}

/// Extract the raw pushdata following OP_RETURN, if the script is a data
/// carrier with a single push.
pub fn payload_from_script(script: &Script) -> Option<Vec<u8>> {
    if !script.is_op_return() {
        return None;
    }
    let mut instructions = script.instructions();
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_RETURN => {}
        _ => return None,
    }
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(push))) => Some(push.as_bytes().to_vec()),
        _ => None,
    }
}

/// Index of the allocation-bearing output, if present.
pub fn find_allocation_output(outputs: &[TxOut]) -> Option<usize> {
    outputs
        .iter()
        .position(|out| out.script_pubkey.is_op_return())
}

/// Decode the allocations committed by a transaction. A transaction without
/// an OP_RETURN output yields an empty list rather than an error.
pub fn allocations_from_tx(tx: &Transaction) -> Result<Vec<Allocation>> {
    match find_allocation_output(&tx.output) {
        Some(index) => {
            let payload = payload_from_script(&tx.output[index].script_pubkey).ok_or_else(|| {
                WalletError::AllocationCodec("allocation output has no pushdata".to_string())
            })?;
            decode_allocations(&payload)
        }
        None => Ok(Vec::new()),
    }
}

/// Notary connection settings for one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotaryDetails {
    /// Endpoint URL accepting notarization requests; empty when unset
    pub endpoint: String,
    /// Whether the notary promises instant transfers
    pub instant_transfers: bool,
    /// Whether the notary requires HD account disclosure
    pub hd_required: bool,
}

/// One auxiliary fee bracket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxFee {
    /// Lower bound of the bracket in asset units
    pub bound: u64,
    /// Fee in basis points applied within the bracket
    pub percent: u16,
}

/// Auxiliary fee schedule and payout address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxFeeDetails {
    /// Key hash the auxiliary fee is paid to
    pub aux_fee_key_id: Vec<u8>,
    /// p2wpkh address derived from the key hash
    pub aux_fee_address: Option<Address>,
    /// Fee brackets
    pub aux_fees: Vec<AuxFee>,
}

/// Binary, type-safe form of one asset's backend metadata record.
/// Read-only during a transaction's construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    /// Bound contract on the foreign chain, raw bytes
    pub contract: Vec<u8>,
    /// Public metadata blob
    pub pub_data: Vec<u8>,
    /// Notary public key hash; empty when the asset has no notary
    pub notary_key_id: Vec<u8>,
    /// p2wpkh address derived from the notary key hash
    pub notary_address: Option<Address>,
    /// Current notary signature; zero placeholder until notarized
    pub notary_sig: Vec<u8>,
    /// Notary endpoint descriptor
    pub notary_details: Option<NotaryDetails>,
    /// Auxiliary fee schedule
    pub aux_fee_details: Option<AuxFeeDetails>,
    /// Which metadata fields the owner may still update
    pub update_capability_flags: u8,
    /// Maximum supply in the asset's smallest unit
    pub max_supply: u64,
    /// Number of decimal places
    pub precision: u8,
}

impl AssetRecord {
    /// True when transactions moving this asset require a notary signature.
    pub fn requires_notarization(&self) -> bool {
        self.notary_details
            .as_ref()
            .map_or(false, |details| !details.endpoint.is_empty())
    }
}

/// Per-attempt notarization state for one asset. Created fresh for every
/// transaction attempt and discarded afterwards, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryAsset {
    /// Base asset guid
    pub asset_guid: u64,
    /// Endpoint URL to request the signature from
    pub endpoint: String,
    /// Signature buffer, zeroed until the notary answers
    pub signature: Vec<u8>,
    /// Whether the signature has been obtained this attempt
    pub notarized: bool,
}

impl NotaryAsset {
    /// Build the per-attempt state from an asset's metadata record.
    /// Returns `None` when the asset has no notary endpoint.
    pub fn from_record(asset_guid: u64, record: &AssetRecord) -> Option<Self> {
        let details = record.notary_details.as_ref()?;
        if details.endpoint.is_empty() {
            return None;
        }
        Some(Self {
            asset_guid,
            endpoint: details.endpoint.clone(),
            signature: record.notary_sig.clone(),
            notarized: false,
        })
    }
}

/// Derive the p2wpkh payout address for a 20-byte key hash.
pub fn address_from_key_hash(key_hash: &[u8], network: Network) -> Option<Address> {
    let hash = WPubkeyHash::from_slice(key_hash).ok()?;
    let script = ScriptBuf::new_p2wpkh(&hash);
    match Address::from_script(&script, network) {
        Ok(address) => Some(address),
        Err(err) => {
            debug!("could not derive address from key hash: {}", err);
            None
        }
    }
}

/// Find a memo embedded after `header` in any OP_RETURN output.
pub fn memo_from_tx(tx: &Transaction, header: &[u8]) -> Option<Vec<u8>> {
    tx.output
        .iter()
        .filter(|out| out.script_pubkey.is_op_return())
        .find_map(|out| memo_from_script(&out.script_pubkey, header))
}

/// Find a memo embedded after `header` within a script's pushdata.
pub fn memo_from_script(script: &Script, header: &[u8]) -> Option<Vec<u8>> {
    let payload = payload_from_script(script)?;
    let at = payload
        .windows(header.len())
        .position(|window| window == header)?;
    Some(payload[at + header.len()..].to_vec())
}

/// Append `header || memo` to the transaction's OP_RETURN payload, adding a
/// zero-value data output when the transaction has none.
pub fn set_transaction_memo(tx: &mut Transaction, header: &[u8], memo: &[u8]) -> Result<()> {
    let mut payload = match find_allocation_output(&tx.output) {
        Some(index) => payload_from_script(&tx.output[index].script_pubkey).unwrap_or_default(),
        None => Vec::new(),
    };
    payload.extend_from_slice(header);
    payload.extend_from_slice(memo);
    let push = PushBytesBuf::try_from(payload)
        .map_err(|_| WalletError::AllocationCodec("memo exceeds push limit".to_string()))?;
    let script = Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push)
        .into_script();
    match find_allocation_output(&tx.output) {
        Some(index) => tx.output[index].script_pubkey = script,
        None => tx.output.push(TxOut {
            value: bitcoin::Amount::ZERO,
            script_pubkey: script,
        }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_allocations() -> Vec<Allocation> {
        vec![
            Allocation {
                asset_guid: 0x1234_5678,
                outputs: vec![
                    AllocationOutput {
                        output_index: 0,
                        value: 100_000_000,
                    },
                    AllocationOutput {
                        output_index: 2,
                        value: 50,
                    },
                ],
                notary_sig: Some(EMPTY_NOTARY_SIG.to_vec()),
            },
            Allocation {
                asset_guid: compose_asset_id(7, 42),
                outputs: vec![AllocationOutput {
                    output_index: 1,
                    value: 1,
                }],
                notary_sig: None,
            },
        ]
    }

    #[test]
    fn test_asset_id_split() {
        let guid = compose_asset_id(7, 42);
        assert_eq!(base_asset_id(guid), 42);
        assert_eq!(guid >> 32, 7);
        assert_eq!(base_asset_id(42), 42);
    }

    #[test]
    fn test_varint_roundtrip() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            buf.clear();
            varint::encode_to(value, &mut buf);
            let mut offset = 0;
            assert_eq!(varint::decode(&buf, &mut offset).unwrap(), value);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn test_varint_rejects_truncation() {
        let mut offset = 0;
        assert!(varint::decode(&[0x80], &mut offset).is_err());
    }

    #[test]
    fn test_allocation_codec_roundtrip() {
        let allocations = sample_allocations();
        let payload = encode_allocations(&allocations).unwrap();
        let decoded = decode_allocations(&payload).unwrap();
        assert_eq!(decoded, allocations);
    }

    #[test]
    fn test_allocation_script_roundtrip() {
        let allocations = sample_allocations();
        let script = allocation_script(&allocations).unwrap();
        assert!(script.is_op_return());
        let payload = payload_from_script(&script).unwrap();
        assert_eq!(decode_allocations(&payload).unwrap(), allocations);
    }

    #[test]
    fn test_pending_notarization_detection() {
        let allocations = sample_allocations();
        assert!(allocations[0].awaits_notarization());
        assert!(!allocations[1].awaits_notarization());

        let mut filled = allocations[0].clone();
        filled.notary_sig = Some(vec![1u8; NOTARY_SIG_LEN]);
        assert!(!filled.awaits_notarization());
    }

    #[test]
    fn test_decode_rejects_bad_sig_len() {
        // count=1, guid=1, outputs=0, sig_len=64 with no bytes after
        let payload = vec![1, 1, 0, 64];
        assert!(decode_allocations(&payload).is_err());
    }

    #[test]
    fn test_version_classification() {
        assert!(!is_allocation_version(TX_VERSION_STANDARD));
        assert!(is_allocation_version(TX_VERSION_ALLOCATION_SEND));
        assert!(is_allocation_version(TX_VERSION_ALLOCATION_BURN));
        assert!(!is_allocation_version(135));
    }

    #[test]
    fn test_memo_roundtrip() {
        use bitcoin::absolute::LockTime;
        use bitcoin::transaction::Version;

        let mut tx = Transaction {
            version: Version(TX_VERSION_STANDARD),
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        let header = [0xfe, 0xfe];
        set_transaction_memo(&mut tx, &header, b"invoice 42").unwrap();
        assert_eq!(memo_from_tx(&tx, &header).unwrap(), b"invoice 42");
        assert_eq!(memo_from_tx(&tx, &[0x01, 0x02]), None);
    }

    #[test]
    fn test_address_from_key_hash() {
        let address = address_from_key_hash(&[7u8; 20], Network::Regtest).unwrap();
        assert!(address.to_string().starts_with("bcrt1"));
        assert!(address_from_key_hash(&[7u8; 19], Network::Regtest).is_none());
    }
}
