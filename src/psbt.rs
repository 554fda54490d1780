//! PSBT assembly and extraction
//!
//! This module handles:
//! - Building a partially signed transaction from a coin-selection plan,
//!   attaching the full previous transaction for legacy inputs and a
//!   witness commitment for segwit inputs (never both)
//! - Opaque per-input side-channel entries (originating address and HD
//!   path) consumed later by signers
//! - Fee computation that tolerates negative fees, since allocation burns
//!   legitimately declare more output value than input value
//! - Rebuilding a fresh PSBT from a pre-sign clone with exactly one
//!   output replaced (the notarization splice)
//! - JSON export/import of a PSBT together with its notary asset state

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::deserialize;
use bitcoin::psbt::{raw, Input, Psbt};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use futures::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asset::NotaryAsset;
use crate::error::{Result, WalletError};
use crate::network::NetworkParams;
use crate::utxo::{InputKind, SanitizedUtxo};

/// Prefix identifying this library's proprietary PSBT key-values.
pub const PROPRIETARY_PREFIX: &[u8] = b"atta";
/// Subtype carrying the input's originating address.
pub const SUBTYPE_ADDRESS: u8 = 0x00;
/// Subtype carrying the input's HD derivation path.
pub const SUBTYPE_HD_PATH: u8 = 0x01;

/// Maximum fee rate in sat/vB tolerated at extraction unless disabled.
pub const DEFAULT_MAXIMUM_FEE_RATE: i64 = 5_000;

fn proprietary_key(subtype: u8) -> raw::ProprietaryKey {
    raw::ProprietaryKey {
        prefix: PROPRIETARY_PREFIX.to_vec(),
        subtype,
        key: Vec::new(),
    }
}

/// Attach the originating address to an input's side channel.
pub fn set_input_address(input: &mut Input, address: &str) {
    input
        .proprietary
        .insert(proprietary_key(SUBTYPE_ADDRESS), address.as_bytes().to_vec());
}

/// Read the originating address from an input's side channel.
pub fn input_address(input: &Input) -> Option<String> {
    input
        .proprietary
        .get(&proprietary_key(SUBTYPE_ADDRESS))
        .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
}

/// Attach the HD derivation path to an input's side channel.
pub fn set_input_hd_path(input: &mut Input, path: &str) {
    input
        .proprietary
        .insert(proprietary_key(SUBTYPE_HD_PATH), path.as_bytes().to_vec());
}

/// Read the HD derivation path from an input's side channel.
pub fn input_hd_path(input: &Input) -> Option<String> {
    input
        .proprietary
        .get(&proprietary_key(SUBTYPE_HD_PATH))
        .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
}

/// One planned transaction output. A directly supplied script (e.g. an
/// OP_RETURN data carrier) takes precedence over an address.
#[derive(Debug, Clone)]
pub struct PlannedOutput {
    pub address: Option<String>,
    pub script: Option<ScriptBuf>,
    /// Amount in satoshis
    pub value: u64,
}

/// Result of the external coin-selection step: the full input/output plan.
#[derive(Debug, Clone)]
pub struct CoinSelection {
    /// Transaction version, distinguishing plain sends from allocations
    pub version: i32,
    /// Whether inputs signal replace-by-fee
    pub rbf: bool,
    pub inputs: Vec<SanitizedUtxo>,
    pub outputs: Vec<PlannedOutput>,
}

/// Source of full previous transactions for legacy input signing.
#[async_trait]
pub trait PrevTxSource: Send + Sync {
    async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>>;
}

/// Placeholder source for flows that cannot fetch previous transactions.
pub struct UnavailablePrevTxs;

#[async_trait]
impl PrevTxSource for UnavailablePrevTxs {
    async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>> {
        Err(WalletError::Backend {
            message: format!("no source configured to fetch transaction {}", txid),
        })
    }
}

/// Builds PSBTs from coin-selection plans.
pub struct Assembler<'a> {
    pub prev_txs: &'a dyn PrevTxSource,
    pub params: &'a NetworkParams,
}

impl<'a> Assembler<'a> {
    pub fn new(prev_txs: &'a dyn PrevTxSource, params: &'a NetworkParams) -> Self {
        Self { prev_txs, params }
    }

    /// Build a PSBT from the plan. Legacy inputs get the full previous
    /// transaction (fetched once per distinct txid, in parallel); segwit
    /// inputs get a witness commitment. Each input also carries its
    /// originating address and HD path as side-channel entries.
    pub async fn assemble(
        &self,
        plan: &CoinSelection,
        redeem_or_witness_script: Option<&ScriptBuf>,
    ) -> Result<Psbt> {
        let sequence = if plan.rbf {
            Sequence::ENABLE_RBF_NO_LOCKTIME
        } else {
            Sequence::MAX
        };

        let tx_inputs: Vec<TxIn> = plan
            .inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: OutPoint {
                    txid: utxo.txid,
                    vout: utxo.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::default(),
            })
            .collect();

        let mut tx_outputs = Vec::with_capacity(plan.outputs.len());
        for (index, output) in plan.outputs.iter().enumerate() {
            let script_pubkey = match (&output.script, &output.address) {
                (Some(script), _) => script.clone(),
                (None, Some(address)) => self.output_script(address)?,
                (None, None) => return Err(WalletError::OutputMissingDestination(index)),
            };
            tx_outputs.push(TxOut {
                value: Amount::from_sat(output.value),
                script_pubkey,
            });
        }

        let unsigned = Transaction {
            version: Version(plan.version),
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };
        let mut psbt = Psbt::from_unsigned_tx(unsigned)?;

        let prev_transactions = self.fetch_previous_transactions(&plan.inputs).await;

        for (index, utxo) in plan.inputs.iter().enumerate() {
            let input = &mut psbt.inputs[index];
            match utxo.kind {
                InputKind::Legacy => {
                    // non-witness signing needs the complete prior transaction
                    match prev_transactions.get(&utxo.txid) {
                        Some(prev_tx) => input.non_witness_utxo = Some(prev_tx.clone()),
                        None => warn!(
                            "could not fetch input transaction for legacy UTXO {}",
                            utxo.txid
                        ),
                    }
                    if let Some(script) = redeem_or_witness_script {
                        input.redeem_script = Some(script.clone());
                    }
                }
                InputKind::Segwit => {
                    input.witness_utxo = Some(TxOut {
                        value: Amount::from_sat(utxo.value),
                        script_pubkey: self.output_script(&utxo.address)?,
                    });
                    if let Some(script) = redeem_or_witness_script {
                        input.witness_script = Some(script.clone());
                    }
                }
            }
            set_input_address(input, &utxo.address);
            if let Some(path) = &utxo.path {
                set_input_hd_path(input, path);
            }
        }

        Ok(psbt)
    }

    fn output_script(&self, address: &str) -> Result<ScriptBuf> {
        let parsed = Address::from_str(address)
            .map_err(|err| WalletError::Address(format!("{}: {}", address, err)))?
            .require_network(self.params.network)
            .map_err(|err| WalletError::Address(format!("{}: {}", address, err)))?;
        Ok(parsed.script_pubkey())
    }

    /// Fetch each distinct previous transaction referenced by a legacy
    /// input exactly once, in parallel.
    async fn fetch_previous_transactions(
        &self,
        inputs: &[SanitizedUtxo],
    ) -> HashMap<Txid, Transaction> {
        let mut wanted: Vec<Txid> = Vec::new();
        for utxo in inputs {
            if utxo.kind == InputKind::Legacy && !wanted.contains(&utxo.txid) {
                wanted.push(utxo.txid);
            }
        }

        let fetches = wanted.iter().map(|txid| self.prev_txs.raw_transaction(txid));
        let results = join_all(fetches).await;

        let mut cache = HashMap::new();
        for (txid, result) in wanted.into_iter().zip(results) {
            match result.and_then(|bytes| {
                deserialize::<Transaction>(&bytes)
                    .map_err(|err| WalletError::Encoding(err.to_string()))
            }) {
                Ok(tx) => {
                    cache.insert(txid, tx);
                }
                Err(err) => debug!("previous transaction {} unavailable: {}", txid, err),
            }
        }
        cache
    }
}

/// Extraction failures. `NotFinalized` is the normal "needs more
/// signatures" outcome, not an error condition for callers.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("transaction is not fully signed")]
    NotFinalized,
    #[error("input {input} is missing its previous output")]
    MissingPrevOutput { input: usize },
    #[error("fee rate {fee_rate} sat/vB exceeds maximum {maximum} sat/vB")]
    FeeRateTooHigh { fee_rate: i64, maximum: i64 },
}

impl From<ExtractError> for WalletError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::FeeRateTooHigh { fee_rate, maximum } => WalletError::FeeRateTooHigh {
                actual: fee_rate,
                maximum,
            },
            other => WalletError::Extraction(other.to_string()),
        }
    }
}

/// True when the input has locked its final script data.
pub fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Fee in satoshis, computed as input amount minus output amount. The
/// result is deliberately signed: allocation burns declare more output
/// value than input value, and the difference is minted on another ledger.
pub fn transaction_fee(psbt: &Psbt) -> std::result::Result<i64, ExtractError> {
    let mut input_amount: i64 = 0;
    for (index, input) in psbt.inputs.iter().enumerate() {
        if let Some(witness_utxo) = &input.witness_utxo {
            input_amount += witness_utxo.value.to_sat() as i64;
        } else if let Some(prev_tx) = &input.non_witness_utxo {
            let vout = psbt.unsigned_tx.input[index].previous_output.vout as usize;
            let prev_out = prev_tx
                .output
                .get(vout)
                .ok_or(ExtractError::MissingPrevOutput { input: index })?;
            input_amount += prev_out.value.to_sat() as i64;
        } else {
            return Err(ExtractError::MissingPrevOutput { input: index });
        }
    }
    let output_amount: i64 = psbt
        .unsigned_tx
        .output
        .iter()
        .map(|out| out.value.to_sat() as i64)
        .sum();
    Ok(input_amount - output_amount)
}

/// Fee rate in sat/vB over the finalized transaction's virtual size.
pub fn fee_rate(psbt: &Psbt) -> std::result::Result<i64, ExtractError> {
    let tx = extract_transaction(psbt, DEFAULT_MAXIMUM_FEE_RATE, true)?;
    let fee = transaction_fee(psbt)?;
    Ok(fee.div_euclid(tx.vsize() as i64))
}

/// Extract the final transaction from a fully signed PSBT.
///
/// Unlike stock extraction this never rejects a negative fee; the
/// maximum-fee-rate guard applies to positive fees only, and can be
/// disabled entirely with `disable_fee_check`.
pub fn extract_transaction(
    psbt: &Psbt,
    maximum_fee_rate: i64,
    disable_fee_check: bool,
) -> std::result::Result<Transaction, ExtractError> {
    if !psbt.inputs.iter().all(is_finalized) {
        return Err(ExtractError::NotFinalized);
    }
    let mut tx = psbt.unsigned_tx.clone();
    for (index, input) in psbt.inputs.iter().enumerate() {
        if let Some(script_sig) = &input.final_script_sig {
            tx.input[index].script_sig = script_sig.clone();
        }
        if let Some(witness) = &input.final_script_witness {
            tx.input[index].witness = witness.clone();
        }
    }
    if !disable_fee_check {
        let fee = transaction_fee(psbt)?;
        if fee > 0 {
            let rate = fee.div_euclid(tx.vsize() as i64);
            if rate >= maximum_fee_rate {
                return Err(ExtractError::FeeRateTooHigh {
                    fee_rate: rate,
                    maximum: maximum_fee_rate,
                });
            }
        }
    }
    Ok(tx)
}

/// Rebuild a fresh PSBT from a pre-sign clone with exactly one output's
/// script replaced. Every input's utxo attachment, derivation data and
/// side-channel metadata is preserved verbatim; all other outputs are
/// copied unchanged.
pub fn copy_with_modified_output(
    psbt: &Psbt,
    output_index: usize,
    script: ScriptBuf,
) -> Result<Psbt> {
    let mut tx = psbt.unsigned_tx.clone();
    let output = tx
        .output
        .get_mut(output_index)
        .ok_or_else(|| WalletError::AllocationCodec(format!(
            "output index {} out of range",
            output_index
        )))?;
    output.script_pubkey = script;

    let mut fresh = Psbt::from_unsigned_tx(tx)?;
    for (index, input) in psbt.inputs.iter().enumerate() {
        let copied = &mut fresh.inputs[index];
        copied.non_witness_utxo = input.non_witness_utxo.clone();
        copied.witness_utxo = input.witness_utxo.clone();
        copied.redeem_script = input.redeem_script.clone();
        copied.witness_script = input.witness_script.clone();
        copied.bip32_derivation = input.bip32_derivation.clone();
        copied.sighash_type = input.sighash_type;
        copied.proprietary = input.proprietary.clone();
        copied.unknown = input.unknown.clone();
    }
    for (index, output) in psbt.outputs.iter().enumerate() {
        fresh.outputs[index] = output.clone();
    }
    Ok(fresh)
}

/// Serialized PSBT plus the notary asset state needed to resume a send.
#[derive(Debug, Serialize, Deserialize)]
pub struct PsbtEnvelope {
    /// Base64 PSBT, side-channel entries included
    pub psbt: String,
    #[serde(default)]
    pub assets: Vec<NotaryAsset>,
}

/// Export a PSBT and its notary asset state to a JSON envelope.
pub fn export_psbt(psbt: &Psbt, assets: &BTreeMap<u64, NotaryAsset>) -> Result<String> {
    let envelope = PsbtEnvelope {
        psbt: BASE64.encode(psbt.serialize()),
        assets: assets.values().cloned().collect(),
    };
    serde_json::to_string(&envelope).map_err(|err| WalletError::Encoding(err.to_string()))
}

/// Import a PSBT and its notary asset state from a JSON envelope.
pub fn import_psbt(json: &str) -> Result<(Psbt, BTreeMap<u64, NotaryAsset>)> {
    let envelope: PsbtEnvelope =
        serde_json::from_str(json).map_err(|err| WalletError::Encoding(err.to_string()))?;
    let bytes = BASE64
        .decode(&envelope.psbt)
        .map_err(|err| WalletError::Encoding(err.to_string()))?;
    let psbt = Psbt::deserialize(&bytes)?;
    let assets = envelope
        .assets
        .into_iter()
        .map(|asset| (asset.asset_guid, asset))
        .collect();
    Ok((psbt, assets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::TX_VERSION_STANDARD;
    use crate::utxo::InputKind;
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, PubkeyHash};

    struct MemoryPrevTxs(HashMap<Txid, Vec<u8>>);

    #[async_trait]
    impl PrevTxSource for MemoryPrevTxs {
        async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>> {
            self.0.get(txid).cloned().ok_or(WalletError::Backend {
                message: format!("unknown transaction {}", txid),
            })
        }
    }

    const SEGWIT_ADDR: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    fn segwit_utxo(txid: &str, vout: u32, value: u64) -> SanitizedUtxo {
        SanitizedUtxo {
            kind: InputKind::Segwit,
            txid: Txid::from_str(txid).unwrap(),
            vout,
            address: SEGWIT_ADDR.to_string(),
            path: Some("m/84'/1'/0'/0/0".to_string()),
            value,
            asset: None,
            locktime: None,
        }
    }

    fn legacy_prev_tx() -> (Transaction, String) {
        let hash = PubkeyHash::from_slice(&[7u8; 20]).unwrap();
        let address = Address::p2pkh(hash, Network::Regtest).to_string();
        let tx = Transaction {
            version: Version(TX_VERSION_STANDARD),
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: ScriptBuf::new_p2pkh(&hash),
            }],
        };
        (tx, address)
    }

    fn plan_with(inputs: Vec<SanitizedUtxo>, outputs: Vec<PlannedOutput>) -> CoinSelection {
        CoinSelection {
            version: TX_VERSION_STANDARD,
            rbf: false,
            inputs,
            outputs,
        }
    }

    fn spend_output(value: u64) -> PlannedOutput {
        PlannedOutput {
            address: Some(SEGWIT_ADDR.to_string()),
            script: None,
            value,
        }
    }

    #[tokio::test]
    async fn test_segwit_inputs_get_witness_commitments_only() {
        let params = NetworkParams::regtest();
        let source = MemoryPrevTxs(HashMap::new());
        let assembler = Assembler::new(&source, &params);
        let plan = plan_with(
            vec![
                segwit_utxo(
                    "d1a92b9a7a1f1a60dfae0b0b9f2e90af25c1c2d0a4a8fbdd1e5c9c1f9f0b1a2c",
                    0,
                    50_000,
                ),
                segwit_utxo(
                    "f0e1d2c3b4a5968778695a4b3c2d1e0ff0e1d2c3b4a5968778695a4b3c2d1e0f",
                    1,
                    30_000,
                ),
            ],
            vec![spend_output(70_000)],
        );
        let psbt = assembler.assemble(&plan, None).await.unwrap();
        for input in &psbt.inputs {
            assert!(input.witness_utxo.is_some());
            assert!(input.non_witness_utxo.is_none());
            assert_eq!(input_address(input).as_deref(), Some(SEGWIT_ADDR));
            assert_eq!(input_hd_path(input).as_deref(), Some("m/84'/1'/0'/0/0"));
        }
    }

    #[tokio::test]
    async fn test_legacy_inputs_get_previous_transactions_only() {
        let params = NetworkParams::regtest();
        let (prev_tx, legacy_address) = legacy_prev_tx();
        let prev_txid = prev_tx.compute_txid();
        let source = MemoryPrevTxs(HashMap::from([(
            prev_txid,
            bitcoin::consensus::encode::serialize(&prev_tx),
        )]));
        let assembler = Assembler::new(&source, &params);

        let utxo = SanitizedUtxo {
            kind: InputKind::Legacy,
            txid: prev_txid,
            vout: 0,
            address: legacy_address,
            path: Some("m/44'/1'/0'/0/0".to_string()),
            value: 50_000,
            asset: None,
            locktime: None,
        };
        let plan = plan_with(vec![utxo], vec![spend_output(49_000)]);
        let psbt = assembler.assemble(&plan, None).await.unwrap();
        assert!(psbt.inputs[0].non_witness_utxo.is_some());
        assert!(psbt.inputs[0].witness_utxo.is_none());
        assert_eq!(
            psbt.inputs[0].non_witness_utxo.as_ref().unwrap().compute_txid(),
            prev_txid
        );
    }

    #[tokio::test]
    async fn test_script_takes_precedence_over_address() {
        let params = NetworkParams::regtest();
        let source = MemoryPrevTxs(HashMap::new());
        let assembler = Assembler::new(&source, &params);
        let data_script = ScriptBuf::new_op_return([1u8, 2, 3]);
        let plan = plan_with(
            vec![segwit_utxo(
                "d1a92b9a7a1f1a60dfae0b0b9f2e90af25c1c2d0a4a8fbdd1e5c9c1f9f0b1a2c",
                0,
                10_000,
            )],
            vec![PlannedOutput {
                address: Some(SEGWIT_ADDR.to_string()),
                script: Some(data_script.clone()),
                value: 0,
            }],
        );
        let psbt = assembler.assemble(&plan, None).await.unwrap();
        assert_eq!(psbt.unsigned_tx.output[0].script_pubkey, data_script);
    }

    fn psbt_with_amounts(input_value: u64, output_value: u64) -> Psbt {
        let tx = Transaction {
            version: Version(TX_VERSION_STANDARD),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_str(
                        "d1a92b9a7a1f1a60dfae0b0b9f2e90af25c1c2d0a4a8fbdd1e5c9c1f9f0b1a2c",
                    )
                    .unwrap(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(output_value),
                script_pubkey: ScriptBuf::new_op_return([0u8]),
            }],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(input_value),
            script_pubkey: ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_slice(&[7u8; 20]).unwrap()),
        });
        psbt
    }

    #[test]
    fn test_burn_fee_is_negative_without_error() {
        let psbt = psbt_with_amounts(100, 150);
        assert_eq!(transaction_fee(&psbt).unwrap(), -50);

        let psbt = psbt_with_amounts(150, 100);
        assert_eq!(transaction_fee(&psbt).unwrap(), 50);
    }

    #[test]
    fn test_extraction_requires_finalized_inputs() {
        let psbt = psbt_with_amounts(100, 90);
        assert!(matches!(
            extract_transaction(&psbt, DEFAULT_MAXIMUM_FEE_RATE, false),
            Err(ExtractError::NotFinalized)
        ));
    }

    #[test]
    fn test_fee_rate_guard_applies_to_positive_fees_only() {
        // dummy witness only locks the input for extraction accounting
        let mut witness = Witness::new();
        witness.push([0u8; 72]);
        witness.push([0u8; 33]);

        let mut burn = psbt_with_amounts(100, 150);
        burn.inputs[0].final_script_witness = Some(witness.clone());
        extract_transaction(&burn, 1, false).unwrap();

        let mut expensive = psbt_with_amounts(10_000_000, 100);
        expensive.inputs[0].final_script_witness = Some(witness);
        assert!(matches!(
            extract_transaction(&expensive, 1, false),
            Err(ExtractError::FeeRateTooHigh { .. })
        ));
        extract_transaction(&expensive, 1, true).unwrap();
    }

    #[tokio::test]
    async fn test_copy_preserves_metadata_and_changes_one_output() {
        let params = NetworkParams::regtest();
        let source = MemoryPrevTxs(HashMap::new());
        let assembler = Assembler::new(&source, &params);
        let plan = plan_with(
            vec![segwit_utxo(
                "d1a92b9a7a1f1a60dfae0b0b9f2e90af25c1c2d0a4a8fbdd1e5c9c1f9f0b1a2c",
                0,
                100_000,
            )],
            vec![
                spend_output(40_000),
                PlannedOutput {
                    address: None,
                    script: Some(ScriptBuf::new_op_return([9u8; 4])),
                    value: 0,
                },
            ],
        );
        let psbt = assembler.assemble(&plan, None).await.unwrap();

        let replacement = ScriptBuf::new_op_return([1u8; 8]);
        let copied = copy_with_modified_output(&psbt, 1, replacement.clone()).unwrap();

        assert_eq!(copied.inputs.len(), psbt.inputs.len());
        for (copy, original) in copied.inputs.iter().zip(&psbt.inputs) {
            assert_eq!(copy.proprietary, original.proprietary);
            assert_eq!(copy.witness_utxo, original.witness_utxo);
        }
        assert_eq!(copied.unsigned_tx.output[0], psbt.unsigned_tx.output[0]);
        assert_eq!(copied.unsigned_tx.output[1].script_pubkey, replacement);
        assert_ne!(
            copied.unsigned_tx.output[1].script_pubkey,
            psbt.unsigned_tx.output[1].script_pubkey
        );
    }

    #[tokio::test]
    async fn test_psbt_json_roundtrip_keeps_side_channel() {
        let params = NetworkParams::regtest();
        let source = MemoryPrevTxs(HashMap::new());
        let assembler = Assembler::new(&source, &params);
        let plan = plan_with(
            vec![segwit_utxo(
                "d1a92b9a7a1f1a60dfae0b0b9f2e90af25c1c2d0a4a8fbdd1e5c9c1f9f0b1a2c",
                0,
                10_000,
            )],
            vec![spend_output(9_000)],
        );
        let psbt = assembler.assemble(&plan, None).await.unwrap();
        let json = export_psbt(&psbt, &BTreeMap::new()).unwrap();
        let (restored, assets) = import_psbt(&json).unwrap();
        assert!(assets.is_empty());
        assert_eq!(input_address(&restored.inputs[0]).as_deref(), Some(SEGWIT_ADDR));
        assert_eq!(
            input_hd_path(&restored.inputs[0]).as_deref(),
            Some("m/84'/1'/0'/0/0")
        );
    }
}
