//! Hardware-backed signer
//!
//! Holds only public key material locally. Signing converts the PSBT into
//! the device's own transaction description (explicit input and output
//! script types), ships it to the device through the injected
//! [`HardwareDevice`] port, and splices the returned witness data back
//! into the PSBT. A device answer without witness data on any input is a
//! hard error: non-segwit device flows are unsupported.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::bip32::Xpub;
use bitcoin::consensus::encode::deserialize;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::psbt::{Input, Psbt};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{ecdsa, Address, Script, Sequence, Transaction};
use log::warn;
use serde::{Deserialize, Serialize};

use super::{
    finalize_inputs, next_branch_address, path_to_address_n, validate_signatures, AccountTracker,
    Signer,
};
use crate::asset::payload_from_script;
use crate::backend::{BackendClient, XpubToken};
use crate::error::{Result, WalletError};
use crate::network::NetworkParams;
use crate::psbt::input_hd_path;
use crate::storage::{load_encrypted, store_encrypted, KeyValueStore};

/// Input spending type in the device transaction format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceInputScriptType {
    #[serde(rename = "SPENDMULTISIG")]
    SpendMultisig,
    #[serde(rename = "SPENDWITNESS")]
    SpendWitness,
    #[serde(rename = "SPENDP2SHWITNESS")]
    SpendP2shWitness,
    #[serde(rename = "SPENDADDRESS")]
    SpendAddress,
}

/// Output type in the device transaction format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceOutputScriptType {
    #[serde(rename = "PAYTOOPRETURN")]
    PayToOpReturn,
    #[serde(rename = "PAYTOWITNESS")]
    PayToWitness,
    #[serde(rename = "PAYTOSCRIPTHASH")]
    PayToScriptHash,
    #[serde(rename = "PAYTOADDRESS")]
    PayToAddress,
}

/// One transaction input in the device's format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTxInput {
    /// Previous transaction id in display order
    pub prev_hash: String,
    pub prev_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
    /// Derivation path in hardened-flag integer form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_n: Option<Vec<u32>>,
    pub script_type: DeviceInputScriptType,
}

/// One transaction output in the device's format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTxOutput {
    /// Amount in satoshis, decimal string
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_return_data: Option<String>,
    pub script_type: DeviceOutputScriptType,
}

/// Complete transaction description shipped to the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTransaction {
    /// Coin tag the device uses to pick address encoding
    pub coin: String,
    pub version: i32,
    pub inputs: Vec<DeviceTxInput>,
    pub outputs: Vec<DeviceTxOutput>,
}

/// Port to the physical device. The host environment supplies the
/// transport (USB, bridge, emulator).
#[async_trait]
pub trait HardwareDevice: Send + Sync {
    /// Fetch the account-level xpub descriptor at a hardened path.
    async fn account_xpub(&self, path: &str, coin: &str) -> Result<String>;
    /// Sign the described transaction and return the fully serialized
    /// signed transaction hex.
    async fn sign_transaction(&self, tx: &DeviceTransaction) -> Result<String>;
}

/// Persisted, encrypted hardware signer state: account xpubs only.
#[derive(Serialize, Deserialize)]
struct HardwareRecord {
    xpubs: Vec<String>,
    num_accounts: usize,
}

/// Signer delegating all private key operations to an external device.
pub struct HardwareSigner {
    device: Arc<dyn HardwareDevice>,
    password: String,
    tracker: AccountTracker,
    backend: Option<BackendClient>,
    storage: Arc<dyn KeyValueStore>,
    secp: Secp256k1<All>,
}

impl HardwareSigner {
    /// Construct a signer bound to a device. A previously persisted
    /// account record is restored when the password decrypts it; call
    /// [`HardwareSigner::create_account`] when none was found.
    pub fn new(
        device: Arc<dyn HardwareDevice>,
        password: &str,
        params: NetworkParams,
        backend: Option<BackendClient>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let mut signer = Self {
            device,
            password: password.to_string(),
            tracker: AccountTracker::new(params),
            backend,
            storage,
            secp: Secp256k1::new(),
        };
        if !password.is_empty() {
            if let Err(err) = signer.restore(password) {
                warn!("hardware signer restore failed: {}", err);
            }
        }
        Ok(signer)
    }

    fn storage_key(&self) -> String {
        format!("{}_hardwaresigner", self.tracker.params().bech32_prefix)
    }

    fn coin(&self) -> &str {
        &self.tracker.params().bech32_prefix
    }

    pub fn tracker(&self) -> &AccountTracker {
        &self.tracker
    }

    pub fn has_accounts(&self) -> bool {
        self.tracker.account_count() > 0
    }

    /// Select an already-derived account.
    pub fn set_account_index(&mut self, index: usize) -> Result<()> {
        self.tracker.set_account_index(index)
    }

    /// Ask the device for the next account's xpub, select it and persist
    /// the new state.
    pub async fn create_account(&mut self) -> Result<usize> {
        let path = self.tracker.account_path(self.tracker.account_count());
        let descriptor = self.device.account_xpub(&path, self.coin()).await?;
        let xpub = Xpub::from_str(&descriptor)?;
        let index = self.tracker.push_account(xpub);
        self.backup()?;
        Ok(index)
    }

    /// Restore account xpubs from the persisted record. `Ok(false)` when
    /// no record exists or the password does not decrypt it; a record
    /// whose xpubs fail to round-trip is corrupt and surfaces as an error.
    pub fn restore(&mut self, password: &str) -> Result<bool> {
        let Some(record) = load_encrypted::<HardwareRecord>(
            self.storage.as_ref(),
            &self.storage_key(),
            password,
        )?
        else {
            return Ok(false);
        };
        if record.num_accounts == 0 || record.num_accounts > 1000 {
            return Ok(false);
        }
        self.tracker.clear_accounts();
        for stored in &record.xpubs {
            let xpub = Xpub::from_str(stored)?;
            if xpub.to_string() != *stored {
                return Err(WalletError::Storage(
                    "account public key mismatch, check network parameters".to_string(),
                ));
            }
            self.tracker.push_account(xpub);
        }
        self.tracker.set_account_index(0)?;
        Ok(true)
    }

    /// Re-encrypt and persist the account xpubs. Skipped when the signer
    /// was created without a password.
    pub fn backup(&self) -> Result<()> {
        if self.password.is_empty() {
            return Ok(());
        }
        let record = HardwareRecord {
            xpubs: self
                .tracker
                .account_xpubs()
                .map(|xpub| xpub.to_string())
                .collect(),
            num_accounts: self.tracker.account_count(),
        };
        store_encrypted(
            self.storage.as_ref(),
            &self.storage_key(),
            &record,
            &self.password,
        )
    }

    /// Convert a PSBT into the device's transaction description, mapping
    /// each input and output to its explicit script type.
    pub fn to_device_transaction(
        &self,
        psbt: &Psbt,
        path_override: Option<&str>,
    ) -> Result<DeviceTransaction> {
        let mut inputs = Vec::with_capacity(psbt.inputs.len());
        for (index, txin) in psbt.unsigned_tx.input.iter().enumerate() {
            let input = &psbt.inputs[index];
            let mut entry = DeviceTxInput {
                prev_hash: txin.previous_output.txid.to_string(),
                prev_index: txin.previous_output.vout,
                sequence: (txin.sequence != Sequence::MAX).then(|| txin.sequence.to_consensus_u32()),
                address_n: None,
                script_type: input_script_type(input),
            };
            let resolved = match (path_override, input_hd_path(input)) {
                (Some(path), _) => Some(path.to_string()),
                (None, Some(path)) if input.bip32_derivation.is_empty() => Some(path),
                _ => None,
            };
            if let Some(path) = resolved {
                entry.address_n = Some(path_to_address_n(&path)?);
            }
            inputs.push(entry);
        }

        let mut outputs = Vec::with_capacity(psbt.unsigned_tx.output.len());
        for txout in &psbt.unsigned_tx.output {
            let script_pubkey = &txout.script_pubkey;
            let entry = if script_pubkey.is_op_return() {
                DeviceTxOutput {
                    amount: txout.value.to_sat().to_string(),
                    address: None,
                    op_return_data: Some(hex::encode(
                        payload_from_script(script_pubkey).unwrap_or_default(),
                    )),
                    script_type: DeviceOutputScriptType::PayToOpReturn,
                }
            } else {
                let address = Address::from_script(script_pubkey, self.tracker.params().network)
                    .map_err(|err| WalletError::Address(err.to_string()))?;
                DeviceTxOutput {
                    amount: txout.value.to_sat().to_string(),
                    address: Some(address.to_string()),
                    op_return_data: None,
                    script_type: output_script_type(script_pubkey),
                }
            };
            outputs.push(entry);
        }

        Ok(DeviceTransaction {
            coin: self.coin().to_string(),
            version: psbt.unsigned_tx.version.0,
            inputs,
            outputs,
        })
    }
}

fn is_multisig_script(script: &Script) -> bool {
    script.as_bytes().last() == Some(&OP_CHECKMULTISIG.to_u8())
}

fn input_script_type(input: &Input) -> DeviceInputScriptType {
    if let Some(witness_script) = &input.witness_script {
        if is_multisig_script(witness_script) {
            return DeviceInputScriptType::SpendMultisig;
        }
    }
    match &input.witness_utxo {
        Some(witness_utxo) => {
            let script_pubkey = &witness_utxo.script_pubkey;
            if script_pubkey.is_p2wpkh() {
                DeviceInputScriptType::SpendWitness
            } else if script_pubkey.is_p2sh() || script_pubkey.is_p2wsh() {
                DeviceInputScriptType::SpendP2shWitness
            } else {
                DeviceInputScriptType::SpendAddress
            }
        }
        None => DeviceInputScriptType::SpendAddress,
    }
}

fn output_script_type(script_pubkey: &Script) -> DeviceOutputScriptType {
    if script_pubkey.is_p2wpkh() || script_pubkey.is_p2wsh() {
        DeviceOutputScriptType::PayToWitness
    } else if script_pubkey.is_p2sh() {
        DeviceOutputScriptType::PayToScriptHash
    } else {
        DeviceOutputScriptType::PayToAddress
    }
}

#[async_trait]
impl Signer for HardwareSigner {
    async fn sign(&self, mut psbt: Psbt, path_override: Option<&str>) -> Result<Psbt> {
        if psbt.inputs.is_empty() || psbt.unsigned_tx.output.is_empty() {
            return Err(WalletError::DeviceIncompatible(
                "transaction is lacking inputs or outputs".to_string(),
            ));
        }
        let device_tx = self.to_device_transaction(&psbt, path_override)?;
        let signed_hex = self.device.sign_transaction(&device_tx).await?;
        let bytes =
            hex::decode(&signed_hex).map_err(|err| WalletError::Encoding(err.to_string()))?;
        let tx: Transaction =
            deserialize(&bytes).map_err(|err| WalletError::Encoding(err.to_string()))?;
        if tx.input.len() != psbt.inputs.len() {
            return Err(WalletError::DeviceIncompatible(
                "device returned a transaction with a different input count".to_string(),
            ));
        }

        for index in 0..psbt.inputs.len() {
            let witness = &tx.input[index].witness;
            let (Some(signature_bytes), Some(pubkey_bytes)) = (witness.nth(0), witness.nth(1))
            else {
                return Err(WalletError::DeviceIncompatible(
                    "device returned an input without witness data, move the funds to a segwit account".to_string(),
                ));
            };
            let signature = ecdsa::Signature::from_slice(signature_bytes)
                .map_err(|err| WalletError::DeviceIncompatible(err.to_string()))?;
            let pubkey = bitcoin::PublicKey::from_slice(pubkey_bytes)
                .map_err(|err| WalletError::DeviceIncompatible(err.to_string()))?;
            psbt.inputs[index].partial_sigs.insert(pubkey, signature);
        }

        if validate_signatures(&psbt, &self.secp) {
            finalize_inputs(&mut psbt);
        }
        Ok(psbt)
    }

    async fn new_change_address(&mut self, skip_increment: bool) -> Result<Option<String>> {
        next_branch_address(&mut self.tracker, self.backend.as_ref(), true, skip_increment).await
    }

    async fn new_receiving_address(&mut self, skip_increment: bool) -> Result<Option<String>> {
        next_branch_address(&mut self.tracker, self.backend.as_ref(), false, skip_increment).await
    }

    fn account_xpub(&self) -> Result<String> {
        Ok(self.tracker.account_xpub()?.to_string())
    }

    fn apply_xpub_tokens(&mut self, tokens: &[XpubToken]) {
        self.tracker.apply_xpub_tokens(tokens);
    }

    fn network_params(&self) -> &NetworkParams {
        self.tracker.params()
    }
}
