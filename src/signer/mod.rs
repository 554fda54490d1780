//! Transaction signing
//!
//! This module provides functionality for:
//! - The polymorphic [`Signer`] capability implemented by the seed-backed
//!   and hardware-backed variants
//! - Shared account/index bookkeeping ([`AccountTracker`]), composed into
//!   each variant rather than inherited
//! - PSBT sighash computation, signature validation and finalization for
//!   p2wpkh and legacy p2pkh inputs
//! - Signing with externally held WIF keys

pub mod hardware;
pub mod seed;

use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{ecdsa, Address, PrivateKey, ScriptBuf, Witness};
use log::{debug, warn};

use crate::backend::{BackendClient, XpubToken};
use crate::error::{Result, WalletError};
use crate::network::NetworkParams;

pub use crate::psbt::{input_address, input_hd_path};

/// Polymorphic signing capability. Implementations own their account
/// state exclusively; callers serialize access to one instance.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign every input whose HD path can be resolved, then validate and
    /// finalize if the signature set is complete. An incomplete signature
    /// set is a normal return (multisig flows), never an error, and
    /// re-signing a finalized transaction leaves it byte-identical.
    async fn sign(&self, psbt: Psbt, path_override: Option<&str>) -> Result<Psbt>;

    /// Derive the next change address, initializing the change index from
    /// the backend on first use. Returns `Ok(None)` when derivation fails.
    async fn new_change_address(&mut self, skip_increment: bool) -> Result<Option<String>>;

    /// Derive the next receiving address, initializing the receiving index
    /// from the backend on first use. Returns `Ok(None)` when derivation
    /// fails.
    async fn new_receiving_address(&mut self, skip_increment: bool) -> Result<Option<String>>;

    /// Public key material for the selected account. Never touches the
    /// seed or the device.
    fn account_xpub(&self) -> Result<String>;

    /// Raise the tracked change/receiving indices from a backend
    /// address-usage snapshot. Monotonic: indices never decrease.
    fn apply_xpub_tokens(&mut self, tokens: &[XpubToken]);

    /// Network configuration this signer operates on.
    fn network_params(&self) -> &NetworkParams;
}

/// Account and address-index bookkeeping shared by all signer variants.
///
/// `None` indices are the uninitialized sentinel: the first address
/// request consults the backend's used-address history before deriving.
pub struct AccountTracker {
    params: NetworkParams,
    secp: Secp256k1<All>,
    accounts: Vec<Xpub>,
    account_index: usize,
    change_index: Option<u32>,
    receiving_index: Option<u32>,
}

impl AccountTracker {
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params,
            secp: Secp256k1::new(),
            accounts: Vec::new(),
            account_index: 0,
            change_index: None,
            receiving_index: None,
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn account_index(&self) -> usize {
        self.account_index
    }

    pub fn change_index(&self) -> Option<u32> {
        self.change_index
    }

    pub fn receiving_index(&self) -> Option<u32> {
        self.receiving_index
    }

    /// Select an already-derived account, resetting both address indices
    /// to the uninitialized sentinel.
    pub fn set_account_index(&mut self, index: usize) -> Result<()> {
        if index >= self.accounts.len() {
            return Err(WalletError::UnknownAccount(index));
        }
        if self.account_index == index {
            return Ok(());
        }
        self.change_index = None;
        self.receiving_index = None;
        self.account_index = index;
        Ok(())
    }

    /// Register a freshly derived account and select it.
    pub fn push_account(&mut self, xpub: Xpub) -> usize {
        self.change_index = None;
        self.receiving_index = None;
        self.accounts.push(xpub);
        self.account_index = self.accounts.len() - 1;
        self.account_index
    }

    /// Drop all accounts, e.g. before restoring from a persisted record.
    pub fn clear_accounts(&mut self) {
        self.accounts.clear();
        self.account_index = 0;
        self.change_index = None;
        self.receiving_index = None;
    }

    pub fn account_xpub(&self) -> Result<&Xpub> {
        self.accounts
            .get(self.account_index)
            .ok_or(WalletError::UnknownAccount(self.account_index))
    }

    pub fn account_xpubs(&self) -> impl Iterator<Item = &Xpub> {
        self.accounts.iter()
    }

    /// Derivation path for the selected account's child address.
    pub fn hd_path(&self, address_index: u32, is_change: bool) -> String {
        format!(
            "m/84'/{}'/{}'/{}/{}",
            self.params.slip44,
            self.account_index,
            if is_change { 1 } else { 0 },
            address_index
        )
    }

    /// Hardened path of an account, as sent to hardware devices.
    pub fn account_path(&self, account_index: usize) -> String {
        format!("m/84'/{}'/{}'", self.params.slip44, account_index)
    }

    /// Derive a p2wpkh address under the selected account.
    pub fn derive_address(&self, address_index: u32, is_change: bool) -> Result<Address> {
        let xpub = self.account_xpub()?;
        let child = xpub.derive_pub(
            &self.secp,
            &[
                ChildNumber::from_normal_idx(if is_change { 1 } else { 0 })?,
                ChildNumber::from_normal_idx(address_index)?,
            ],
        )?;
        Ok(Address::p2wpkh(&child.to_pub(), self.params.network))
    }

    pub fn branch_index(&self, is_change: bool) -> Option<u32> {
        if is_change {
            self.change_index
        } else {
            self.receiving_index
        }
    }

    pub fn set_branch_index(&mut self, is_change: bool, index: u32) {
        if is_change {
            self.change_index = Some(index);
        } else {
            self.receiving_index = Some(index);
        }
    }

    /// Apply a full address-usage snapshot from the backend. Each token's
    /// path names a branch (change component 1) and an address index; the
    /// tracked index is raised to the maximum used index seen, never
    /// lowered. Snapshots are safe to apply in any order and any number of
    /// times, so the latest one always wins without coordination.
    pub fn apply_xpub_tokens(&mut self, tokens: &[XpubToken]) {
        for token in tokens {
            let Some(path) = &token.path else { continue };
            if token.transfers == 0 {
                continue;
            }
            let parts: Vec<&str> = path.split('/').collect();
            if parts.len() < 6 {
                continue;
            }
            let (Ok(change), Ok(index)) = (parts[4].parse::<u32>(), parts[5].parse::<u32>())
            else {
                continue;
            };
            let slot = if change == 1 {
                &mut self.change_index
            } else {
                &mut self.receiving_index
            };
            if slot.map_or(true, |current| index > current) {
                *slot = Some(index);
            }
        }
    }
}

/// Derive the next unused address on a branch, seeding the branch index
/// from the backend on first use. The backend query is retried exactly
/// once; a second failure surfaces as an error. The index is advanced
/// only after the address derives successfully.
pub(crate) async fn next_branch_address(
    tracker: &mut AccountTracker,
    backend: Option<&BackendClient>,
    is_change: bool,
    skip_increment: bool,
) -> Result<Option<String>> {
    if tracker.branch_index(is_change).is_none() {
        if let Some(backend) = backend {
            let xpub = tracker.account_xpub()?.to_string();
            let tokens = match backend.fetch_xpub_tokens(&xpub).await {
                Ok(tokens) => tokens,
                Err(err) => {
                    debug!("token fetch failed, retrying once: {}", err);
                    backend.fetch_xpub_tokens(&xpub).await.map_err(|_| {
                        WalletError::IndexRefresh {
                            branch: if is_change { "change" } else { "receiving" },
                        }
                    })?
                }
            };
            tracker.apply_xpub_tokens(&tokens);
        }
    }

    let next = tracker.branch_index(is_change).map_or(0, |index| index + 1);
    match tracker.derive_address(next, is_change) {
        Ok(address) => {
            if !skip_increment {
                tracker.set_branch_index(is_change, next);
            }
            Ok(Some(address.to_string()))
        }
        Err(err) => {
            warn!("address derivation failed: {}", err);
            Ok(None)
        }
    }
}

/// Compute the sighash message for one input: BIP143 for p2wpkh witness
/// commitments, the legacy algorithm for inputs carrying a full previous
/// transaction.
pub(crate) fn sighash_message(psbt: &Psbt, index: usize) -> Result<Message> {
    let input = &psbt.inputs[index];
    let tx = &psbt.unsigned_tx;
    if let Some(witness_utxo) = &input.witness_utxo {
        let script_pubkey = &witness_utxo.script_pubkey;
        if !script_pubkey.is_p2wpkh() {
            return Err(WalletError::Sighash(format!(
                "input {} has an unsupported witness script type",
                index
            )));
        }
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .p2wpkh_signature_hash(
                index,
                script_pubkey,
                witness_utxo.value,
                EcdsaSighashType::All,
            )
            .map_err(|err| WalletError::Sighash(err.to_string()))?;
        Message::from_digest_slice(&sighash[..]).map_err(|err| WalletError::Sighash(err.to_string()))
    } else if let Some(prev_tx) = &input.non_witness_utxo {
        let vout = tx.input[index].previous_output.vout as usize;
        let prev_out = prev_tx.output.get(vout).ok_or_else(|| {
            WalletError::Sighash(format!("input {} previous output missing", index))
        })?;
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .legacy_signature_hash(
                index,
                &prev_out.script_pubkey,
                EcdsaSighashType::All.to_u32(),
            )
            .map_err(|err| WalletError::Sighash(err.to_string()))?;
        Message::from_digest_slice(&sighash[..]).map_err(|err| WalletError::Sighash(err.to_string()))
    } else {
        Err(WalletError::Sighash(format!(
            "input {} carries neither witness nor previous transaction data",
            index
        )))
    }
}

/// Sign one input with a raw secret key and record the partial signature.
pub(crate) fn sign_input_with_key(
    psbt: &mut Psbt,
    index: usize,
    secret_key: &SecretKey,
    secp: &Secp256k1<All>,
) -> Result<()> {
    let message = sighash_message(psbt, index)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    let pubkey = bitcoin::PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(
        secp, secret_key,
    ));
    psbt.inputs[index].partial_sigs.insert(
        pubkey,
        ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        },
    );
    Ok(())
}

/// Verify every partial signature against its recomputed sighash. Inputs
/// already finalized count as complete; a non-finalized input without any
/// signature makes the set incomplete.
pub(crate) fn validate_signatures(psbt: &Psbt, secp: &Secp256k1<All>) -> bool {
    for (index, input) in psbt.inputs.iter().enumerate() {
        if crate::psbt::is_finalized(input) {
            continue;
        }
        if input.partial_sigs.is_empty() {
            return false;
        }
        let Ok(message) = sighash_message(psbt, index) else {
            return false;
        };
        for (pubkey, signature) in &input.partial_sigs {
            if secp
                .verify_ecdsa(&message, &signature.signature, &pubkey.inner)
                .is_err()
            {
                return false;
            }
        }
    }
    true
}

enum FinalData {
    Witness(Witness),
    ScriptSig(ScriptBuf),
}

fn compute_final(psbt: &Psbt, index: usize) -> Option<FinalData> {
    let input = &psbt.inputs[index];
    if let Some(witness_utxo) = &input.witness_utxo {
        let script_pubkey = &witness_utxo.script_pubkey;
        if !script_pubkey.is_p2wpkh() {
            return None;
        }
        for (pubkey, signature) in &input.partial_sigs {
            let Ok(hash) = pubkey.wpubkey_hash() else {
                continue;
            };
            if ScriptBuf::new_p2wpkh(&hash) == *script_pubkey {
                let mut witness = Witness::new();
                witness.push(signature.serialize().to_vec());
                witness.push(pubkey.to_bytes());
                return Some(FinalData::Witness(witness));
            }
        }
        None
    } else if let Some(prev_tx) = &input.non_witness_utxo {
        let vout = psbt.unsigned_tx.input[index].previous_output.vout as usize;
        let script_pubkey = &prev_tx.output.get(vout)?.script_pubkey;
        if !script_pubkey.is_p2pkh() {
            return None;
        }
        for (pubkey, signature) in &input.partial_sigs {
            if ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) == *script_pubkey {
                let sig_push = PushBytesBuf::try_from(signature.serialize().to_vec()).ok()?;
                let pk_push = PushBytesBuf::try_from(pubkey.to_bytes()).ok()?;
                let script_sig = Builder::new()
                    .push_slice(sig_push)
                    .push_slice(pk_push)
                    .into_script();
                return Some(FinalData::ScriptSig(script_sig));
            }
        }
        None
    } else {
        None
    }
}

/// Lock final script data into every input. All-or-nothing: if any input
/// cannot be finalized the PSBT is left untouched and `false` is
/// returned, which callers treat as "needs more signatures".
pub(crate) fn finalize_inputs(psbt: &mut Psbt) -> bool {
    let mut finals: Vec<Option<FinalData>> = Vec::with_capacity(psbt.inputs.len());
    for index in 0..psbt.inputs.len() {
        if crate::psbt::is_finalized(&psbt.inputs[index]) {
            finals.push(None);
            continue;
        }
        match compute_final(psbt, index) {
            Some(data) => finals.push(Some(data)),
            None => return false,
        }
    }
    for (input, data) in psbt.inputs.iter_mut().zip(finals) {
        match data {
            Some(FinalData::Witness(witness)) => input.final_script_witness = Some(witness),
            Some(FinalData::ScriptSig(script_sig)) => input.final_script_sig = Some(script_sig),
            None => {}
        }
    }
    true
}

/// Sign a PSBT's inputs with one or more externally held WIF keys, then
/// validate and finalize if complete. Only inputs actually controlled by
/// a given key are signed with it.
pub fn sign_with_wif(mut psbt: Psbt, wifs: &[&str], params: &NetworkParams) -> Result<Psbt> {
    let secp = Secp256k1::new();
    for wif in wifs {
        let key =
            PrivateKey::from_wif(wif).map_err(|err| WalletError::Key(err.to_string()))?;
        if key.network != bitcoin::NetworkKind::from(params.network) {
            return Err(WalletError::Key(
                "WIF key encodes a different network".to_string(),
            ));
        }
        let pubkey = key.public_key(&secp);
        for index in 0..psbt.inputs.len() {
            if crate::psbt::is_finalized(&psbt.inputs[index]) {
                continue;
            }
            if !key_controls_input(&psbt, index, &pubkey) {
                continue;
            }
            sign_input_with_key(&mut psbt, index, &key.inner, &secp)?;
        }
    }
    if validate_signatures(&psbt, &secp) {
        finalize_inputs(&mut psbt);
    }
    Ok(psbt)
}

fn key_controls_input(psbt: &Psbt, index: usize, pubkey: &bitcoin::PublicKey) -> bool {
    let input = &psbt.inputs[index];
    if let Some(witness_utxo) = &input.witness_utxo {
        match pubkey.wpubkey_hash() {
            Ok(hash) => ScriptBuf::new_p2wpkh(&hash) == witness_utxo.script_pubkey,
            Err(_) => false,
        }
    } else if let Some(prev_tx) = &input.non_witness_utxo {
        let vout = psbt.unsigned_tx.input[index].previous_output.vout as usize;
        prev_tx
            .output
            .get(vout)
            .map_or(false, |out| {
                ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) == out.script_pubkey
            })
    } else {
        false
    }
}

/// Convert an HD path string into the hardened-flag integer form used by
/// hardware devices (e.g. "m/84'/1'/0'/0/5" -> [84|H, 1|H, 0|H, 0, 5]).
pub fn path_to_address_n(path: &str) -> Result<Vec<u32>> {
    let parsed = bitcoin::bip32::DerivationPath::from_str(path)?;
    Ok(parsed
        .as_ref()
        .iter()
        .map(|child| match child {
            ChildNumber::Hardened { index } => index | 0x8000_0000,
            ChildNumber::Normal { index } => *index,
        })
        .collect())
}
