//! Seed-backed signer
//!
//! Holds a BIP39 mnemonic locally and signs with keys derived through the
//! hierarchical deterministic path attached to each input. Account state
//! is persisted encrypted after every account derivation and restored by
//! password on construction; a failed restore provisions a fresh account
//! instead of erroring.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{
    finalize_inputs, next_branch_address, sign_input_with_key, validate_signatures,
    AccountTracker, Signer,
};
use crate::backend::{BackendClient, XpubToken};
use crate::error::{Result, WalletError};
use crate::network::NetworkParams;
use crate::psbt::{input_address, input_hd_path, is_finalized};
use crate::storage::{load_encrypted, store_encrypted, KeyValueStore};

/// Persisted, encrypted seed signer state.
#[derive(Serialize, Deserialize)]
struct SeedRecord {
    mnemonic: String,
    num_accounts: usize,
}

/// Signer deriving keys from a locally held mnemonic seed.
pub struct SeedSigner {
    mnemonic: Mnemonic,
    password: String,
    tracker: AccountTracker,
    backend: Option<BackendClient>,
    storage: Arc<dyn KeyValueStore>,
    secp: Secp256k1<All>,
}

impl SeedSigner {
    /// Construct a signer from a mnemonic. When a password is given, a
    /// previously persisted record for this network is restored; otherwise
    /// (or when restore fails) a fresh first account is derived and backed
    /// up.
    pub fn new(
        mnemonic: &str,
        password: &str,
        params: NetworkParams,
        backend: Option<BackendClient>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let mnemonic = Mnemonic::parse_normalized(mnemonic)
            .map_err(|err| WalletError::Mnemonic(err.to_string()))?;
        let mut signer = Self {
            mnemonic,
            password: password.to_string(),
            tracker: AccountTracker::new(params),
            backend,
            storage,
            secp: Secp256k1::new(),
        };
        let restored = if password.is_empty() {
            false
        } else {
            match signer.restore(password) {
                Ok(restored) => restored,
                Err(err) => {
                    warn!("restore failed, provisioning a fresh account: {}", err);
                    false
                }
            }
        };
        if !restored {
            signer.create_account()?;
        }
        Ok(signer)
    }

    fn storage_key(&self) -> String {
        format!("{}_seedsigner", self.tracker.params().bech32_prefix)
    }

    fn root(&self) -> Result<Xpriv> {
        Xpriv::new_master(self.tracker.params().network, &self.mnemonic.to_seed(""))
            .map_err(WalletError::Bip32)
    }

    /// Account and index bookkeeping, shared with callers that need the
    /// current indices or want to derive specific addresses.
    pub fn tracker(&self) -> &AccountTracker {
        &self.tracker
    }

    /// Select an already-derived account.
    pub fn set_account_index(&mut self, index: usize) -> Result<()> {
        self.tracker.set_account_index(index)
    }

    /// Derive the next account, select it and persist the new state.
    pub fn create_account(&mut self) -> Result<usize> {
        let root = self.root()?;
        let index = self.tracker.account_count();
        let path = DerivationPath::from_str(&self.tracker.account_path(index))?;
        let account = root.derive_priv(&self.secp, &path)?;
        let account_index = self.tracker.push_account(Xpub::from_priv(&self.secp, &account));
        self.backup()?;
        Ok(account_index)
    }

    /// Restore accounts from the encrypted record persisted under this
    /// network's key. Returns `Ok(false)` when no record exists or the
    /// password does not decrypt it; the caller then provisions afresh.
    pub fn restore(&mut self, password: &str) -> Result<bool> {
        let Some(record) =
            load_encrypted::<SeedRecord>(self.storage.as_ref(), &self.storage_key(), password)?
        else {
            return Ok(false);
        };
        // sanity checks
        if record.num_accounts == 0 || record.num_accounts > 1000 {
            return Ok(false);
        }
        self.mnemonic = Mnemonic::parse_normalized(&record.mnemonic)
            .map_err(|err| WalletError::Mnemonic(err.to_string()))?;
        self.tracker.clear_accounts();
        let root = self.root()?;
        for index in 0..record.num_accounts {
            let path = DerivationPath::from_str(&self.tracker.account_path(index))?;
            let account = root.derive_priv(&self.secp, &path)?;
            self.tracker.push_account(Xpub::from_priv(&self.secp, &account));
        }
        self.tracker.set_account_index(0)?;
        Ok(true)
    }

    /// Re-encrypt and persist the current state. Skipped when the signer
    /// was created without a password.
    pub fn backup(&self) -> Result<()> {
        if self.password.is_empty() {
            return Ok(());
        }
        let record = SeedRecord {
            mnemonic: self.mnemonic.to_string(),
            num_accounts: self.tracker.account_count(),
        };
        store_encrypted(
            self.storage.as_ref(),
            &self.storage_key(),
            &record,
            &self.password,
        )
    }

    fn derive_address_for_path(&self, path: &DerivationPath) -> Result<(bitcoin::secp256k1::PublicKey, String)> {
        let root = self.root()?;
        let child = root.derive_priv(&self.secp, path)?;
        let pubkey = bitcoin::secp256k1::PublicKey::from_secret_key(&self.secp, &child.private_key);
        let address = Address::p2wpkh(
            &CompressedPublicKey(pubkey),
            self.tracker.params().network,
        );
        Ok((pubkey, address.to_string()))
    }
}

#[async_trait]
impl Signer for SeedSigner {
    async fn sign(&self, mut psbt: Psbt, path_override: Option<&str>) -> Result<Psbt> {
        let root = self.root()?;
        let fingerprint = root.fingerprint(&self.secp);

        // resolve each input's HD path: the explicit override wins, else
        // the side-channel path entry when its address entry matches the
        // key actually derived from that path
        for index in 0..psbt.inputs.len() {
            let side_path = input_hd_path(&psbt.inputs[index]);
            let side_address = input_address(&psbt.inputs[index]);
            let needs_derivation = psbt.inputs[index].bip32_derivation.is_empty();
            let resolved = match (path_override, side_path) {
                (Some(path), _) => Some(path.to_string()),
                (None, Some(path)) if needs_derivation => Some(path),
                _ => None,
            };
            let Some(resolved) = resolved else { continue };
            let path = DerivationPath::from_str(&resolved)?;
            let (pubkey, derived_address) = self.derive_address_for_path(&path)?;
            if path_override.is_some() || side_address.as_deref() == Some(derived_address.as_str())
            {
                psbt.inputs[index]
                    .bip32_derivation
                    .insert(pubkey, (fingerprint, path));
            } else {
                debug!(
                    "input {} side-channel address does not match derived key, skipping",
                    index
                );
            }
        }

        // sign every unsigned input for which we hold the derivation
        for index in 0..psbt.inputs.len() {
            if is_finalized(&psbt.inputs[index]) {
                continue;
            }
            let entries: Vec<DerivationPath> = psbt.inputs[index]
                .bip32_derivation
                .values()
                .filter(|source| source.0 == fingerprint)
                .map(|source| source.1.clone())
                .collect();
            for path in entries {
                let child = root.derive_priv(&self.secp, &path)?;
                sign_input_with_key(&mut psbt, index, &child.private_key, &self.secp)?;
            }
        }

        // finalize only a complete, valid signature set; anything else is
        // returned as-is and means "needs more signatures"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn new_signer(password: &str, storage: Arc<dyn KeyValueStore>) -> SeedSigner {
        SeedSigner::new(
            MNEMONIC,
            password,
            NetworkParams::regtest(),
            None,
            storage,
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_signer_derives_first_account() {
        let signer = new_signer("", Arc::new(MemoryStore::new()));
        assert_eq!(signer.tracker().account_count(), 1);
        assert!(signer.account_xpub().unwrap().starts_with("tpub"));
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut signer = new_signer("hunter2", storage.clone());
        signer.create_account().unwrap();
        assert_eq!(signer.tracker().account_count(), 2);
        let xpub = signer.account_xpub().unwrap();

        let restored = new_signer("hunter2", storage);
        assert_eq!(restored.tracker().account_count(), 2);
        // restore selects account 0 again
        assert_eq!(restored.tracker().account_index(), 0);
        restored
            .tracker
            .account_xpubs()
            .find(|account| account.to_string() == xpub)
            .expect("second account survives the roundtrip");
    }

    #[test]
    fn test_wrong_password_provisions_fresh_account() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut signer = new_signer("hunter2", storage.clone());
        signer.create_account().unwrap();

        let fresh = new_signer("wrong-password", storage);
        assert_eq!(fresh.tracker().account_count(), 1);
    }

    #[tokio::test]
    async fn test_address_derivation_advances_indices() {
        let mut signer = new_signer("", Arc::new(MemoryStore::new()));
        let first = signer.new_receiving_address(false).await.unwrap().unwrap();
        let change = signer.new_change_address(false).await.unwrap().unwrap();
        assert!(first.starts_with("bcrt1"));
        assert!(change.starts_with("bcrt1"));
        assert_ne!(first, change);
        assert_eq!(signer.tracker().receiving_index(), Some(0));
        assert_eq!(signer.tracker().change_index(), Some(0));
    }
}
