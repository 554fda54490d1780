//! Send orchestration
//!
//! Runs the full pipeline for one transaction attempt: fetch and sanitize
//! UTXOs, assemble the PSBT, sign, detect and perform notarization
//! (splicing the notary signatures into a fresh copy of the pre-signed
//! transaction and re-signing), then hand the raw transaction to the
//! backend for broadcast. Every step either completes or returns the best
//! available partial PSBT; nothing is silently discarded.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::consensus::encode::serialize;
use bitcoin::psbt::Psbt;
use bitcoin::ScriptBuf;
use futures::future::join_all;
use log::{debug, info};

use crate::asset::{allocations_from_tx, Allocation, NotaryAsset};
use crate::backend::{BackendClient, BroadcastResult};
use crate::error::{Result, WalletError};
use crate::network::NetworkParams;
use crate::notary::{assets_requiring_notarization, splice_signatures, NotaryClient};
use crate::psbt::{
    copy_with_modified_output, extract_transaction, Assembler, CoinSelection, ExtractError,
    UnavailablePrevTxs, DEFAULT_MAXIMUM_FEE_RATE,
};
use crate::signer::Signer;
use crate::utxo::{sanitize_utxos, InputKind, SanitizeOptions, SanitizedUtxoSet};

/// Terminal state of one send attempt.
#[derive(Debug)]
pub enum SendOutcome {
    /// Fully signed, notarized where required, and accepted by the backend
    Broadcast { psbt: Psbt, txid: String },
    /// Fully signed but not broadcast (no backend configured, or the
    /// notarization step declined without error)
    Signed { psbt: Psbt },
    /// The signature set is incomplete; hand the PSBT to the next signer
    Incomplete { psbt: Psbt },
}

impl SendOutcome {
    /// The PSBT in whatever state the attempt reached.
    pub fn into_psbt(self) -> Psbt {
        match self {
            SendOutcome::Broadcast { psbt, .. }
            | SendOutcome::Signed { psbt }
            | SendOutcome::Incomplete { psbt } => psbt,
        }
    }
}

/// End-to-end coordinator: assembly, signing, notarization, broadcast.
pub struct SendCoordinator {
    params: NetworkParams,
    backend: Option<BackendClient>,
    notary: NotaryClient,
    maximum_fee_rate: i64,
}

impl SendCoordinator {
    pub fn new(params: NetworkParams, backend: Option<BackendClient>) -> Result<Self> {
        Ok(Self {
            params,
            backend,
            notary: NotaryClient::new(30)?,
            maximum_fee_rate: DEFAULT_MAXIMUM_FEE_RATE,
        })
    }

    /// Raise or lower the extraction fee-rate ceiling.
    pub fn with_maximum_fee_rate(mut self, maximum_fee_rate: i64) -> Self {
        self.maximum_fee_rate = maximum_fee_rate;
        self
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn backend(&self) -> Option<&BackendClient> {
        self.backend.as_ref()
    }

    /// Fetch UTXOs for every source address or XPUB in parallel, join,
    /// and sanitize into one merged set.
    pub async fn fetch_and_sanitize_utxos(
        &self,
        sources: &[String],
        options: &SanitizeOptions,
        destination_assets: Option<&BTreeSet<u64>>,
        exclude_unconfirmed: bool,
    ) -> Result<SanitizedUtxoSet> {
        let backend = self.backend.as_ref().ok_or_else(|| WalletError::Backend {
            message: "no backend configured for UTXO fetching".to_string(),
        })?;
        let fetches = sources.iter().map(|source| backend.fetch_utxos(source));
        let responses = join_all(fetches).await;

        let mut merged = SanitizedUtxoSet::default();
        for (source, response) in sources.iter().zip(responses) {
            let raw = response?;
            merged.merge(sanitize_utxos(
                source,
                &raw,
                &self.params,
                options,
                destination_assets,
                exclude_unconfirmed,
            )?);
        }
        Ok(merged)
    }

    /// Assemble a PSBT from a coin-selection plan. Legacy inputs need the
    /// backend to supply previous transactions.
    pub async fn assemble(
        &self,
        plan: &CoinSelection,
        redeem_or_witness_script: Option<&ScriptBuf>,
    ) -> Result<Psbt> {
        match &self.backend {
            Some(backend) => {
                Assembler::new(backend, &self.params)
                    .assemble(plan, redeem_or_witness_script)
                    .await
            }
            None => {
                if plan.inputs.iter().any(|utxo| utxo.kind == InputKind::Legacy) {
                    return Err(WalletError::Backend {
                        message: "legacy inputs require a configured backend".to_string(),
                    });
                }
                Assembler::new(&UnavailablePrevTxs, &self.params)
                    .assemble(plan, redeem_or_witness_script)
                    .await
            }
        }
    }

    /// Assemble a PSBT and derive the notary assets it will require, from
    /// the sanitized asset map the plan was funded with.
    pub async fn assemble_with_assets(
        &self,
        plan: &CoinSelection,
        sanitized: &SanitizedUtxoSet,
        redeem_or_witness_script: Option<&ScriptBuf>,
    ) -> Result<(Psbt, BTreeMap<u64, NotaryAsset>)> {
        let psbt = self.assemble(plan, redeem_or_witness_script).await?;
        let assets = assets_requiring_notarization(&psbt, &sanitized.assets);
        Ok((psbt, assets))
    }

    /// Sign, notarize if required, and broadcast one transaction attempt.
    ///
    /// A clone of the unsigned PSBT is taken before signing; the
    /// notarization splice always restarts from that clone so a failed
    /// re-sign can never corrupt the original candidate.
    pub async fn sign_and_send<S: Signer + ?Sized>(
        &self,
        psbt_in: Psbt,
        mut notary_assets: BTreeMap<u64, NotaryAsset>,
        signer: &mut S,
        path_override: Option<&str>,
    ) -> Result<SendOutcome> {
        let pre_sign = psbt_in.clone();
        let mut psbt = signer.sign(psbt_in, path_override).await?;

        let mut tx = match extract_transaction(&psbt, self.maximum_fee_rate, false) {
            Ok(tx) => tx,
            Err(ExtractError::NotFinalized) => {
                debug!("transaction incomplete, requires more signatures");
                return Ok(SendOutcome::Incomplete { psbt });
            }
            Err(other) => return Err(other.into()),
        };

        if !notary_assets.is_empty() {
            let allocations = allocations_from_tx(&tx)?;
            if allocations.iter().any(Allocation::awaits_notarization) {
                let tx_hex = hex::encode(serialize(&tx));
                let done = self
                    .notary
                    .gather_signatures(&mut notary_assets, &tx_hex)
                    .await?;
                if !done {
                    return Ok(SendOutcome::Signed { psbt });
                }
                match splice_signatures(tx.version.0, &notary_assets, &tx.output)? {
                    Some((output_index, script)) => {
                        let respliced = copy_with_modified_output(&pre_sign, output_index, script)?;
                        psbt = signer.sign(respliced, path_override).await?;
                        tx = match extract_transaction(&psbt, self.maximum_fee_rate, false) {
                            Ok(tx) => tx,
                            Err(ExtractError::NotFinalized) => {
                                debug!("re-signed transaction incomplete, requires more signatures");
                                return Ok(SendOutcome::Incomplete { psbt });
                            }
                            Err(other) => return Err(other.into()),
                        };
                    }
                    None => return Ok(SendOutcome::Signed { psbt }),
                }
            }
        }

        let Some(backend) = &self.backend else {
            return Ok(SendOutcome::Signed { psbt });
        };
        let tx_hex = hex::encode(serialize(&tx));
        match backend.broadcast(&tx_hex).await? {
            BroadcastResult::Accepted { txid } => {
                info!("tx successfully sent, txid {}", txid);
                // refresh the signer's address indices from the new state
                if let Ok(xpub) = signer.account_xpub() {
                    match backend.fetch_xpub_tokens(&xpub).await {
                        Ok(tokens) => signer.apply_xpub_tokens(&tokens),
                        Err(err) => debug!("index refresh after broadcast failed: {}", err),
                    }
                }
                Ok(SendOutcome::Broadcast { psbt, txid })
            }
            BroadcastResult::Rejected { message } => {
                Err(WalletError::BroadcastRejected { message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{
        allocation_script, Allocation, AllocationOutput, EMPTY_NOTARY_SIG,
        TX_VERSION_ALLOCATION_SEND, TX_VERSION_STANDARD,
    };
    use crate::notary::TEST_ENDPOINT_SENTINEL;
    use crate::psbt::PlannedOutput;
    use crate::signer::seed::SeedSigner;
    use crate::storage::MemoryStore;
    use crate::utxo::SanitizedUtxo;
    use bitcoin::Txid;
    use std::str::FromStr;
    use std::sync::Arc;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const TXID: &str = "d1a92b9a7a1f1a60dfae0b0b9f2e90af25c1c2d0a4a8fbdd1e5c9c1f9f0b1a2c";

    fn seed_signer() -> SeedSigner {
        SeedSigner::new(
            MNEMONIC,
            "",
            NetworkParams::regtest(),
            None,
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn coordinator() -> SendCoordinator {
        SendCoordinator::new(NetworkParams::regtest(), None).unwrap()
    }

    fn funding_input(signer: &SeedSigner, value: u64) -> SanitizedUtxo {
        let address = signer.tracker().derive_address(0, false).unwrap();
        SanitizedUtxo {
            kind: InputKind::Segwit,
            txid: Txid::from_str(TXID).unwrap(),
            vout: 0,
            address: address.to_string(),
            path: Some(signer.tracker().hd_path(0, false)),
            value,
            asset: None,
            locktime: None,
        }
    }

    #[tokio::test]
    async fn test_sign_and_send_without_backend_returns_signed() {
        let mut signer = seed_signer();
        let coordinator = coordinator();
        let plan = CoinSelection {
            version: TX_VERSION_STANDARD,
            rbf: false,
            inputs: vec![funding_input(&signer, 50_000)],
            outputs: vec![PlannedOutput {
                address: Some(
                    signer
                        .tracker()
                        .derive_address(1, false)
                        .unwrap()
                        .to_string(),
                ),
                script: None,
                value: 49_000,
            }],
        };
        let psbt = coordinator.assemble(&plan, None).await.unwrap();
        let outcome = coordinator
            .sign_and_send(psbt, BTreeMap::new(), &mut signer, None)
            .await
            .unwrap();
        match outcome {
            SendOutcome::Signed { psbt } => {
                extract_transaction(&psbt, DEFAULT_MAXIMUM_FEE_RATE, false).unwrap();
            }
            other => panic!("expected Signed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_inputs_return_incomplete() {
        let mut signer = seed_signer();
        let coordinator = coordinator();
        let mut input = funding_input(&signer, 50_000);
        // a foreign input the signer holds no key for
        input.path = None;
        input.address = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080".to_string();
        let plan = CoinSelection {
            version: TX_VERSION_STANDARD,
            rbf: false,
            inputs: vec![input],
            outputs: vec![PlannedOutput {
                address: Some(
                    signer
                        .tracker()
                        .derive_address(0, false)
                        .unwrap()
                        .to_string(),
                ),
                script: None,
                value: 49_000,
            }],
        };
        let psbt = coordinator.assemble(&plan, None).await.unwrap();
        let outcome = coordinator
            .sign_and_send(psbt, BTreeMap::new(), &mut signer, None)
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Incomplete { .. }));
    }

    #[tokio::test]
    async fn test_sentinel_notary_endpoint_stops_before_broadcast() {
        let mut signer = seed_signer();
        let coordinator = coordinator();
        let allocation = Allocation {
            asset_guid: 42,
            outputs: vec![AllocationOutput {
                output_index: 0,
                value: 10,
            }],
            notary_sig: Some(EMPTY_NOTARY_SIG.to_vec()),
        };
        let plan = CoinSelection {
            version: TX_VERSION_ALLOCATION_SEND,
            rbf: false,
            inputs: vec![funding_input(&signer, 50_000)],
            outputs: vec![
                PlannedOutput {
                    address: Some(
                        signer
                            .tracker()
                            .derive_address(1, false)
                            .unwrap()
                            .to_string(),
                    ),
                    script: None,
                    value: 49_000,
                },
                PlannedOutput {
                    address: None,
                    script: Some(allocation_script(&[allocation]).unwrap()),
                    value: 0,
                },
            ],
        };
        let psbt = coordinator.assemble(&plan, None).await.unwrap();
        let notary_assets = BTreeMap::from([(
            42u64,
            NotaryAsset {
                asset_guid: 42,
                endpoint: TEST_ENDPOINT_SENTINEL.to_string(),
                signature: EMPTY_NOTARY_SIG.to_vec(),
                notarized: false,
            },
        )]);
        let outcome = coordinator
            .sign_and_send(psbt, notary_assets, &mut signer, None)
            .await
            .unwrap();
        // signed but deliberately not notarized and not broadcast
        assert!(matches!(outcome, SendOutcome::Signed { .. }));
    }
}
