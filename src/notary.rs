//! Notarization coordination
//!
//! Certain assets register a third-party notary whose counter-signature
//! must be embedded in the allocation payload before broadcast. This
//! module detects which assets in a transaction still carry the zeroed
//! signature placeholder, fetches signatures from each asset's registered
//! endpoint, and produces the replacement allocation output to splice
//! into a fresh copy of the pre-signed transaction.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::psbt::Psbt;
use bitcoin::{ScriptBuf, TxOut};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::asset::{
    allocation_script, base_asset_id, decode_allocations, find_allocation_output,
    is_allocation_version, payload_from_script, AssetRecord, NotaryAsset, NOTARY_SIG_LEN,
};
use crate::error::{Result, WalletError};

/// Endpoint value reserved for integration tests: it deterministically
/// fails the notarization step without any network call.
pub const TEST_ENDPOINT_SENTINEL: &str = "https://test.invalid";

/// Successful notary answer: one signature per notarized asset.
#[derive(Debug, Deserialize)]
pub struct NotaryResponse {
    #[serde(default)]
    pub sigs: Option<Vec<NotarySignature>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotarySignature {
    /// Asset guid, decimal string
    pub asset: String,
    /// Base64 signature, must decode to exactly 65 bytes
    pub sig: String,
}

/// HTTP client for notary endpoints.
#[derive(Clone)]
pub struct NotaryClient {
    http: Client,
}

impl NotaryClient {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(WalletError::Http)?;
        Ok(Self { http })
    }

    /// POST the raw transaction hex to one notary endpoint.
    async fn fetch_notarization(&self, endpoint: &str, tx_hex: &str) -> Result<NotaryResponse> {
        debug!("requesting notarization from {}", endpoint);
        let response = self
            .http
            .post(endpoint)
            .json(&json!({ "tx": tx_hex }))
            .send()
            .await
            .map_err(|_| WalletError::NotaryUnreachable)?;
        response
            .json::<NotaryResponse>()
            .await
            .map_err(|_| WalletError::NotaryUnreachable)
    }

    /// Collect signatures for every asset still awaiting notarization.
    ///
    /// All-or-nothing: any unreachable endpoint, explicit error field or
    /// malformed answer fails the whole attempt. The test sentinel
    /// endpoint short-circuits to `Ok(false)` without a network call.
    /// Returns whether at least one signature was newly obtained.
    pub async fn gather_signatures(
        &self,
        assets: &mut BTreeMap<u64, NotaryAsset>,
        tx_hex: &str,
    ) -> Result<bool> {
        let pending: Vec<(u64, String)> = assets
            .iter()
            .filter(|(_, asset)| !asset.notarized)
            .map(|(guid, asset)| (*guid, asset.endpoint.clone()))
            .collect();

        let mut notarization_done = false;
        for (guid, endpoint) in pending {
            if endpoint.is_empty() {
                debug!("asset {} has no notary endpoint, skipping", guid);
                continue;
            }
            // an earlier endpoint's answer may have covered this asset
            if assets.get(&guid).map_or(false, |asset| asset.notarized) {
                continue;
            }
            if endpoint == TEST_ENDPOINT_SENTINEL {
                return Ok(false);
            }

            let response = self.fetch_notarization(&endpoint, tx_hex).await?;
            if let Some(error) = response.error {
                return Err(WalletError::NotaryDenied(error));
            }
            let Some(sigs) = response.sigs else {
                return Err(WalletError::NotaryDenied(
                    "response carried no signatures".to_string(),
                ));
            };
            for entry in sigs {
                let Ok(signed_guid) = entry.asset.parse::<u64>() else {
                    warn!("notary answered with unparsable asset id {}", entry.asset);
                    continue;
                };
                let Ok(signature) = BASE64.decode(&entry.sig) else {
                    warn!("notary signature for asset {} is not base64", signed_guid);
                    continue;
                };
                if signature.len() != NOTARY_SIG_LEN {
                    warn!(
                        "notary signature for asset {} has length {}, expected {}",
                        signed_guid,
                        signature.len(),
                        NOTARY_SIG_LEN
                    );
                    continue;
                }
                if let Some(asset) = assets.get_mut(&signed_guid) {
                    asset.signature = signature;
                    asset.notarized = true;
                    notarization_done = true;
                }
            }
        }
        Ok(notarization_done)
    }
}

/// Determine which assets used by this transaction require a notary
/// signature. Empty unless the transaction version is an allocation
/// version and some used asset registers a notary endpoint.
pub fn assets_requiring_notarization(
    psbt: &Psbt,
    assets: &BTreeMap<u64, AssetRecord>,
) -> BTreeMap<u64, NotaryAsset> {
    let mut required = BTreeMap::new();
    if assets.is_empty() || !is_allocation_version(psbt.unsigned_tx.version.0) {
        return required;
    }
    let allocations = match crate::asset::allocations_from_tx(&psbt.unsigned_tx) {
        Ok(allocations) => allocations,
        Err(err) => {
            warn!("could not decode allocations: {}", err);
            return required;
        }
    };
    for allocation in allocations {
        let base_id = base_asset_id(allocation.asset_guid);
        if required.contains_key(&base_id) {
            continue;
        }
        let Some(record) = assets.get(&base_id) else {
            warn!("asset {} not found in the UTXO assets map", base_id);
            continue;
        };
        if let Some(notary_asset) = NotaryAsset::from_record(base_id, record) {
            required.insert(base_id, notary_asset);
        }
    }
    required
}

/// Build the replacement allocation output embedding the collected notary
/// signatures. Returns the output index to modify and its new script, or
/// `None` when nothing in the transaction needed splicing.
pub fn splice_signatures(
    version: i32,
    assets: &BTreeMap<u64, NotaryAsset>,
    outputs: &[TxOut],
) -> Result<Option<(usize, ScriptBuf)>> {
    if !is_allocation_version(version) {
        return Ok(None);
    }
    let Some(index) = find_allocation_output(outputs) else {
        return Ok(None);
    };
    let payload = payload_from_script(&outputs[index].script_pubkey).ok_or_else(|| {
        WalletError::AllocationCodec("allocation output has no pushdata".to_string())
    })?;
    let mut allocations = decode_allocations(&payload)?;

    let mut changed = false;
    for allocation in &mut allocations {
        let base_id = base_asset_id(allocation.asset_guid);
        let Some(asset) = assets.get(&base_id) else {
            continue;
        };
        if asset.notarized && allocation.notary_sig.is_some() {
            allocation.notary_sig = Some(asset.signature.clone());
            changed = true;
        }
    }
    if !changed {
        return Ok(None);
    }
    Ok(Some((index, allocation_script(&allocations)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{
        Allocation, AllocationOutput, NotaryDetails, EMPTY_NOTARY_SIG, TX_VERSION_ALLOCATION_SEND,
        TX_VERSION_STANDARD,
    };
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Transaction, WPubkeyHash};

    fn allocation_tx(version: i32, allocations: &[Allocation]) -> Transaction {
        Transaction {
            version: Version(version),
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![
                TxOut {
                    value: Amount::from_sat(546),
                    script_pubkey: ScriptBuf::new_p2wpkh(
                        &WPubkeyHash::from_slice(&[0u8; 20]).unwrap(),
                    ),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: allocation_script(allocations).unwrap(),
                },
            ],
        }
    }

    fn pending_allocation(guid: u64) -> Allocation {
        Allocation {
            asset_guid: guid,
            outputs: vec![AllocationOutput {
                output_index: 0,
                value: 10,
            }],
            notary_sig: Some(EMPTY_NOTARY_SIG.to_vec()),
        }
    }

    fn notary_record() -> AssetRecord {
        AssetRecord {
            contract: vec![],
            pub_data: vec![],
            notary_key_id: vec![7u8; 20],
            notary_address: None,
            notary_sig: EMPTY_NOTARY_SIG.to_vec(),
            notary_details: Some(NotaryDetails {
                endpoint: "https://notary.example.com/sign".to_string(),
                instant_transfers: false,
                hd_required: false,
            }),
            aux_fee_details: None,
            update_capability_flags: 0,
            max_supply: 0,
            precision: 8,
        }
    }

    #[test]
    fn test_detection_requires_allocation_version() {
        let tx = allocation_tx(TX_VERSION_STANDARD, &[pending_allocation(42)]);
        let psbt = Psbt::from_unsigned_tx(tx).unwrap();
        let assets = BTreeMap::from([(42u64, notary_record())]);
        assert!(assets_requiring_notarization(&psbt, &assets).is_empty());

        let tx = allocation_tx(TX_VERSION_ALLOCATION_SEND, &[pending_allocation(42)]);
        let psbt = Psbt::from_unsigned_tx(tx).unwrap();
        let required = assets_requiring_notarization(&psbt, &assets);
        assert_eq!(required.len(), 1);
        assert_eq!(
            required.get(&42).unwrap().endpoint,
            "https://notary.example.com/sign"
        );
    }

    #[test]
    fn test_detection_skips_assets_without_endpoint() {
        let mut record = notary_record();
        record.notary_details = None;
        let assets = BTreeMap::from([(42u64, record)]);
        let tx = allocation_tx(TX_VERSION_ALLOCATION_SEND, &[pending_allocation(42)]);
        let psbt = Psbt::from_unsigned_tx(tx).unwrap();
        assert!(assets_requiring_notarization(&psbt, &assets).is_empty());
    }

    #[test]
    fn test_splice_replaces_only_the_allocation_output() {
        let allocations = [pending_allocation(42)];
        let tx = allocation_tx(TX_VERSION_ALLOCATION_SEND, &allocations);

        let signed = NotaryAsset {
            asset_guid: 42,
            endpoint: "https://notary.example.com/sign".to_string(),
            signature: vec![9u8; NOTARY_SIG_LEN],
            notarized: true,
        };
        let assets = BTreeMap::from([(42u64, signed)]);
        let (index, script) = splice_signatures(TX_VERSION_ALLOCATION_SEND, &assets, &tx.output)
            .unwrap()
            .unwrap();
        assert_eq!(index, 1);

        let spliced = decode_allocations(&payload_from_script(&script).unwrap()).unwrap();
        assert_eq!(spliced[0].notary_sig.as_deref(), Some(&[9u8; 65][..]));
        // non-signature fields survive the splice untouched
        assert_eq!(spliced[0].asset_guid, 42);
        assert_eq!(spliced[0].outputs, allocations[0].outputs);
    }

    #[test]
    fn test_splice_without_signatures_is_a_noop() {
        let tx = allocation_tx(TX_VERSION_ALLOCATION_SEND, &[pending_allocation(42)]);
        let unsigned = NotaryAsset {
            asset_guid: 42,
            endpoint: "https://notary.example.com/sign".to_string(),
            signature: EMPTY_NOTARY_SIG.to_vec(),
            notarized: false,
        };
        let assets = BTreeMap::from([(42u64, unsigned)]);
        assert!(
            splice_signatures(TX_VERSION_ALLOCATION_SEND, &assets, &tx.output)
                .unwrap()
                .is_none()
        );
        assert!(
            splice_signatures(TX_VERSION_STANDARD, &assets, &tx.output)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_sentinel_endpoint_short_circuits() {
        let client = NotaryClient::new(5).unwrap();
        let mut assets = BTreeMap::from([(
            42u64,
            NotaryAsset {
                asset_guid: 42,
                endpoint: TEST_ENDPOINT_SENTINEL.to_string(),
                signature: EMPTY_NOTARY_SIG.to_vec(),
                notarized: false,
            },
        )]);
        let done = client.gather_signatures(&mut assets, "00").await.unwrap();
        assert!(!done);
        assert!(!assets.get(&42).unwrap().notarized);
    }

    #[tokio::test]
    async fn test_already_notarized_assets_need_no_network() {
        let client = NotaryClient::new(5).unwrap();
        let mut assets = BTreeMap::from([(
            42u64,
            NotaryAsset {
                asset_guid: 42,
                // unreachable endpoint would fail if contacted
                endpoint: "http://127.0.0.1:1/sign".to_string(),
                signature: vec![9u8; NOTARY_SIG_LEN],
                notarized: true,
            },
        )]);
        let done = client.gather_signatures(&mut assets, "00").await.unwrap();
        assert!(!done);
    }
}
