//! UTXO sanitization
//!
//! This module normalizes heterogeneous backend UTXO/asset JSON into the
//! type-safe input representation the assembler consumes:
//! - Legacy vs segwit classification from the address's bech32 prefix
//! - Zero-confirmation filtering for asset-modifying transactions
//! - Asset allow-list filtering so notarized asset coins are never burned
//!   as fee inputs by accident
//! - Construction of the binary asset metadata map (notary address,
//!   zeroed signature placeholder, auxiliary fee payout address)
//!
//! Sanitization is a pure function over its inputs plus network
//! parameters; malformed entries are dropped silently (logged at debug).

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::Txid;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::asset::{
    address_from_key_hash, base_asset_id, AssetRecord, AuxFee, AuxFeeDetails, NotaryDetails,
    EMPTY_NOTARY_SIG,
};
use crate::error::Result;
use crate::network::NetworkParams;

/// One unspent output as reported by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUtxo {
    pub txid: String,
    pub vout: u32,
    /// Present for XPUB queries only; address queries inherit the owner
    #[serde(default)]
    pub address: Option<String>,
    /// HD path, present for XPUB queries only
    #[serde(default)]
    pub path: Option<String>,
    /// Amount in satoshis, decimal string
    pub value: String,
    #[serde(default)]
    pub asset_info: Option<RawAssetCoin>,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub locktime: Option<u32>,
}

/// Asset amount riding on a UTXO.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAssetCoin {
    pub asset_guid: String,
    pub value: String,
}

/// Notary descriptor as reported by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNotaryDetails {
    /// Base64-encoded endpoint URL
    #[serde(rename = "endPoint", default)]
    pub end_point: Option<String>,
    #[serde(rename = "instantTransfers", default)]
    pub instant_transfers: bool,
    #[serde(rename = "HDRequired", default)]
    pub hd_required: bool,
}

/// Auxiliary fee bracket on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAuxFee {
    #[serde(default)]
    pub bound: String,
    #[serde(default)]
    pub percent: u16,
}

/// Auxiliary fee descriptor as reported by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAuxFeeDetails {
    /// Base64-encoded key hash
    #[serde(rename = "auxFeeKeyID", default)]
    pub aux_fee_key_id: Option<String>,
    #[serde(rename = "auxFees", default)]
    pub aux_fees: Vec<RawAuxFee>,
}

/// One asset metadata record as reported by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAssetRecord {
    pub asset_guid: String,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub pub_data: Option<Value>,
    /// Base64-encoded notary public key hash
    #[serde(rename = "notaryKeyID", default)]
    pub notary_key_id: Option<String>,
    /// Base64-encoded signature, provided in tests only
    #[serde(rename = "notarySig", default)]
    pub notary_sig: Option<String>,
    #[serde(default)]
    pub notary_details: Option<RawNotaryDetails>,
    #[serde(default)]
    pub aux_fee_details: Option<RawAuxFeeDetails>,
    #[serde(default)]
    pub update_capability_flags: Option<u8>,
    #[serde(default)]
    pub max_supply: Option<String>,
    #[serde(default)]
    pub decimals: Option<u8>,
}

/// Backend UTXO responses come either as a bare array (address queries)
/// or as an object with a companion asset list (XPUB queries).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawUtxoResponse {
    Plain(Vec<RawUtxo>),
    WithAssets {
        #[serde(default)]
        utxos: Vec<RawUtxo>,
        #[serde(default)]
        assets: Vec<RawAssetRecord>,
    },
}

impl RawUtxoResponse {
    pub fn into_set(self) -> RawUtxoSet {
        match self {
            RawUtxoResponse::Plain(utxos) => RawUtxoSet {
                utxos,
                assets: Vec::new(),
            },
            RawUtxoResponse::WithAssets { utxos, assets } => RawUtxoSet { utxos, assets },
        }
    }
}

/// Normalized backend response before sanitization.
#[derive(Debug, Clone, Default)]
pub struct RawUtxoSet {
    pub utxos: Vec<RawUtxo>,
    pub assets: Vec<RawAssetRecord>,
}

/// Input encoding required to spend a UTXO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Requires the full previous transaction at signing time
    Legacy,
    /// Requires a witness commitment (script + value) at signing time
    Segwit,
}

/// Asset amount carried by a sanitized UTXO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetCoin {
    pub asset_guid: u64,
    pub value: u64,
}

/// A backend UTXO after classification and validation.
#[derive(Debug, Clone)]
pub struct SanitizedUtxo {
    pub kind: InputKind,
    pub txid: Txid,
    pub vout: u32,
    pub address: String,
    pub path: Option<String>,
    /// Amount in satoshis
    pub value: u64,
    pub asset: Option<AssetCoin>,
    pub locktime: Option<u32>,
}

/// Result of sanitization: spendable inputs plus the binary asset map.
/// Invariant: every asset-bearing UTXO's base asset id has an entry in
/// `assets`.
#[derive(Debug, Clone, Default)]
pub struct SanitizedUtxoSet {
    pub utxos: Vec<SanitizedUtxo>,
    pub assets: BTreeMap<u64, AssetRecord>,
}

impl SanitizedUtxoSet {
    /// Merge another sanitized set into this one (multi-source fetches).
    pub fn merge(&mut self, other: SanitizedUtxoSet) {
        self.utxos.extend(other.utxos);
        self.assets.extend(other.assets);
    }
}

/// Options steering sanitization.
#[derive(Debug, Clone, Default)]
pub struct SanitizeOptions {
    /// Whether planned transactions signal replace-by-fee
    pub rbf: bool,
    /// When set, asset-bearing UTXOs outside this list (and outside the
    /// destination asset map) are excluded from funding
    pub asset_allow_list: Option<BTreeSet<u64>>,
}

/// Normalize a backend UTXO response for use by the assembler.
///
/// `owner` is the address or XPUB the UTXOs were fetched for; address
/// queries do not echo the address per UTXO, so it is inherited from the
/// owner. `destination_assets` lists the asset guids the caller intends to
/// move, which exempts their coins from the allow-list check.
pub fn sanitize_utxos(
    owner: &str,
    raw: &RawUtxoSet,
    params: &NetworkParams,
    options: &SanitizeOptions,
    destination_assets: Option<&BTreeSet<u64>>,
    exclude_unconfirmed: bool,
) -> Result<SanitizedUtxoSet> {
    let mut sanitized = SanitizedUtxoSet::default();

    for record in &raw.assets {
        let Ok(asset_guid) = record.asset_guid.parse::<u64>() else {
            debug!("dropping asset record with unparsable guid {}", record.asset_guid);
            continue;
        };
        sanitized
            .assets
            .insert(asset_guid, sanitize_asset_record(record, params));
    }

    for utxo in &raw.utxos {
        let address = utxo
            .address
            .clone()
            .unwrap_or_else(|| owner.to_string());
        if exclude_unconfirmed && utxo.confirmations <= 0 {
            continue;
        }
        let Ok(txid) = Txid::from_str(&utxo.txid) else {
            debug!("dropping utxo with unparsable txid {}", utxo.txid);
            continue;
        };
        let Ok(value) = utxo.value.parse::<u64>() else {
            debug!("dropping utxo {}:{} with unparsable value", utxo.txid, utxo.vout);
            continue;
        };

        let kind = if params.is_segwit_address(&address) {
            InputKind::Segwit
        } else {
            InputKind::Legacy
        };

        let mut asset = None;
        if let Some(asset_info) = &utxo.asset_info {
            let Ok(asset_guid) = asset_info.asset_guid.parse::<u64>() else {
                debug!("dropping utxo {}:{} with unparsable asset guid", utxo.txid, utxo.vout);
                continue;
            };
            let Ok(asset_value) = asset_info.value.parse::<u64>() else {
                debug!("dropping utxo {}:{} with unparsable asset value", utxo.txid, utxo.vout);
                continue;
            };
            // every asset coin must be backed by a record in the asset map
            if !sanitized.assets.contains_key(&base_asset_id(asset_guid)) {
                debug!(
                    "dropping utxo {}:{}: asset {} missing from asset map",
                    utxo.txid, utxo.vout, asset_guid
                );
                continue;
            }
            // skip notarized-asset coins the sender is not intending to move
            let is_destination = destination_assets
                .map_or(false, |dest| dest.contains(&asset_guid));
            if !is_destination {
                if let Some(allow_list) = &options.asset_allow_list {
                    if !allow_list.contains(&asset_guid)
                        && !allow_list.contains(&base_asset_id(asset_guid))
                    {
                        debug!(
                            "skipping utxo {}:{}: asset {} not in allow list",
                            utxo.txid, utxo.vout, asset_guid
                        );
                        continue;
                    }
                }
            }
            asset = Some(AssetCoin {
                asset_guid,
                value: asset_value,
            });
        }

        sanitized.utxos.push(SanitizedUtxo {
            kind,
            txid,
            vout: utxo.vout,
            address,
            path: utxo.path.clone(),
            value,
            asset,
            locktime: utxo.locktime,
        });
    }

    Ok(sanitized)
}

fn sanitize_asset_record(record: &RawAssetRecord, params: &NetworkParams) -> AssetRecord {
    let contract = record
        .contract
        .as_deref()
        .map(|contract| contract.trim_start_matches("0x"))
        .and_then(|contract| hex::decode(contract).ok())
        .unwrap_or_default();

    let pub_data = record
        .pub_data
        .as_ref()
        .and_then(|value| serde_json::to_vec(value).ok())
        .unwrap_or_default();

    let notary_key_id = record
        .notary_key_id
        .as_deref()
        .and_then(|encoded| BASE64.decode(encoded).ok())
        .unwrap_or_default();
    let notary_address = if notary_key_id.is_empty() {
        None
    } else {
        address_from_key_hash(&notary_key_id, params.network)
    };
    // a notary-bound asset starts with the zeroed placeholder unless the
    // backend (unit tests) already supplied a signature
    let notary_sig = if notary_key_id.is_empty() {
        Vec::new()
    } else {
        record
            .notary_sig
            .as_deref()
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .unwrap_or_else(|| EMPTY_NOTARY_SIG.to_vec())
    };

    let notary_details = record.notary_details.as_ref().map(|details| NotaryDetails {
        endpoint: details
            .end_point
            .as_deref()
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default(),
        instant_transfers: details.instant_transfers,
        hd_required: details.hd_required,
    });

    let aux_fee_details = record.aux_fee_details.as_ref().map(|details| {
        let aux_fee_key_id = details
            .aux_fee_key_id
            .as_deref()
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .unwrap_or_default();
        let aux_fee_address = if aux_fee_key_id.is_empty() {
            None
        } else {
            address_from_key_hash(&aux_fee_key_id, params.network)
        };
        AuxFeeDetails {
            aux_fee_key_id,
            aux_fee_address,
            aux_fees: details
                .aux_fees
                .iter()
                .map(|fee| AuxFee {
                    bound: fee.bound.parse().unwrap_or_default(),
                    percent: fee.percent,
                })
                .collect(),
        }
    });

    AssetRecord {
        contract,
        pub_data,
        notary_key_id,
        notary_address,
        notary_sig,
        notary_details,
        aux_fee_details,
        update_capability_flags: record.update_capability_flags.unwrap_or_default(),
        max_supply: record
            .max_supply
            .as_deref()
            .and_then(|supply| supply.parse().ok())
            .unwrap_or_default(),
        precision: record.decimals.unwrap_or_default(),
    }
}
