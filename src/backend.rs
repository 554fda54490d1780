//! Blockbook-style backend HTTP client
//!
//! This module handles:
//! - Fetching UTXOs and account/XPUB information
//! - Fetching raw transactions for legacy input signing
//! - Broadcasting raw transactions
//! - Fee estimation, asset lookups and SPV proof retrieval
//!
//! Every union-shaped response (success or error object) is converted
//! into a tagged Rust type at this boundary; callers never inspect loose
//! JSON.

use async_trait::async_trait;
use bitcoin::Txid;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;

use crate::error::{Result, WalletError};
use crate::psbt::PrevTxSource;
use crate::utxo::{RawAssetRecord, RawUtxoResponse, RawUtxoSet};

/// Backend client configuration
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Base URL of the backend (e.g., https://blockbook.example.com)
    pub url: String,
    /// Connection timeout in seconds
    pub timeout: u64,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: 30,
        }
    }
}

/// Address-usage token reported for an XPUB, used to seed the signer's
/// change/receiving indices.
#[derive(Debug, Clone, Deserialize)]
pub struct XpubToken {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "transfers_from_wire")]
    pub transfers: u64,
}

/// Account details for an address or XPUB.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub balance: Option<String>,
    #[serde(rename = "txs", default)]
    pub tx_count: u64,
    #[serde(default)]
    pub tokens: Option<Vec<XpubToken>>,
}

/// Result of handing a raw transaction to the backend for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastResult {
    /// Backend accepted the transaction and returned its txid
    Accepted { txid: String },
    /// Backend returned an explicit error object
    Rejected { message: String },
}

/// Provider identity and sync state.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInfo {
    #[serde(default)]
    pub coin: Option<String>,
    #[serde(rename = "bestHeight", default)]
    pub best_height: u64,
    #[serde(rename = "inSync", default)]
    pub in_sync: bool,
}

#[derive(Debug, Deserialize)]
struct RawTxWire {
    #[serde(default)]
    hex: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EstimateFeeWire {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderInfoWire {
    #[serde(default)]
    blockbook: Option<ProviderInfo>,
}

/// Backends report transfer counts as either numbers or decimal strings.
fn transfers_from_wire<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number.as_u64().unwrap_or(0),
        Value::String(text) => text.parse().unwrap_or(0),
        _ => 0,
    })
}

/// HTTP client for the backend block-explorer API.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    config: BackendConfig,
}

impl BackendClient {
    /// Create a new backend client with the configured timeout.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(WalletError::Http)?;
        Ok(Self { http, config })
    }

    /// Base URL with any trailing slash removed.
    pub fn url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.url(), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("GET {}", url);
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WalletError::Backend {
                message: format!("{} returned status {}", url, status),
            });
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| WalletError::UnrecognizedResponse { body })
    }

    /// Fetch UTXOs for an address or XPUB.
    pub async fn fetch_utxos(&self, address_or_xpub: &str) -> Result<RawUtxoSet> {
        let url = self.api(&format!("utxo/{}", address_or_xpub));
        let response: RawUtxoResponse = self.get_json(&url).await?;
        Ok(response.into_set())
    }

    /// Fetch address or XPUB details. `options` is a raw query string such
    /// as "tokens=used&details=tokens".
    pub async fn fetch_account(
        &self,
        address_or_xpub: &str,
        xpub: bool,
        options: Option<&str>,
    ) -> Result<AccountInfo> {
        let kind = if xpub { "xpub" } else { "address" };
        let mut url = self.api(&format!("{}/{}", kind, address_or_xpub));
        if let Some(options) = options {
            url.push('?');
            url.push_str(options);
        }
        self.get_json(&url).await
    }

    /// Fetch the used-address tokens for an XPUB account.
    pub async fn fetch_xpub_tokens(&self, xpub: &str) -> Result<Vec<XpubToken>> {
        let account = self
            .fetch_account(xpub, true, Some("tokens=used&details=tokens"))
            .await?;
        Ok(account.tokens.unwrap_or_default())
    }

    /// Fetch a transaction's full hex encoding. Required only when signing
    /// legacy (non-witness) inputs.
    pub async fn fetch_raw_tx(&self, txid: &str) -> Result<String> {
        let url = self.api(&format!("tx/{}", txid));
        let wire: RawTxWire = self.get_json(&url).await?;
        wire.hex.ok_or_else(|| WalletError::UnrecognizedResponse {
            body: format!("transaction {} response had no hex field", txid),
        })
    }

    /// Hand a raw transaction to the backend for network broadcast.
    pub async fn broadcast(&self, tx_hex: &str) -> Result<BroadcastResult> {
        let url = self.api("sendtx/");
        debug!("POST {}", url);
        let response = self
            .http
            .post(&url)
            .body(tx_hex.to_string())
            .send()
            .await?;
        let body = response.text().await?;
        let value: Value =
            serde_json::from_str(&body).map_err(|_| WalletError::UnrecognizedResponse {
                body: body.clone(),
            })?;
        if let Some(txid) = value.get("result").and_then(Value::as_str) {
            return Ok(BroadcastResult::Accepted {
                txid: txid.to_string(),
            });
        }
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown backend error")
                .to_string();
            return Ok(BroadcastResult::Rejected { message });
        }
        Err(WalletError::UnrecognizedResponse { body })
    }

    /// Estimate the fee in satoshis per kilobyte for confirmation within
    /// `blocks`. A non-positive backend answer falls back to the default
    /// minimum relay fee of 1000 sat/kB.
    pub async fn estimate_fee(&self, blocks: u32) -> Result<u64> {
        let url = self.api(&format!("estimatefee/{}", blocks));
        let wire: EstimateFeeWire = self.get_json(&url).await?;
        let fee = wire
            .result
            .as_deref()
            .and_then(|result| result.parse::<f64>().ok())
            .unwrap_or(0.0) as u64;
        Ok(if fee == 0 { 1000 } else { fee })
    }

    /// Fetch one asset's metadata record.
    pub async fn fetch_asset(&self, asset_guid: u64) -> Result<RawAssetRecord> {
        let url = self.api(&format!("asset/{}", asset_guid));
        self.get_json(&url).await
    }

    /// List asset metadata records matching a name filter.
    pub async fn list_assets(&self, filter: &str) -> Result<Vec<RawAssetRecord>> {
        let url = self.api(&format!("assets?filter={}", filter));
        self.get_json(&url).await
    }

    /// Fetch the SPV proof for a transaction. Proof generation lives on the
    /// backend; this merely retrieves it for cross-chain minting flows.
    pub async fn fetch_spv_proof(&self, txid: &str) -> Result<Value> {
        let url = self.api(&format!("getspvproof/{}", txid));
        self.get_json(&url).await
    }

    /// Fetch the provider's identity and sync state.
    pub async fn provider_info(&self) -> Result<ProviderInfo> {
        let url = format!("{}/api", self.url());
        let wire: ProviderInfoWire = self.get_json(&url).await?;
        wire.blockbook
            .ok_or_else(|| WalletError::UnrecognizedResponse {
                body: "provider info response had no blockbook section".to_string(),
            })
    }
}

#[async_trait]
impl PrevTxSource for BackendClient {
    async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>> {
        let hex_tx = self.fetch_raw_tx(&txid.to_string()).await?;
        hex::decode(&hex_tx).map_err(|err| WalletError::Encoding(err.to_string()))
    }
}
