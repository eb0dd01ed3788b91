use core::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Amount, Txid};
use miniscript::bitcoin;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    transport_error, BusinessError, ChainAddress, ChainDataProvider, ProviderError, RequestIds,
};
use crate::{FeeRate, ProviderFeeData, UnspentOutput};

/// Error codes of a node rejecting the request itself (bitcoind `RPC_*` codes).
const BUSINESS_CODES: &[i64] = &[
    -3,  // type error
    -5,  // invalid address or key
    -8,  // invalid parameter
    -22, // deserialization error
    -25, // verify error
    -26, // verify rejected
    -27, // already in chain
];

/// bitcoind-compatible JSON-RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Endpoint URL.
    pub url: String,
    /// Basic auth user.
    #[serde(default)]
    pub user: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Confirmation target of `estimatesmartfee`.
    #[serde(default = "default_conf_target")]
    pub conf_target: u16,
}

fn default_conf_target() -> u16 {
    6
}

impl RpcConfig {
    /// Config for `url` without credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
            conf_target: default_conf_target(),
        }
    }
}

/// Node JSON-RPC provider.
///
/// Unspent outputs come from `scantxoutset`, which only sees the confirmed UTXO set.
#[derive(Debug, Clone)]
pub struct RpcProvider {
    config: RpcConfig,
    client: reqwest::Client,
    ids: Arc<RequestIds>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ScanResult {
    success: bool,
    #[serde(default)]
    unspents: Vec<ScanUnspent>,
}

#[derive(Debug, Deserialize)]
struct ScanUnspent {
    txid: String,
    vout: u32,
    amount: serde_json::Number,
}

#[derive(Debug, Deserialize)]
struct SmartFee {
    feerate: Option<serde_json::Number>,
    #[serde(default)]
    errors: Vec<String>,
}

impl RpcProvider {
    /// New provider with its own request id sequence.
    pub fn new(config: RpcConfig) -> Self {
        Self::with_request_ids(config, Arc::new(RequestIds::new()))
    }

    /// New provider drawing request ids from `ids`.
    pub fn with_request_ids(config: RpcConfig, ids: Arc<RequestIds>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            ids,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ProviderError> {
        let id = self.ids.next_id();
        log::trace!("rpc {method} #{id}");
        let mut request = self.client.post(&self.config.url).json(&json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        }));
        if let Some(ref user) = self.config.user {
            request = request.basic_auth(user, self.config.password.as_ref());
        }
        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        // bitcoind reports RPC errors with HTTP 500 and a JSON body
        match serde_json::from_str::<RpcResponse<T>>(&body) {
            Ok(RpcResponse {
                error: Some(error), ..
            }) => Err(classify(error)),
            Ok(RpcResponse {
                result: Some(result),
                ..
            }) => Ok(result),
            Ok(_) => Err(ProviderError::Malformed(format!("{method}: empty result"))),
            Err(_) if !status.is_success() => Err(ProviderError::Status(status.as_u16())),
            Err(e) => Err(ProviderError::Malformed(format!("{method}: {e}"))),
        }
    }
}

fn classify(error: RpcError) -> ProviderError {
    if BUSINESS_CODES.contains(&error.code) {
        BusinessError::Rejected(error.message).into()
    } else {
        ProviderError::Node {
            code: error.code,
            message: error.message,
        }
    }
}

fn parse_decimal(n: &serde_json::Number) -> Result<Decimal, ProviderError> {
    let s = n.to_string();
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .map_err(|e| ProviderError::Malformed(format!("number {s}: {e}")))
}

#[async_trait]
impl ChainDataProvider for RpcProvider {
    fn name(&self) -> &str {
        &self.config.url
    }

    async fn unspent_outputs(
        &self,
        address: &ChainAddress,
    ) -> Result<Vec<UnspentOutput>, ProviderError> {
        let desc = format!("raw({})", address.script_pubkey.to_hex_string());
        let scan: ScanResult = self
            .call("scantxoutset", json!(["start", [{ "desc": desc }]]))
            .await?;
        if !scan.success {
            return Err(ProviderError::Malformed("scantxoutset aborted".into()));
        }
        scan.unspents
            .into_iter()
            .map(|utxo| {
                let sat = parse_decimal(&utxo.amount)?
                    .checked_mul(Decimal::from(100_000_000))
                    .and_then(|d| d.to_u64())
                    .ok_or_else(|| ProviderError::Malformed(format!("amount {}", utxo.amount)))?;
                let txid = Txid::from_str(&utxo.txid)
                    .map_err(|e| ProviderError::Malformed(format!("txid {}: {e}", utxo.txid)))?;
                Ok(UnspentOutput::new(
                    txid,
                    utxo.vout,
                    Amount::from_sat(sat),
                    address.script_pubkey.clone(),
                ))
            })
            .collect()
    }

    async fn fee_data(&self) -> Result<ProviderFeeData, ProviderError> {
        let fee: SmartFee = self
            .call("estimatesmartfee", json!([self.config.conf_target]))
            .await?;
        let Some(feerate) = fee.feerate else {
            return Err(ProviderError::Malformed(format!(
                "no fee estimate: {}",
                fee.errors.join("; ")
            )));
        };
        let rate = FeeRate::from_coin_per_kvb(parse_decimal(&feerate)?)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(ProviderFeeData::BaseRate(rate.to_sat_per_vb()))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ProviderError> {
        let txid: String = self
            .call("sendrawtransaction", json!([raw_tx_hex]))
            .await?;
        Txid::from_str(&txid).map_err(|e| ProviderError::Malformed(format!("txid {txid}: {e}")))
    }

    async fn confirmed_transaction_count(
        &self,
        _address: &ChainAddress,
    ) -> Result<u64, ProviderError> {
        Err(ProviderError::Unsupported("confirmed transaction count"))
    }
}
