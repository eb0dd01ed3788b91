use core::str::FromStr;

use async_trait::async_trait;
use bitcoin::{Amount, Txid};
use miniscript::bitcoin;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{transport_error, BusinessError, ChainAddress, ChainDataProvider, ProviderError};
use crate::{FeeRate, ProviderFeeData, UnspentOutput};

/// BlockBook instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockbookConfig {
    /// Base URL, without the `/api/v2` suffix.
    pub base_url: String,
    /// API key sent in the `api-key` header.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Confirmation targets (in blocks) queried for the fee tiers.
    #[serde(default = "default_fee_targets")]
    pub fee_targets: Vec<u16>,
}

fn default_fee_targets() -> Vec<u16> {
    vec![12, 6, 2]
}

impl BlockbookConfig {
    /// Config for `base_url` with default fee targets.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            fee_targets: default_fee_targets(),
        }
    }
}

/// BlockBook REST API (`/api/v2`).
#[derive(Debug, Clone)]
pub struct BlockbookProvider {
    config: BlockbookConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Utxo {
    txid: String,
    vout: u32,
    value: String,
    #[serde(default)]
    confirmations: u32,
}

#[derive(Debug, Deserialize)]
struct EstimateFee {
    result: String,
}

#[derive(Debug, Deserialize)]
struct SendTx {
    result: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressInfo {
    #[serde(default)]
    txs: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorMessage,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorMessage {
    Text(String),
    Object { message: String },
}

impl BlockbookProvider {
    /// New
    pub fn new(config: BlockbookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(ref key) = self.config.api_key {
            if let Ok(val) = HeaderValue::from_str(key) {
                headers.insert("api-key", val);
            }
        }
        headers
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(self.url(path))
            .headers(self.headers())
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ProviderError> {
    let status = resp.status();
    let body = resp.text().await.map_err(transport_error)?;
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
    {
        return Err(ProviderError::Status(status.as_u16()));
    }
    if !status.is_success() {
        let message = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody {
                error: ErrorMessage::Text(m) | ErrorMessage::Object { message: m },
            }) => m,
            Err(_) => body,
        };
        let err = if status == StatusCode::NOT_FOUND {
            BusinessError::AccountNotFound
        } else {
            BusinessError::Rejected(message)
        };
        return Err(err.into());
    }
    serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))
}

fn parse_txid(s: &str) -> Result<Txid, ProviderError> {
    Txid::from_str(s).map_err(|e| ProviderError::Malformed(format!("txid {s}: {e}")))
}

#[async_trait]
impl ChainDataProvider for BlockbookProvider {
    fn name(&self) -> &str {
        &self.config.base_url
    }

    async fn unspent_outputs(
        &self,
        address: &ChainAddress,
    ) -> Result<Vec<UnspentOutput>, ProviderError> {
        let utxos: Vec<Utxo> = self.get(&format!("utxo/{}", address.address)).await?;
        utxos
            .into_iter()
            .map(|utxo| {
                let value = utxo.value.parse::<u64>().map_err(|e| {
                    ProviderError::Malformed(format!("value {}: {e}", utxo.value))
                })?;
                Ok(UnspentOutput::new(
                    parse_txid(&utxo.txid)?,
                    utxo.vout,
                    Amount::from_sat(value),
                    address.script_pubkey.clone(),
                )
                .with_confirmations(utxo.confirmations))
            })
            .collect()
    }

    async fn fee_data(&self) -> Result<ProviderFeeData, ProviderError> {
        let mut rates = Vec::with_capacity(self.config.fee_targets.len());
        for target in &self.config.fee_targets {
            let fee: EstimateFee = self.get(&format!("estimatefee/{target}")).await?;
            // coins per kB; -1 when the node has no estimate
            match Decimal::from_str(&fee.result).map(FeeRate::from_coin_per_kvb) {
                Ok(Ok(rate)) if !rate.to_sat_per_vb().is_zero() => {
                    rates.push(rate.to_sat_per_vb())
                }
                _ => log::debug!("no fee estimate for {target} blocks: {}", fee.result),
            }
        }
        if rates.is_empty() {
            return Err(ProviderError::Malformed("no usable fee estimate".into()));
        }
        Ok(ProviderFeeData::Rates(rates))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ProviderError> {
        let resp = self
            .client
            .post(self.url("sendtx/"))
            .headers(self.headers())
            .header(CONTENT_TYPE, "text/plain")
            .body(raw_tx_hex.to_owned())
            .send()
            .await
            .map_err(transport_error)?;
        let sent: SendTx = decode(resp).await.map_err(|e| match e {
            // 404 from sendtx is a rejection
            ProviderError::Business(BusinessError::AccountNotFound) => {
                BusinessError::Rejected("not found".into()).into()
            }
            e => e,
        })?;
        parse_txid(&sent.result)
    }

    async fn confirmed_transaction_count(
        &self,
        address: &ChainAddress,
    ) -> Result<u64, ProviderError> {
        let info: AddressInfo = self
            .get(&format!("address/{}?details=basic", address.address))
            .await?;
        Ok(info.txs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::ScriptBuf;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TXID: &str = "2b6a4d4ae0b1bfb5b6f8d8e8c8c8f1d2e3a4b5c6d7e8f90a1b2c3d4e5f6a7b8c";

    fn address() -> ChainAddress {
        ChainAddress::new(
            "bc1qxyz",
            ScriptBuf::from_hex("00143f027073e6f341c481f55b7baae81dda5e6a9fba").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_unspent_outputs() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/utxo/bc1qxyz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "txid": TXID, "vout": 1, "value": "50000", "confirmations": 3 },
                { "txid": TXID, "vout": 0, "value": "1200", "confirmations": 0 }
            ])))
            .mount(&server)
            .await;

        let provider = BlockbookProvider::new(BlockbookConfig::new(server.uri()));
        let utxos = provider.unspent_outputs(&address()).await?;
        assert_eq!(utxos.len(), 2);
        assert_eq!(utxos[0].amount, Amount::from_sat(50_000));
        assert_eq!(utxos[0].transaction_hash(), TXID);
        assert_eq!(utxos[0].script_pubkey, address().script_pubkey);
        assert!(!utxos[1].is_confirmed());
        Ok(())
    }

    #[tokio::test]
    async fn test_fee_data_skips_missing_estimates() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        for (target, result) in [(12, "0.00010"), (6, "-1"), (2, "0.00025")] {
            Mock::given(method("GET"))
                .and(path(format!("/api/v2/estimatefee/{target}")))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "result": result })),
                )
                .mount(&server)
                .await;
        }
        let provider = BlockbookProvider::new(BlockbookConfig::new(server.uri()));
        match provider.fee_data().await? {
            ProviderFeeData::Rates(rates) => {
                assert_eq!(rates, vec![Decimal::from(10), Decimal::from(25)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/sendtx/"))
            .and(body_string("0200"))
            .and(header("api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": TXID
            })))
            .mount(&server)
            .await;
        let mut config = BlockbookConfig::new(server.uri());
        config.api_key = Some("secret".into());
        let txid = BlockbookProvider::new(config).broadcast("0200").await?;
        assert_eq!(txid.to_string(), TXID);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/sendtx/"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "min relay fee not met"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/utxo/bc1qxyz"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/address/bc1qxyz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let provider = BlockbookProvider::new(BlockbookConfig::new(server.uri()));
        let err = provider.broadcast("00").await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Business(BusinessError::Rejected("min relay fee not met".into()))
        );

        let err = provider.unspent_outputs(&address()).await.unwrap_err();
        assert_eq!(err, ProviderError::Status(503));

        let err = provider
            .confirmed_transaction_count(&address())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_rejected_credentials_rotate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/utxo/bc1qxyz"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid api key"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/sendtx/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let provider = BlockbookProvider::new(BlockbookConfig::new(server.uri()));
        let err = provider.unspent_outputs(&address()).await.unwrap_err();
        assert_eq!(err, ProviderError::Status(401));
        let err = provider.broadcast("00").await.unwrap_err();
        assert_eq!(err, ProviderError::Status(403));
    }
}
