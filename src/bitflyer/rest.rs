use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::Sha256;
use url::Url;

use super::types::{Balance, BitflyerApiErrorResponse, TickerMessage};
use crate::error::AppError;

/// Client for the bitFlyer Lightning REST API.
///
/// Private endpoints are signed with `HMAC-SHA256(secret, timestamp +
/// method + request path + body)`.
pub struct BitflyerRestClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    api_secret: String,
}

impl BitflyerRestClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        // Url::join drops the last path segment unless it ends with '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("invalid REST base url '{}'", base_url))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid endpoint '{}'", path))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Hex signature for one request. `request_uri` is path plus query,
    /// e.g. `/v1/me/getbalance`.
    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        request_uri: &str,
        body: &str,
    ) -> Result<String> {
        let message = format!("{}{}{}{}", timestamp, method, request_uri, body);
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid API secret: {}", e))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
        private: bool,
    ) -> Result<String> {
        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .header("Content-Type", "application/json");
        if private {
            let timestamp = chrono::Utc::now().timestamp().to_string();
            let request_uri = match url.query() {
                Some(q) => format!("{}?{}", url.path(), q),
                None => url.path().to_string(),
            };
            let signature = self.sign(
                &timestamp,
                method.as_str(),
                &request_uri,
                body.as_deref().unwrap_or(""),
            )?;
            req = req
                .header("ACCESS-KEY", &self.api_key)
                .header("ACCESS-TIMESTAMP", timestamp)
                .header("ACCESS-SIGN", signature);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url.path()))?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let msg = serde_json::from_str::<BitflyerApiErrorResponse>(&text)
                .map(|e| format!("{} ({})", e.error_message, e.status))
                .unwrap_or(text);
            return Err(AppError::BitflyerApi {
                status: status.as_u16(),
                msg,
            }
            .into());
        }
        Ok(text)
    }

    /// Public ticker snapshot for `product_code`.
    pub async fn get_ticker(&self, product_code: &str) -> Result<TickerMessage> {
        let url = self.endpoint("ticker", &[("product_code", product_code)])?;
        let body = self.send(Method::GET, url, None, false).await?;
        let ticker = serde_json::from_str(&body).map_err(AppError::from)?;
        Ok(ticker)
    }

    /// Account balances. Requires credentials.
    pub async fn get_balance(&self) -> Result<Vec<Balance>> {
        let url = self.endpoint("me/getbalance", &[])?;
        let body = self.send(Method::GET, url, None, true).await?;
        let balances: Vec<Balance> = serde_json::from_str(&body).map_err(AppError::from)?;
        tracing::debug!(count = balances.len(), "Fetched balances");
        Ok(balances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolves_under_versioned_base() {
        let client = BitflyerRestClient::new("https://api.bitflyer.com/v1", "k", "s").unwrap();
        let url = client
            .endpoint("ticker", &[("product_code", "BTC_JPY")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.bitflyer.com/v1/ticker?product_code=BTC_JPY"
        );
        let url = client.endpoint("me/getbalance", &[]).unwrap();
        assert_eq!(url.path(), "/v1/me/getbalance");
    }

    #[test]
    fn signature_is_hmac_sha256_hex_of_concatenated_parts() {
        let client =
            BitflyerRestClient::new("https://api.bitflyer.com/v1/", "key", "secret").unwrap();
        let sig = client
            .sign("1700000000", "GET", "/v1/me/getbalance", "")
            .unwrap();

        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(b"1700000000GET/v1/me/getbalance");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(sig, expected);
        assert_eq!(sig.len(), 64);
        let other = client
            .sign("1700000001", "GET", "/v1/me/getbalance", "")
            .unwrap();
        assert_ne!(sig, other);
    }
}
