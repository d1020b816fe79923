//! HTTP verification providers.
//!
//! Each adapter owns its wire format and maps it into a `VerificationResult`, so the
//! coordinator never sees provider specific payloads.
use std::time;

use async_trait::async_trait;
use http::StatusCode;
use scanner_common::registry::VerificationResult;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ProviderError;
use crate::verify::VerificationProvider;

/// Wrapped SOL, the input side of every quote request.
pub const QUOTE_INPUT_MINT: &str = "So11111111111111111111111111111111111111112";
/// 0.01 SOL in lamports.
pub const QUOTE_AMOUNT: u64 = 10_000_000;

/// Join a path onto a configured base url, tolerating a trailing slash on the base.
fn endpoint(base: &str, path: &str) -> Result<reqwest::Url, ProviderError> {
    Ok(reqwest::Url::parse(&format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))?)
}

/// GET a JSON document. A 404 means the provider does not know the address and
/// yields `None`; every other non 2xx status is an error.
async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: reqwest::Url,
) -> Result<Option<T>, ProviderError> {
    let response = client.get(url).send().await?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(ProviderError::StatusError(status));
    }

    response
        .json()
        .await
        .map(Some)
        .map_err(|e| ProviderError::MalformedResponse(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    out_amount: Option<String>,
    #[serde(default)]
    route_plan: Vec<RoutePlanStep>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutePlanStep {
    swap_info: Option<SwapInfo>,
}

#[derive(Deserialize)]
struct SwapInfo {
    label: Option<String>,
}

/// Liquidity routing: an address is a tradable token when a swap route into it exists.
pub struct QuoteProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: time::Duration,
}

impl QuoteProvider {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: time::Duration) -> Self {
        Self {
            client,
            base_url: base_url.to_owned(),
            timeout,
        }
    }
}

#[async_trait]
impl VerificationProvider for QuoteProvider {
    fn name(&self) -> &str {
        "quote"
    }

    fn timeout(&self) -> time::Duration {
        self.timeout
    }

    async fn verify(&self, address: &str) -> Result<VerificationResult, ProviderError> {
        let mut url = endpoint(&self.base_url, "quote")?;
        url.query_pairs_mut()
            .append_pair("inputMint", QUOTE_INPUT_MINT)
            .append_pair("outputMint", address)
            .append_pair("amount", &QUOTE_AMOUNT.to_string());

        let quote: QuoteResponse = match get_json(&self.client, url).await? {
            Some(quote) => quote,
            None => return Ok(VerificationResult::rejected("no route")),
        };

        let routed = quote
            .out_amount
            .as_deref()
            .and_then(|amount| amount.parse::<u64>().ok())
            .map(|amount| amount > 0)
            .unwrap_or(false);

        if !routed {
            return Ok(VerificationResult::rejected("no route"));
        }

        let platform = quote
            .route_plan
            .into_iter()
            .find_map(|step| step.swap_info.and_then(|info| info.label));

        Ok(VerificationResult::confirmed(None, platform))
    }
}

#[derive(Deserialize)]
struct MarketResponse {
    pairs: Option<Vec<MarketPair>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketPair {
    dex_id: Option<String>,
    base_token: Option<MarketToken>,
}

#[derive(Deserialize)]
struct MarketToken {
    name: Option<String>,
}

/// Market data: an address is a token when at least one trading pair lists it.
pub struct MarketProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: time::Duration,
}

impl MarketProvider {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: time::Duration) -> Self {
        Self {
            client,
            base_url: base_url.to_owned(),
            timeout,
        }
    }
}

#[async_trait]
impl VerificationProvider for MarketProvider {
    fn name(&self) -> &str {
        "market"
    }

    fn timeout(&self) -> time::Duration {
        self.timeout
    }

    async fn verify(&self, address: &str) -> Result<VerificationResult, ProviderError> {
        let url = endpoint(&self.base_url, &format!("latest/dex/tokens/{}", address))?;

        let pair = get_json::<MarketResponse>(&self.client, url)
            .await?
            .and_then(|market| market.pairs)
            .and_then(|pairs| pairs.into_iter().next());

        match pair {
            Some(pair) => Ok(VerificationResult::confirmed(
                pair.base_token.and_then(|token| token.name),
                pair.dex_id,
            )),
            None => Ok(VerificationResult::rejected("no pairs")),
        }
    }
}

#[derive(Deserialize)]
struct CoinResponse {
    mint: Option<String>,
    name: Option<String>,
}

/// Launchpad registry: an address is a token when the launchpad has a coin record for it.
pub struct RegistryProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: time::Duration,
}

impl RegistryProvider {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: time::Duration) -> Self {
        Self {
            client,
            base_url: base_url.to_owned(),
            timeout,
        }
    }
}

#[async_trait]
impl VerificationProvider for RegistryProvider {
    fn name(&self) -> &str {
        "registry"
    }

    fn timeout(&self) -> time::Duration {
        self.timeout
    }

    async fn verify(&self, address: &str) -> Result<VerificationResult, ProviderError> {
        let url = endpoint(&self.base_url, &format!("coins/{}", address))?;

        match get_json::<CoinResponse>(&self.client, url).await? {
            Some(coin) if coin.mint.as_deref() == Some(address) => Ok(
                VerificationResult::confirmed(coin.name, Some("pump.fun".to_owned())),
            ),
            Some(_) => Ok(VerificationResult::rejected("mint mismatch")),
            None => Ok(VerificationResult::rejected("unknown coin")),
        }
    }
}
