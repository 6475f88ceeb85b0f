//! Authenticated exchange client for order submission.
//!
//! Wraps the read-only client with a per-user signing handle. Layer-1
//! authentication (the derived-credentials handshake) signs a typed
//! attestation with the user's key; layer-2 authentication signs each
//! request with HMAC-SHA256 over the derived secret.

use crate::api::clob::ClobClient;
use crate::signing::{OrderSigner, SignedOrder};
use crate::types::{OrderType, Side};
use crate::{Error, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Derived API credentials for layer-2 request signing.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("api_passphrase", &"[REDACTED]")
            .finish()
    }
}

/// Response from the derived-credentials handshake.
#[derive(Debug, Clone, Deserialize)]
struct DeriveCredsResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
    secret: String,
    passphrase: String,
}

/// Request body for posting an order.
#[derive(Debug, Clone, Serialize)]
struct PostOrderRequest {
    order: SignedOrder,
    #[serde(rename = "orderType")]
    order_type: OrderType,
    /// API key of the order owner.
    owner: String,
}

/// Response from posting an order.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderID")]
    pub order_id: String,
    /// "matched", "live", "delayed", "unmatched", ...
    pub status: String,
    /// Shares filled immediately, when the engine reports them.
    #[serde(rename = "makingAmount", alias = "filled", default)]
    pub filled_size: Option<Decimal>,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: Option<Decimal>,
}

impl OrderResponse {
    /// Whether the order was matched or accepted onto the book.
    pub fn is_accepted(&self) -> bool {
        let s = self.status.to_lowercase();
        s == "matched" || s == "live" || s == "delayed"
    }

    /// Whether an immediate order was explicitly not filled.
    pub fn is_unfilled(&self) -> bool {
        let s = self.status.to_lowercase();
        s == "unmatched" || s == "rejected"
    }
}

/// Open order information.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub asset_id: String,
    pub side: String,
    pub price: String,
    #[serde(rename = "original_size")]
    pub size: String,
    pub status: String,
}

/// Authenticated exchange client bound to one user's signing handle.
pub struct SignedClient {
    clob: Arc<ClobClient>,
    signer: OrderSigner,
    credentials: Option<ApiCredentials>,
    /// Per-instrument taker fee rates; they rarely change.
    fee_rate_cache: Mutex<HashMap<String, u64>>,
}

impl SignedClient {
    pub fn new(clob: Arc<ClobClient>, signer: OrderSigner) -> Self {
        Self {
            clob,
            signer,
            credentials: None,
            fee_rate_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Checksummed address of the signing key.
    pub fn address(&self) -> String {
        format!("{}", self.signer.address())
    }

    /// Funder address that custodies positions.
    pub fn funder(&self) -> String {
        format!("{}", self.signer.funder())
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Perform the derived-credentials handshake, replacing any credentials
    /// already held. Used at unlock and again when the session's
    /// credentials go stale mid-flight.
    pub async fn derive_credentials(&mut self) -> Result<()> {
        let timestamp = current_timestamp();
        let signature = self.signer.sign_auth_attestation(timestamp, 0).await?;

        let url = format!("{}/auth/derive-api-key", self.clob.clob_url());
        let response = self
            .clob
            .http
            .get(&url)
            .header("POLY_ADDRESS", self.address())
            .header("POLY_SIGNATURE", &signature)
            .header("POLY_TIMESTAMP", timestamp.to_string())
            .header("POLY_NONCE", "0")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_reject(status, &text, "derive credentials"));
        }

        let creds: DeriveCredsResponse = response.json().await?;
        self.credentials = Some(ApiCredentials {
            api_key: creds.api_key,
            api_secret: creds.secret,
            api_passphrase: creds.passphrase,
        });
        info!(address = %self.address(), "Derived exchange API credentials");
        Ok(())
    }

    /// Sign and submit an order in one step.
    pub async fn place_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        order_type: OrderType,
    ) -> Result<OrderResponse> {
        let fee_rate = self.fee_rate_bps(token_id).await.unwrap_or(0);
        let signed = self
            .signer
            .sign_order(token_id, side, price, size, fee_rate)
            .await?;
        self.post_order(signed, order_type).await
    }

    /// Submit a signed order to the matching engine.
    pub async fn post_order(
        &self,
        signed_order: SignedOrder,
        order_type: OrderType,
    ) -> Result<OrderResponse> {
        let credentials = self.require_credentials()?;

        let request = PostOrderRequest {
            order: signed_order,
            order_type,
            owner: credentials.api_key.clone(),
        };
        let body = serde_json::to_string(&request)?;
        let timestamp = current_timestamp().to_string();
        let signature = sign_l2_request(credentials, "POST", "/order", &timestamp, Some(&body))?;

        let url = format!("{}/order", self.clob.clob_url());
        let response = self
            .clob
            .http
            .post(&url)
            .header("POLY_ADDRESS", self.address())
            .header("POLY_SIGNATURE", signature)
            .header("POLY_TIMESTAMP", &timestamp)
            .header("POLY_API_KEY", &credentials.api_key)
            .header("POLY_PASSPHRASE", &credentials.api_passphrase)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_reject(status, &text, "post order"));
        }

        let result: OrderResponse = response.json().await?;
        info!(order_id = %result.order_id, status = %result.status, ?order_type, "Order posted");
        Ok(result)
    }

    /// Cancel an order by id.
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let credentials = self.require_credentials()?;
        let timestamp = current_timestamp().to_string();
        let path = format!("/order/{order_id}");
        let signature = sign_l2_request(credentials, "DELETE", &path, &timestamp, None)?;

        let url = format!("{}{}", self.clob.clob_url(), path);
        let response = self
            .clob
            .http
            .delete(&url)
            .header("POLY_ADDRESS", self.address())
            .header("POLY_SIGNATURE", signature)
            .header("POLY_TIMESTAMP", &timestamp)
            .header("POLY_API_KEY", &credentials.api_key)
            .header("POLY_PASSPHRASE", &credentials.api_passphrase)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            if status == 404 {
                return Err(Error::OrderNotFound(order_id.to_string()));
            }
            return Err(classify_reject(status, &text, "cancel order"));
        }

        info!(order_id, "Order cancelled");
        Ok(())
    }

    /// Open orders for the authenticated user, optionally per market.
    pub async fn open_orders(&self, market: Option<&str>) -> Result<Vec<OpenOrder>> {
        let credentials = self.require_credentials()?;
        let url = match market {
            Some(m) => format!("{}/orders?market={}", self.clob.clob_url(), m),
            None => format!("{}/orders", self.clob.clob_url()),
        };
        let timestamp = current_timestamp().to_string();
        // Layer-2 HMAC signs only the path, never the query string.
        let signature = sign_l2_request(credentials, "GET", "/orders", &timestamp, None)?;

        let response = self
            .clob
            .http
            .get(&url)
            .header("POLY_ADDRESS", self.address())
            .header("POLY_SIGNATURE", signature)
            .header("POLY_TIMESTAMP", &timestamp)
            .header("POLY_API_KEY", &credentials.api_key)
            .header("POLY_PASSPHRASE", &credentials.api_passphrase)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_reject(status, &text, "open orders"));
        }

        Ok(response.json().await?)
    }

    fn require_credentials(&self) -> Result<&ApiCredentials> {
        self.credentials.as_ref().ok_or_else(|| Error::Auth {
            message: "API credentials not derived yet".to_string(),
        })
    }

    /// Taker fee rate for an instrument, cached per token.
    async fn fee_rate_bps(&self, token_id: &str) -> Result<u64> {
        if let Some(&cached) = self.fee_rate_cache.lock().unwrap().get(token_id) {
            return Ok(cached);
        }

        let url = format!("{}/fee-rate?token_id={}", self.clob.clob_url(), token_id);
        let response = self.clob.http.get(&url).send().await?;
        if !response.status().is_success() {
            warn!(token_id, status = response.status().as_u16(), "fee-rate query failed, defaulting to 0");
            return Ok(0);
        }

        #[derive(Deserialize)]
        struct FeeRateResponse {
            #[serde(alias = "fee_rate_bps", alias = "feeRateBps", default)]
            fee_rate_bps: Option<u64>,
        }
        let text = response.text().await?;
        let fee = serde_json::from_str::<FeeRateResponse>(&text)
            .ok()
            .and_then(|r| r.fee_rate_bps)
            .or_else(|| text.trim().trim_matches('"').parse().ok())
            .unwrap_or(0);

        self.fee_rate_cache
            .lock()
            .unwrap()
            .insert(token_id.to_string(), fee);
        debug!(token_id, fee_rate_bps = fee, "Cached fee rate");
        Ok(fee)
    }
}

impl std::fmt::Debug for SignedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedClient")
            .field("address", &self.address())
            .field("has_credentials", &self.has_credentials())
            .finish()
    }
}

/// Classify a non-success trading-API response into an error kind.
///
/// Geo-restriction is recognized only from its dedicated status code or
/// explicit wording; a bare 403 is treated as an auth failure because the
/// two are indistinguishable at this layer.
fn classify_reject(status: u16, body: &str, context: &str) -> Error {
    if is_geo_restricted(status, body) {
        return Error::GeoBlocked {
            guidance: "the exchange refuses orders from this region; run the bot from an \
                       allowed region or route through a permitted relay"
                .to_string(),
        };
    }
    match status {
        401 | 403 => Error::Auth {
            message: format!("{context}: {status} - {body}"),
        },
        429 => Error::RateLimited {
            message: format!("{context}: {body}"),
        },
        _ => Error::Api {
            message: format!("{context}: {status} - {body}"),
            status: Some(status),
        },
    }
}

/// The one place free-text matching is allowed: the upstream protocol only
/// communicates geo-blocks via status code or wording, never a structured
/// field. Bare 403/"forbidden" is NOT a geo signal.
fn is_geo_restricted(status: u16, body: &str) -> bool {
    if status == 451 {
        return true;
    }
    let lower = body.to_lowercase();
    const MARKERS: &[&str] = &[
        "geoblock",
        "geo-block",
        "geo block",
        "geo restriction",
        "geographic restriction",
        "restricted jurisdiction",
        "restricted territory",
        "not available in your region",
        "unavailable in your region",
    ];
    MARKERS.iter().any(|m| lower.contains(m))
}

/// Current Unix timestamp in seconds.
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs()
}

/// Sign a request with HMAC-SHA256 for layer-2 authentication.
///
/// Message layout is `timestamp + method + path + body`; the secret is
/// URL-safe base64 with standard base64 as a compatibility fallback.
fn sign_l2_request(
    credentials: &ApiCredentials,
    method: &str,
    path: &str,
    timestamp: &str,
    body: Option<&str>,
) -> Result<String> {
    let message = match body {
        Some(b) => format!("{timestamp}{method}{path}{b}"),
        None => format!("{timestamp}{method}{path}"),
    };

    let secret_bytes = base64::engine::general_purpose::URL_SAFE
        .decode(&credentials.api_secret)
        .or_else(|_| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&credentials.api_secret)
        })
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(&credentials.api_secret))
        .map_err(|e| Error::Signing {
            message: format!("invalid API secret encoding: {e}"),
        })?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&secret_bytes).map_err(|e| Error::Signing {
        message: format!("failed to create HMAC: {e}"),
    })?;
    mac.update(message.as_bytes());
    Ok(base64::engine::general_purpose::URL_SAFE.encode(mac.finalize().into_bytes()))
}
