use std::{
    fmt::Display,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::domain::value_objects::phone_numbers::mask_phone;

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

/// Daraja tokens live for an hour; refresh a little early.
const TOKEN_TTL: Duration = Duration::from_secs(3500);

/// Daraja expects East Africa Time in STK timestamps.
const NAIROBI_UTC_OFFSET_HOURS: i64 = 3;

const TRANSACTION_TYPE_PAYBILL: &str = "CustomerPayBillOnline";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MpesaEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl Display for MpesaEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let environment = match self {
            MpesaEnvironment::Sandbox => "sandbox",
            MpesaEnvironment::Production => "production",
        };
        write!(f, "{}", environment)
    }
}

impl MpesaEnvironment {
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "live" => MpesaEnvironment::Production,
            _ => MpesaEnvironment::Sandbox,
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => SANDBOX_BASE_URL,
            MpesaEnvironment::Production => PRODUCTION_BASE_URL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    pub environment: MpesaEnvironment,
    pub timeout: Duration,
}

/// Provider acknowledgement of an STK push. The outcome arrives later on the
/// callback URL, keyed by `checkout_request_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct StkPushAccepted {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'a str,
    amount: i32,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct DarajaErrorEnvelope {
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Minimal Daraja (M-Pesa) client built on reqwest.
pub struct MpesaClient {
    http: reqwest::Client,
    config: MpesaConfig,
    token: Mutex<Option<CachedToken>>,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build M-Pesa http client")?;

        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    pub fn environment(&self) -> MpesaEnvironment {
        self.config.environment
    }

    async fn ensure_success(resp: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = match resp.text().await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => "<empty response body>".to_string(),
            Err(err) => format!("<failed to read response body: {err}>"),
        };

        let (request_id, error_code, error_message) =
            match serde_json::from_str::<DarajaErrorEnvelope>(&body) {
                Ok(envelope) => (envelope.request_id, envelope.error_code, envelope.error_message),
                Err(_) => (None, None, None),
            };

        error!(
            status = %status,
            mpesa_request_id = ?request_id,
            mpesa_error_code = ?error_code,
            mpesa_error_message = ?error_message,
            response_body = %body,
            context = %context,
            "mpesa api request failed"
        );

        anyhow::bail!(
            "M-Pesa API request failed: {} ({})",
            context,
            error_message.unwrap_or_else(|| format!("status {}", status))
        );
    }

    /// OAuth client-credentials token, cached for [`TOKEN_TTL`].
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.fetched_at.elapsed() < TOKEN_TTL {
                return Ok(token.value.clone());
            }
        }

        // https://developer.safaricom.co.ke/APIs/Authorization
        let credentials = STANDARD.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));

        let resp = self
            .http
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.config.environment.base_url()
            ))
            .header(AUTHORIZATION, format!("Basic {}", credentials))
            .send()
            .await
            .context("failed to request M-Pesa access token")?;
        let resp = Self::ensure_success(resp, "generate access token").await?;

        let parsed: AccessTokenResponse = resp
            .json()
            .await
            .context("failed to decode M-Pesa access token response")?;

        *cached = Some(CachedToken {
            value: parsed.access_token.clone(),
            fetched_at: Instant::now(),
        });

        Ok(parsed.access_token)
    }

    /// Sends an STK push prompt to `phone` (already normalized to `2547XXXXXXXX`).
    pub async fn initiate_stk_push(
        &self,
        phone: &str,
        amount_minor: i32,
        account_reference: &str,
        description: &str,
    ) -> Result<StkPushAccepted> {
        // https://developer.safaricom.co.ke/APIs/MpesaExpressSimulate
        let token = self.access_token().await?;
        let timestamp = stk_timestamp(Utc::now());

        let request = StkPushRequest {
            business_short_code: &self.config.shortcode,
            password: stk_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: TRANSACTION_TYPE_PAYBILL,
            amount: amount_minor,
            party_a: phone,
            party_b: &self.config.shortcode,
            phone_number: phone,
            callback_url: &self.config.callback_url,
            account_reference,
            transaction_desc: description,
        };

        let resp = self
            .http
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.config.environment.base_url()
            ))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .context("failed to send STK push request")?;
        let resp = Self::ensure_success(resp, "stk push").await?;

        let parsed: StkPushResponse = resp
            .json()
            .await
            .context("failed to decode STK push response")?;

        if parsed.response_code.as_deref() != Some("0") {
            anyhow::bail!(
                "STK push rejected: {}",
                parsed
                    .response_description
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }

        let checkout_request_id = parsed
            .checkout_request_id
            .filter(|id| !id.is_empty())
            .context("STK push response is missing CheckoutRequestID")?;

        info!(
            %checkout_request_id,
            phone = %mask_phone(phone),
            amount_minor,
            %account_reference,
            "mpesa: stk push accepted"
        );

        Ok(StkPushAccepted {
            checkout_request_id,
            merchant_request_id: parsed.merchant_request_id,
            customer_message: parsed.customer_message,
        })
    }
}

/// `YYYYMMDDHHMMSS` in Nairobi time.
pub fn stk_timestamp(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::hours(NAIROBI_UTC_OFFSET_HOURS))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// `base64(shortcode + passkey + timestamp)`.
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
}
