//! Typed decoding of the M-Pesa STK push result callback.
//!
//! The provider posts
//! `{"Body":{"stkCallback":{"MerchantRequestID","CheckoutRequestID","ResultCode","ResultDesc","CallbackMetadata":{"Item":[{"Name","Value"}]}}}}`.
//! Anything that does not decode into a [`StkCallbackOutcome`] is rejected
//! before business logic runs.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RESULT_CODE_SUCCESS: i64 = 0;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

/// Payment details confirmed by a successful callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedPayment {
    pub receipt: String,
    pub amount_minor: i32,
    pub payer_phone: Option<String>,
    pub transaction_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StkCallbackOutcome {
    Succeeded {
        checkout_request_id: String,
        merchant_request_id: Option<String>,
        payment: ConfirmedPayment,
    },
    Failed {
        checkout_request_id: String,
        merchant_request_id: Option<String>,
        result_code: i64,
        reason: String,
    },
}

impl StkCallbackOutcome {
    pub fn checkout_request_id(&self) -> &str {
        match self {
            StkCallbackOutcome::Succeeded {
                checkout_request_id,
                ..
            }
            | StkCallbackOutcome::Failed {
                checkout_request_id,
                ..
            } => checkout_request_id,
        }
    }

    pub fn result_code(&self) -> i64 {
        match self {
            StkCallbackOutcome::Succeeded { .. } => RESULT_CODE_SUCCESS,
            StkCallbackOutcome::Failed { result_code, .. } => *result_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRejection {
    InvalidJson,
    InvalidStructure(String),
    MissingCheckoutRequestId,
    MissingMetadata(&'static str),
    InvalidAmount,
}

impl Display for CallbackRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackRejection::InvalidJson => write!(f, "Invalid JSON"),
            CallbackRejection::InvalidStructure(detail) => {
                write!(f, "Invalid callback structure: {}", detail)
            }
            CallbackRejection::MissingCheckoutRequestId => write!(f, "Missing CheckoutRequestID"),
            CallbackRejection::MissingMetadata(name) => {
                write!(f, "Missing {} in CallbackMetadata", name)
            }
            CallbackRejection::InvalidAmount => write!(f, "Invalid Amount in CallbackMetadata"),
        }
    }
}

pub fn decode_stk_callback(payload: &[u8]) -> Result<StkCallbackOutcome, CallbackRejection> {
    let envelope: StkCallbackEnvelope = serde_json::from_slice(payload).map_err(|err| {
        if err.is_data() {
            CallbackRejection::InvalidStructure(err.to_string())
        } else {
            CallbackRejection::InvalidJson
        }
    })?;

    envelope.body.stk_callback.into_outcome()
}

impl StkCallback {
    pub fn into_outcome(self) -> Result<StkCallbackOutcome, CallbackRejection> {
        let checkout_request_id = self
            .checkout_request_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(CallbackRejection::MissingCheckoutRequestId)?;

        if self.result_code != RESULT_CODE_SUCCESS {
            let reason = self
                .result_desc
                .map(|desc| desc.trim().to_string())
                .filter(|desc| !desc.is_empty())
                .unwrap_or_else(|| format!("Payment failed (result code {})", self.result_code));

            return Ok(StkCallbackOutcome::Failed {
                checkout_request_id,
                merchant_request_id: self.merchant_request_id,
                result_code: self.result_code,
                reason,
            });
        }

        let metadata = self
            .callback_metadata
            .ok_or(CallbackRejection::MissingMetadata("Amount"))?;

        let amount = metadata
            .number("Amount")
            .ok_or(CallbackRejection::MissingMetadata("Amount"))?;
        let receipt = metadata
            .text("MpesaReceiptNumber")
            .filter(|receipt| !receipt.is_empty())
            .ok_or(CallbackRejection::MissingMetadata("MpesaReceiptNumber"))?;

        Ok(StkCallbackOutcome::Succeeded {
            checkout_request_id,
            merchant_request_id: self.merchant_request_id,
            payment: ConfirmedPayment {
                receipt,
                amount_minor: amount_to_minor(amount)?,
                payer_phone: metadata.text("PhoneNumber"),
                transaction_date: metadata.text("TransactionDate"),
            },
        })
    }
}

impl CallbackMetadata {
    fn value(&self, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| item.value.as_ref())
    }

    /// Numbers may arrive as JSON numbers or numeric strings.
    fn number(&self, name: &str) -> Option<f64> {
        match self.value(name)? {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// `PhoneNumber` and `TransactionDate` are sent as JSON numbers.
    fn text(&self, name: &str) -> Option<String> {
        match self.value(name)? {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

fn amount_to_minor(amount: f64) -> Result<i32, CallbackRejection> {
    if !amount.is_finite() || amount <= 0.0 || amount > f64::from(i32::MAX) {
        return Err(CallbackRejection::InvalidAmount);
    }
    Ok(amount.round() as i32)
}
