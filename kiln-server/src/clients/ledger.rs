//! Credit ledger client.
//!
//! [`HttpLedger`] talks to the billing service over REST; an HTTP 402 from
//! the charge endpoint maps to [`LedgerError::InsufficientCredits`].
//! [`FreeLedger`] is the standalone fallback where every charge costs zero.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use kiln_core::{ChargeRequest, CreditLedger, LedgerError, Receipt};

pub struct HttpLedger {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChargeBody {
    receipt_id: String,
    credits_charged: i64,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl CreditLedger for HttpLedger {
    async fn charge(
        &self,
        user_id: &str,
        request: &ChargeRequest,
    ) -> Result<Receipt, LedgerError> {
        let response = self
            .http
            .post(format!("{}/charges", self.base_url))
            .json(&json!({
                "user_id": user_id,
                "operation": request.operation,
                "provider": request.provider,
                "resolution": request.resolution,
                "duration": request.duration,
                "quantity": request.quantity,
            }))
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::PAYMENT_REQUIRED {
            let message = response.text().await.unwrap_or_default();
            return Err(LedgerError::InsufficientCredits(message));
        }
        let body: ChargeBody = response
            .error_for_status()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(Receipt {
            id: body.receipt_id,
            credits_charged: body.credits_charged,
        })
    }

    async fn refund(&self, receipt_id: &str, reason: &str) -> Result<(), LedgerError> {
        self.http
            .post(format!("{}/refunds", self.base_url))
            .json(&json!({ "receipt_id": receipt_id, "reason": reason }))
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Zero-cost ledger for standalone deployments: charges always succeed at
/// zero credits and refunds are accepted silently.
pub struct FreeLedger;

#[async_trait]
impl CreditLedger for FreeLedger {
    async fn charge(
        &self,
        _user_id: &str,
        _request: &ChargeRequest,
    ) -> Result<Receipt, LedgerError> {
        Ok(Receipt {
            id: format!("free-{}", Uuid::new_v4()),
            credits_charged: 0,
        })
    }

    async fn refund(&self, _receipt_id: &str, _reason: &str) -> Result<(), LedgerError> {
        Ok(())
    }
}
