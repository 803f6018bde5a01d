//! Alby cloud wallet backend (REST, bearer token auth).

use super::{LnClient, LnError, NodeInfo};
use async_trait::async_trait;
use chrono::DateTime;
use nostr::{ListTransactionsParams, TlvRecord, Transaction, TransactionType};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub struct AlbyClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PayResponse {
    payment_preimage: String,
}

#[derive(Debug, Serialize)]
struct KeysendRequest {
    amount: u64,
    destination: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    custom_records: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceRecord {
    payment_request: Option<String>,
    payment_hash: String,
    #[serde(default)]
    preimage: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    amount: u64,
    #[serde(default)]
    memo: Option<String>,
    #[serde(default)]
    description_hash: Option<String>,
    #[serde(default)]
    settled: bool,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    settled_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse_rfc3339(value: &Option<String>) -> Option<u64> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp().max(0) as u64)
}

impl AlbyClient {
    pub fn new(base_url: &str, access_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, LnError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: ErrorBody = response.json().await.unwrap_or(ErrorBody { message: None });
        let message = body
            .message
            .unwrap_or_else(|| format!("alby API returned {}", status));
        if status == StatusCode::NOT_FOUND {
            Err(LnError::NotFound(message))
        } else {
            Err(LnError::Backend(message))
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, LnError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(|e| LnError::Backend(e.to_string()))?;
        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| LnError::Backend(e.to_string()))
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, LnError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| LnError::Backend(e.to_string()))?;
        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| LnError::Backend(e.to_string()))
    }

    fn record_to_transaction(record: InvoiceRecord) -> Transaction {
        let transaction_type = match record.r#type.as_deref() {
            Some("outgoing") => TransactionType::Outgoing,
            _ => TransactionType::Incoming,
        };
        Transaction {
            transaction_type,
            invoice: record.payment_request,
            description: record.memo,
            description_hash: record.description_hash,
            preimage: record.preimage.filter(|p| !p.is_empty()),
            payment_hash: record.payment_hash,
            amount: record.amount.saturating_mul(1_000),
            fees_paid: 0,
            created_at: parse_rfc3339(&record.created_at).unwrap_or_else(now_secs),
            expires_at: parse_rfc3339(&record.expires_at),
            settled_at: if record.settled {
                parse_rfc3339(&record.settled_at)
            } else {
                None
            },
            metadata: None,
        }
    }
}

#[async_trait]
impl LnClient for AlbyClient {
    async fn send_payment_sync(&self, invoice: &str) -> Result<String, LnError> {
        debug!("paying invoice via alby");
        let response: PayResponse = self
            .post("/payments/bolt11", &json!({ "invoice": invoice }))
            .await
            .map_err(|e| match e {
                LnError::Backend(message) => LnError::PaymentFailed(message),
                other => other,
            })?;
        Ok(response.payment_preimage)
    }

    async fn send_keysend(
        &self,
        amount_msats: u64,
        destination: &str,
        _preimage: Option<&str>,
        tlv_records: &[TlvRecord],
    ) -> Result<String, LnError> {
        // The cloud wallet picks the preimage itself; a caller-supplied one
        // cannot be forwarded.
        let custom_records: HashMap<String, String> = tlv_records
            .iter()
            .map(|record| (record.tlv_type.to_string(), record.value.clone()))
            .collect();
        let body = serde_json::to_value(KeysendRequest {
            amount: amount_msats / 1_000,
            destination: destination.to_string(),
            custom_records,
        })
        .map_err(|e| LnError::Backend(e.to_string()))?;

        let response: PayResponse =
            self.post("/payments/keysend", &body).await.map_err(|e| match e {
                LnError::Backend(message) => LnError::PaymentFailed(message),
                other => other,
            })?;
        Ok(response.payment_preimage)
    }

    async fn make_invoice(
        &self,
        amount_msats: u64,
        description: Option<&str>,
        description_hash: Option<&str>,
        expiry: Option<u64>,
    ) -> Result<Transaction, LnError> {
        let mut body = json!({ "amount": amount_msats / 1_000 });
        if let Some(description) = description {
            body["description"] = json!(description);
        }
        if let Some(description_hash) = description_hash {
            body["description_hash"] = json!(description_hash);
        }
        if let Some(expiry) = expiry {
            body["expiry"] = json!(expiry);
        }

        let record: InvoiceRecord = self.post("/invoices", &body).await?;
        Ok(Self::record_to_transaction(record))
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<Transaction, LnError> {
        let record: InvoiceRecord = self.get(&format!("/invoices/{}", payment_hash)).await?;
        Ok(Self::record_to_transaction(record))
    }

    async fn list_transactions(
        &self,
        params: &ListTransactionsParams,
    ) -> Result<Vec<Transaction>, LnError> {
        let limit = params.limit.unwrap_or(20);
        let offset = params.offset.unwrap_or(0);
        let page = offset / limit.max(1) + 1;
        let records: Vec<InvoiceRecord> = self
            .get(&format!("/invoices?items={}&page={}", limit, page))
            .await?;

        let from = params.from.unwrap_or(0);
        let until = params.until.unwrap_or(u64::MAX);
        let transactions = records
            .into_iter()
            .map(Self::record_to_transaction)
            .filter(|tx| tx.created_at >= from && tx.created_at <= until)
            .filter(|tx| match params.transaction_type {
                Some(wanted) => tx.transaction_type == wanted,
                None => true,
            })
            .filter(|tx| {
                // Unsettled incoming invoices are only listed on request
                params.unpaid.unwrap_or(false)
                    || tx.settled_at.is_some()
                    || tx.transaction_type == TransactionType::Outgoing
            })
            .collect();
        Ok(transactions)
    }

    async fn get_balance(&self) -> Result<u64, LnError> {
        let response: BalanceResponse = self.get("/balance").await?;
        Ok(response.balance.saturating_mul(1_000))
    }

    async fn get_info(&self) -> Result<NodeInfo, LnError> {
        // The cloud wallet fronts a shared node; only the alias is meaningful.
        Ok(NodeInfo {
            pubkey: String::new(),
            alias: "getalby.com".to_string(),
            color: String::new(),
            network: "mainnet".to_string(),
            block_height: 0,
            block_hash: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_to_transaction_settled_incoming() {
        let record = InvoiceRecord {
            payment_request: Some("lnbc10n1...".to_string()),
            payment_hash: "ab".repeat(32),
            preimage: Some("cd".repeat(32)),
            r#type: Some("incoming".to_string()),
            amount: 10,
            memo: Some("coffee".to_string()),
            description_hash: None,
            settled: true,
            created_at: Some("2023-11-15T12:00:00Z".to_string()),
            expires_at: Some("2023-11-15T13:00:00Z".to_string()),
            settled_at: Some("2023-11-15T12:01:00Z".to_string()),
        };
        let tx = AlbyClient::record_to_transaction(record);
        assert_eq!(tx.transaction_type, TransactionType::Incoming);
        assert_eq!(tx.amount, 10_000);
        assert!(tx.settled_at.is_some());
        assert_eq!(tx.expires_at.unwrap() - tx.created_at, 3_600);
    }

    #[test]
    fn test_record_to_transaction_empty_preimage_is_none() {
        let record = InvoiceRecord {
            payment_request: None,
            payment_hash: "ab".repeat(32),
            preimage: Some(String::new()),
            r#type: Some("outgoing".to_string()),
            amount: 1,
            memo: None,
            description_hash: None,
            settled: false,
            created_at: None,
            expires_at: None,
            settled_at: None,
        };
        let tx = AlbyClient::record_to_transaction(record);
        assert_eq!(tx.transaction_type, TransactionType::Outgoing);
        assert!(tx.preimage.is_none());
        assert!(tx.settled_at.is_none());
    }
}
