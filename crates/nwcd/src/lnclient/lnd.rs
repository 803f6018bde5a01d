//! LND backend over its REST gateway (macaroon auth, TLS).

use super::{LnClient, LnError, NodeInfo};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use bitcoin::hashes::{sha256, Hash};
use nostr::{ListTransactionsParams, TlvRecord, Transaction, TransactionType};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

/// TLV type carrying the keysend preimage.
const KEYSEND_PREIMAGE_TLV: u64 = 5_482_373_484;

pub struct LndClient {
    client: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
}

// LND's REST gateway encodes 64-bit numbers as JSON strings.
fn parse_u64(value: &str) -> u64 {
    value.parse().unwrap_or(0)
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn b64_to_hex(value: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map(hex::encode)
        .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
struct SendResponse {
    #[serde(default)]
    payment_error: String,
    #[serde(default)]
    payment_preimage: String,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Default, Deserialize)]
struct LndInvoice {
    #[serde(default)]
    memo: String,
    #[serde(default)]
    r_preimage: String,
    #[serde(default)]
    r_hash: String,
    #[serde(default)]
    value_msat: String,
    #[serde(default)]
    settled: bool,
    #[serde(default)]
    creation_date: String,
    #[serde(default)]
    settle_date: String,
    #[serde(default)]
    payment_request: String,
    #[serde(default)]
    expiry: String,
}

#[derive(Debug, Deserialize)]
struct ListInvoicesResponse {
    #[serde(default)]
    invoices: Vec<LndInvoice>,
}

#[derive(Debug, Default, Deserialize)]
struct LndPayment {
    #[serde(default)]
    payment_hash: String,
    #[serde(default)]
    payment_preimage: String,
    #[serde(default)]
    value_msat: String,
    #[serde(default)]
    fee_msat: String,
    #[serde(default)]
    creation_date: String,
    #[serde(default)]
    payment_request: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ListPaymentsResponse {
    #[serde(default)]
    payments: Vec<LndPayment>,
}

#[derive(Debug, Deserialize)]
struct ChannelBalanceResponse {
    #[serde(default)]
    local_balance: Option<AmountMsat>,
}

#[derive(Debug, Deserialize)]
struct AmountMsat {
    #[serde(default)]
    msat: String,
}

#[derive(Debug, Deserialize)]
struct GetInfoResponse {
    identity_pubkey: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    color: String,
    #[serde(default)]
    block_height: u32,
    #[serde(default)]
    block_hash: String,
    #[serde(default)]
    chains: Vec<Chain>,
}

#[derive(Debug, Deserialize)]
struct Chain {
    #[serde(default)]
    network: String,
}

impl LndClient {
    pub fn new(
        address: &str,
        cert_file: Option<&str>,
        macaroon_file: &str,
    ) -> anyhow::Result<Self> {
        let macaroon = std::fs::read(macaroon_file)
            .with_context(|| format!("reading macaroon {}", macaroon_file))?;

        let mut builder = reqwest::Client::builder();
        match cert_file {
            Some(path) => {
                let pem =
                    std::fs::read(path).with_context(|| format!("reading TLS cert {}", path))?;
                let cert = reqwest::Certificate::from_pem(&pem).context("parsing TLS cert")?;
                builder = builder.add_root_certificate(cert);
            }
            // lnd serves a self-signed cert; without one pinned we cannot
            // verify the chain
            None => builder = builder.danger_accept_invalid_certs(true),
        }

        Ok(Self {
            client: builder.build().context("building HTTP client")?,
            base_url: address.trim_end_matches('/').to_string(),
            macaroon_hex: hex::encode(macaroon),
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, LnError> {
        let response = builder
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .send()
            .await
            .map_err(|e| LnError::Backend(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| format!("lnd returned {}", status));
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(LnError::NotFound(message));
            }
            return Err(LnError::Backend(message));
        }

        response
            .json()
            .await
            .map_err(|e| LnError::Backend(e.to_string()))
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, LnError> {
        self.request(self.client.get(format!("{}{}", self.base_url, path)))
            .await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, LnError> {
        self.request(
            self.client
                .post(format!("{}{}", self.base_url, path))
                .json(&body),
        )
        .await
    }

    fn invoice_to_transaction(invoice: LndInvoice) -> Transaction {
        let created_at = parse_u64(&invoice.creation_date);
        let expiry = parse_u64(&invoice.expiry);
        Transaction {
            transaction_type: TransactionType::Incoming,
            invoice: Some(invoice.payment_request).filter(|s| !s.is_empty()),
            description: Some(invoice.memo).filter(|s| !s.is_empty()),
            description_hash: None,
            preimage: if invoice.settled {
                Some(b64_to_hex(&invoice.r_preimage)).filter(|s| !s.is_empty())
            } else {
                None
            },
            payment_hash: b64_to_hex(&invoice.r_hash),
            amount: parse_u64(&invoice.value_msat),
            fees_paid: 0,
            created_at,
            expires_at: (expiry > 0).then_some(created_at + expiry),
            settled_at: invoice
                .settled
                .then(|| parse_u64(&invoice.settle_date))
                .filter(|&ts| ts > 0),
            metadata: None,
        }
    }

    fn payment_to_transaction(payment: LndPayment) -> Transaction {
        let settled = payment.status == "SUCCEEDED";
        let created_at = parse_u64(&payment.creation_date);
        Transaction {
            transaction_type: TransactionType::Outgoing,
            invoice: Some(payment.payment_request).filter(|s| !s.is_empty()),
            description: None,
            description_hash: None,
            preimage: settled.then_some(payment.payment_preimage).filter(|s| !s.is_empty()),
            payment_hash: payment.payment_hash,
            amount: parse_u64(&payment.value_msat),
            fees_paid: parse_u64(&payment.fee_msat),
            created_at,
            expires_at: None,
            settled_at: settled.then_some(created_at),
            metadata: None,
        }
    }
}

#[async_trait]
impl LnClient for LndClient {
    async fn send_payment_sync(&self, invoice: &str) -> Result<String, LnError> {
        debug!("paying invoice via lnd");
        let response: SendResponse = self
            .post(
                "/v1/channels/transactions",
                json!({ "payment_request": invoice }),
            )
            .await?;
        if !response.payment_error.is_empty() {
            return Err(LnError::PaymentFailed(response.payment_error));
        }
        Ok(b64_to_hex(&response.payment_preimage))
    }

    async fn send_keysend(
        &self,
        amount_msats: u64,
        destination: &str,
        preimage: Option<&str>,
        tlv_records: &[TlvRecord],
    ) -> Result<String, LnError> {
        let preimage_bytes = match preimage {
            Some(hex_preimage) => hex::decode(hex_preimage)
                .map_err(|e| LnError::Backend(format!("invalid preimage hex: {}", e)))?,
            None => {
                let mut bytes = vec![0u8; 32];
                rand::rng().fill_bytes(&mut bytes);
                bytes
            }
        };
        let payment_hash = sha256::Hash::hash(&preimage_bytes);

        let dest = hex::decode(destination)
            .map_err(|e| LnError::Backend(format!("invalid destination hex: {}", e)))?;

        let mut custom_records: HashMap<String, String> = HashMap::new();
        custom_records.insert(KEYSEND_PREIMAGE_TLV.to_string(), b64(&preimage_bytes));
        for record in tlv_records {
            let value = hex::decode(&record.value)
                .map_err(|e| LnError::Backend(format!("invalid TLV value hex: {}", e)))?;
            custom_records.insert(record.tlv_type.to_string(), b64(&value));
        }

        let response: SendResponse = self
            .post(
                "/v1/channels/transactions",
                json!({
                    "dest": b64(&dest),
                    "amt_msat": amount_msats.to_string(),
                    "payment_hash": b64(payment_hash.as_byte_array()),
                    "dest_custom_records": custom_records,
                    "final_cltv_delta": 40,
                }),
            )
            .await?;
        if !response.payment_error.is_empty() {
            return Err(LnError::PaymentFailed(response.payment_error));
        }
        Ok(hex::encode(preimage_bytes))
    }

    async fn make_invoice(
        &self,
        amount_msats: u64,
        description: Option<&str>,
        description_hash: Option<&str>,
        expiry: Option<u64>,
    ) -> Result<Transaction, LnError> {
        let mut body = json!({ "value_msat": amount_msats.to_string() });
        if let Some(description) = description {
            body["memo"] = json!(description);
        }
        if let Some(description_hash) = description_hash {
            let hash_bytes = hex::decode(description_hash)
                .map_err(|e| LnError::Backend(format!("invalid description_hash hex: {}", e)))?;
            body["description_hash"] = json!(b64(&hash_bytes));
        }
        if let Some(expiry) = expiry {
            body["expiry"] = json!(expiry.to_string());
        }

        let response: AddInvoiceResponse = self.post("/v1/invoices", body).await?;
        // Read the stored invoice back so created_at/expiry are the node's view
        self.lookup_invoice(&b64_to_hex(&response.r_hash)).await
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<Transaction, LnError> {
        let invoice: LndInvoice = self.get(&format!("/v1/invoice/{}", payment_hash)).await?;
        Ok(Self::invoice_to_transaction(invoice))
    }

    async fn list_transactions(
        &self,
        params: &ListTransactionsParams,
    ) -> Result<Vec<Transaction>, LnError> {
        let limit = params.limit.unwrap_or(20);
        let from = params.from.unwrap_or(0);
        let until = params.until.unwrap_or(u64::MAX);
        let unpaid = params.unpaid.unwrap_or(false);

        let mut transactions: Vec<Transaction> = Vec::new();

        if params.transaction_type != Some(TransactionType::Outgoing) {
            let response: ListInvoicesResponse = self
                .get(&format!(
                    "/v1/invoices?num_max_invoices={}&reversed=true&pending_only=false",
                    limit
                ))
                .await?;
            transactions.extend(
                response
                    .invoices
                    .into_iter()
                    .map(Self::invoice_to_transaction)
                    .filter(|tx| unpaid || tx.settled_at.is_some()),
            );
        }

        if params.transaction_type != Some(TransactionType::Incoming) {
            let response: ListPaymentsResponse = self
                .get(&format!(
                    "/v1/payments?max_payments={}&reversed=true&include_incomplete=false",
                    limit
                ))
                .await?;
            transactions.extend(response.payments.into_iter().map(Self::payment_to_transaction));
        }

        transactions.retain(|tx| tx.created_at >= from && tx.created_at <= until);
        Ok(transactions)
    }

    async fn get_balance(&self) -> Result<u64, LnError> {
        let response: ChannelBalanceResponse = self.get("/v1/balance/channels").await?;
        Ok(response
            .local_balance
            .map(|amount| parse_u64(&amount.msat))
            .unwrap_or(0))
    }

    async fn get_info(&self) -> Result<NodeInfo, LnError> {
        let response: GetInfoResponse = self.get("/v1/getinfo").await?;
        Ok(NodeInfo {
            pubkey: response.identity_pubkey,
            alias: response.alias,
            color: response.color,
            network: response
                .chains
                .first()
                .map(|chain| chain.network.clone())
                .unwrap_or_else(|| "mainnet".to_string()),
            block_height: response.block_height,
            block_hash: response.block_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_to_transaction() {
        let invoice = LndInvoice {
            memo: "coffee".to_string(),
            r_preimage: b64(&[0xcd; 32]),
            r_hash: b64(&[0xab; 32]),
            value_msat: "10000".to_string(),
            settled: true,
            creation_date: "1700000000".to_string(),
            settle_date: "1700000060".to_string(),
            payment_request: "lnbc10n1...".to_string(),
            expiry: "3600".to_string(),
        };
        let tx = LndClient::invoice_to_transaction(invoice);
        assert_eq!(tx.transaction_type, TransactionType::Incoming);
        assert_eq!(tx.payment_hash, "ab".repeat(32));
        assert_eq!(tx.preimage.as_deref(), Some("cd".repeat(32).as_str()));
        assert_eq!(tx.amount, 10_000);
        assert_eq!(tx.expires_at, Some(1_700_003_600));
        assert_eq!(tx.settled_at, Some(1_700_000_060));
    }

    #[test]
    fn test_unsettled_invoice_has_no_preimage() {
        let invoice = LndInvoice {
            r_preimage: b64(&[0xcd; 32]),
            r_hash: b64(&[0xab; 32]),
            value_msat: "5000".to_string(),
            settled: false,
            creation_date: "1700000000".to_string(),
            ..Default::default()
        };
        let tx = LndClient::invoice_to_transaction(invoice);
        assert!(tx.preimage.is_none());
        assert!(tx.settled_at.is_none());
    }

    #[test]
    fn test_payment_to_transaction() {
        let payment = LndPayment {
            payment_hash: "ab".repeat(32),
            payment_preimage: "cd".repeat(32),
            value_msat: "2500".to_string(),
            fee_msat: "12".to_string(),
            creation_date: "1700000000".to_string(),
            payment_request: "lnbc25u1...".to_string(),
            status: "SUCCEEDED".to_string(),
        };
        let tx = LndClient::payment_to_transaction(payment);
        assert_eq!(tx.transaction_type, TransactionType::Outgoing);
        assert_eq!(tx.fees_paid, 12);
        assert_eq!(tx.settled_at, Some(1_700_000_000));
    }

    #[test]
    fn test_parse_u64_defaults_to_zero() {
        assert_eq!(parse_u64("123"), 123);
        assert_eq!(parse_u64(""), 0);
        assert_eq!(parse_u64("abc"), 0);
    }
}
