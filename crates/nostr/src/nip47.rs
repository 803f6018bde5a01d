//! NIP-47: Nostr Wallet Connect
//!
//! Wire format for the wallet-connect request/response protocol: kind-23194
//! requests, kind-23195 responses, the closed method and error-code sets, and
//! the pairing URL handed to client applications.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/47.md>

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of encrypted request events sent by client apps
pub const REQUEST_KIND: u16 = 23194;
/// Kind of encrypted response events published by the wallet service
pub const RESPONSE_KIND: u16 = 23195;
/// Kind of the replaceable info event advertising supported methods
pub const INFO_EVENT_KIND: u16 = 13194;

/// The closed set of wallet methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    PayInvoice,
    MultiPayInvoice,
    PayKeysend,
    MultiPayKeysend,
    MakeInvoice,
    LookupInvoice,
    ListTransactions,
    GetBalance,
    GetInfo,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::PayInvoice => "pay_invoice",
            Method::MultiPayInvoice => "multi_pay_invoice",
            Method::PayKeysend => "pay_keysend",
            Method::MultiPayKeysend => "multi_pay_keysend",
            Method::MakeInvoice => "make_invoice",
            Method::LookupInvoice => "lookup_invoice",
            Method::ListTransactions => "list_transactions",
            Method::GetBalance => "get_balance",
            Method::GetInfo => "get_info",
        }
    }

    /// Parse a wire method name; `None` for anything outside the closed set
    pub fn parse(s: &str) -> Option<Method> {
        match s {
            "pay_invoice" => Some(Method::PayInvoice),
            "multi_pay_invoice" => Some(Method::MultiPayInvoice),
            "pay_keysend" => Some(Method::PayKeysend),
            "multi_pay_keysend" => Some(Method::MultiPayKeysend),
            "make_invoice" => Some(Method::MakeInvoice),
            "lookup_invoice" => Some(Method::LookupInvoice),
            "list_transactions" => Some(Method::ListTransactions),
            "get_balance" => Some(Method::GetBalance),
            "get_info" => Some(Method::GetInfo),
            _ => None,
        }
    }

    /// Whether the method moves money and is therefore budget-checked
    pub fn is_monetary(&self) -> bool {
        matches!(
            self,
            Method::PayInvoice
                | Method::MultiPayInvoice
                | Method::PayKeysend
                | Method::MultiPayKeysend
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of error codes a response may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    NotImplemented,
    InsufficientBalance,
    QuotaExceeded,
    Restricted,
    Unauthorized,
    Internal,
    Other,
    Expired,
    BadRequest,
    PaymentFailed,
    Timeout,
}

/// Error payload inside a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// A decrypted request envelope: `{method, params}`
///
/// `method` stays a raw string so that unknown methods parse successfully and
/// can be answered with `NOT_IMPLEMENTED` rather than `BAD_REQUEST`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A response envelope: `{result_type, error?, result?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub result_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Response {
    pub fn success<T: Serialize>(result_type: &str, result: &T) -> Response {
        match serde_json::to_value(result) {
            Ok(value) => Response {
                result_type: result_type.to_string(),
                error: None,
                result: Some(value),
            },
            Err(err) => Response::error(result_type, ErrorCode::Internal, &err.to_string()),
        }
    }

    pub fn error(result_type: &str, code: ErrorCode, message: &str) -> Response {
        Response {
            result_type: result_type.to_string(),
            error: Some(ErrorResponse {
                code,
                message: message.to_string(),
            }),
            result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayInvoiceParams {
    pub invoice: String,
    /// Explicit amount in millisats; overrides the invoice amount for
    /// zero-amount invoices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiPayInvoiceElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub invoice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiPayInvoiceParams {
    pub invoices: Vec<MultiPayInvoiceElement>,
}

/// TLV record attached to a keysend payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlvRecord {
    #[serde(rename = "type")]
    pub tlv_type: u64,
    /// Hex-encoded record value
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayKeysendParams {
    pub pubkey: String,
    /// Amount in millisats
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tlv_records: Vec<TlvRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiPayKeysendElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub pubkey: String,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tlv_records: Vec<TlvRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiPayKeysendParams {
    pub keysends: Vec<MultiPayKeysendElement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeInvoiceParams {
    /// Amount in millisats
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    /// Expiry in seconds from creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupInvoiceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTransactionsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpaid: Option<bool>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayInvoiceResult {
    pub preimage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees_paid: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceResult {
    /// Balance in millisats
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResult {
    pub alias: String,
    pub color: String,
    pub pubkey: String,
    pub network: String,
    pub block_height: u32,
    pub block_hash: String,
    pub methods: Vec<String>,
}

/// An invoice or payment record as exposed over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    pub payment_hash: String,
    /// Amount in millisats
    pub amount: u64,
    pub fees_paid: u64,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTransactionsResult {
    pub transactions: Vec<Transaction>,
}

/// Pairing URL handed to a client app when an App is created
#[derive(Debug, Clone)]
pub struct WalletConnectUrl {
    pub pubkey: String,
    pub relay: String,
    pub secret: String,
}

impl fmt::Display for WalletConnectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nostr+walletconnect://{}?relay={}&secret={}",
            self.pubkey,
            percent_encode(&self.relay),
            self.secret
        )
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_roundtrip() {
        for method in [
            Method::PayInvoice,
            Method::MultiPayInvoice,
            Method::PayKeysend,
            Method::MultiPayKeysend,
            Method::MakeInvoice,
            Method::LookupInvoice,
            Method::ListTransactions,
            Method::GetBalance,
            Method::GetInfo,
        ] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("teleport"), None);
    }

    #[test]
    fn test_monetary_methods() {
        assert!(Method::PayInvoice.is_monetary());
        assert!(Method::MultiPayKeysend.is_monetary());
        assert!(!Method::GetBalance.is_monetary());
        assert!(!Method::MakeInvoice.is_monetary());
    }

    #[test]
    fn test_request_parses_unknown_method() {
        let request: Request =
            serde_json::from_str(r#"{"method":"teleport","params":{}}"#).unwrap();
        assert_eq!(request.method, "teleport");
        assert_eq!(Method::parse(&request.method), None);
    }

    #[test]
    fn test_request_params_default() {
        let request: Request = serde_json::from_str(r#"{"method":"get_info"}"#).unwrap();
        assert!(request.params.is_null());
    }

    #[test]
    fn test_error_code_wire_format() {
        assert_eq!(
            serde_json::to_value(ErrorCode::QuotaExceeded).unwrap(),
            json!("QUOTA_EXCEEDED")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::NotImplemented).unwrap(),
            json!("NOT_IMPLEMENTED")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::BadRequest).unwrap(),
            json!("BAD_REQUEST")
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::error("pay_invoice", ErrorCode::Restricted, "no scope");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["result_type"], "pay_invoice");
        assert_eq!(value["error"]["code"], "RESTRICTED");
        assert_eq!(value["error"]["message"], "no scope");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_success_response_shape() {
        let response = Response::success(
            "pay_invoice",
            &PayInvoiceResult {
                preimage: "abcd".to_string(),
                fees_paid: None,
            },
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["result"]["preimage"], "abcd");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_multi_pay_params_parse() {
        let params: MultiPayInvoiceParams = serde_json::from_value(json!({
            "invoices": [
                {"id": "a", "invoice": "lnbc1..."},
                {"invoice": "lnbc2...", "amount": 1000},
            ]
        }))
        .unwrap();
        assert_eq!(params.invoices.len(), 2);
        assert_eq!(params.invoices[0].id.as_deref(), Some("a"));
        assert_eq!(params.invoices[1].amount, Some(1000));
    }

    #[test]
    fn test_transaction_type_field_rename() {
        let tx = Transaction {
            transaction_type: TransactionType::Outgoing,
            invoice: Some("lnbc1...".to_string()),
            description: None,
            description_hash: None,
            preimage: None,
            payment_hash: "00".repeat(32),
            amount: 1000,
            fees_paid: 0,
            created_at: 1_700_000_000,
            expires_at: None,
            settled_at: None,
            metadata: None,
        };
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["type"], "outgoing");
        assert!(value.get("transaction_type").is_none());
    }

    #[test]
    fn test_keysend_params_parse() {
        let params: PayKeysendParams = serde_json::from_value(json!({
            "pubkey": "02abcd",
            "amount": 5000,
            "tlv_records": [{"type": 5482373484u64, "value": "deadbeef"}]
        }))
        .unwrap();
        assert_eq!(params.amount, 5000);
        assert_eq!(params.tlv_records[0].tlv_type, 5482373484);
        assert!(params.preimage.is_none());
    }

    #[test]
    fn test_wallet_connect_url() {
        let url = WalletConnectUrl {
            pubkey: "ab".repeat(32),
            relay: "wss://relay.example.com/v1".to_string(),
            secret: "cd".repeat(32),
        };
        let rendered = url.to_string();
        assert!(rendered.starts_with("nostr+walletconnect://"));
        assert!(rendered.contains("relay=wss%3A%2F%2Frelay.example.com%2Fv1"));
        assert!(rendered.ends_with(&format!("secret={}", "cd".repeat(32))));
    }
}
