//! Lightning client abstraction.
//!
//! The capability interface every node backend must satisfy. Selection is by
//! configuration at startup; handlers only ever see `dyn LnClient`.

pub mod alby;
pub mod lnd;

use async_trait::async_trait;
use nostr::{ListTransactionsParams, TlvRecord, Transaction};
use thiserror::Error;

pub use alby::AlbyClient;
pub use lnd::LndClient;

/// Backend failure taxonomy.
#[derive(Debug, Error)]
pub enum LnError {
    /// The node attempted the payment and it failed.
    #[error("{0}")]
    PaymentFailed(String),

    /// The backend rejected or could not serve the call.
    #[error("{0}")]
    Backend(String),

    /// The call did not return within the allotted time.
    #[error("{0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Static node details for `get_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub pubkey: String,
    pub alias: String,
    pub color: String,
    pub network: String,
    pub block_height: u32,
    pub block_hash: String,
}

/// Capability interface over the embedded Lightning node.
///
/// All operations are cancelled by dropping the returned future; callers
/// bound them with a timeout and surface `TIMEOUT` past it.
#[async_trait]
pub trait LnClient: Send + Sync {
    /// Pay a BOLT-11 invoice, returning the hex preimage.
    async fn send_payment_sync(&self, invoice: &str) -> Result<String, LnError>;

    /// Spontaneous payment; returns the hex preimage.
    async fn send_keysend(
        &self,
        amount_msats: u64,
        destination: &str,
        preimage: Option<&str>,
        tlv_records: &[TlvRecord],
    ) -> Result<String, LnError>;

    async fn make_invoice(
        &self,
        amount_msats: u64,
        description: Option<&str>,
        description_hash: Option<&str>,
        expiry: Option<u64>,
    ) -> Result<Transaction, LnError>;

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<Transaction, LnError>;

    async fn list_transactions(
        &self,
        params: &ListTransactionsParams,
    ) -> Result<Vec<Transaction>, LnError>;

    /// Spendable balance in millisats.
    async fn get_balance(&self) -> Result<u64, LnError>;

    async fn get_info(&self) -> Result<NodeInfo, LnError>;
}
