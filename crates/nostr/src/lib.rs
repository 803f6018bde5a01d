//! Nostr protocol types for the NWC service.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, signing, verification)
//! - NIP-04: Encrypted payload envelope (ECDH + AES-256-CBC)
//! - NIP-47: Nostr Wallet Connect wire format (requests, responses, error codes)

mod event;
mod nip04;
mod nip47;

// NIP-01: Basic protocol
pub use event::{
    finalize_event, generate_secret_key, get_event_hash, get_public_key_hex, serialize_event,
    verify_event, xonly_hex_to_compressed, Event, EventError, EventTemplate,
};

// NIP-04: Encrypted payload envelope
pub use nip04::{decrypt, encrypt, CryptoError};

// NIP-47: Nostr Wallet Connect
pub use nip47::{
    BalanceResult, ErrorCode, ErrorResponse, InfoResult, ListTransactionsParams,
    ListTransactionsResult, LookupInvoiceParams, MakeInvoiceParams, Method,
    MultiPayInvoiceElement, MultiPayInvoiceParams, MultiPayKeysendElement, MultiPayKeysendParams,
    PayInvoiceParams, PayInvoiceResult, PayKeysendParams, Request, Response, TlvRecord,
    Transaction, TransactionType, WalletConnectUrl, INFO_EVENT_KIND, REQUEST_KIND, RESPONSE_KIND,
};
