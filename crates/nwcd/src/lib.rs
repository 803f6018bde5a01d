//! Nostr Wallet Connect service.
//!
//! Bridges a Nostr relay and a Lightning node: subscribes to encrypted
//! kind-23194 request events addressed to the service identity, dispatches
//! them to per-app handlers under permission and budget enforcement, and
//! publishes encrypted kind-23195 responses.

pub mod analytics;
pub mod config;
pub mod db;
pub mod lnclient;
pub mod permissions;
pub mod service;

mod handlers;
