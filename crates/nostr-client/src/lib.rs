//! Relay transport for the NWC service.
//!
//! Provides a single logical relay connection with:
//! - Push subscription delivery (duplicates possible, dedup is the caller's concern)
//! - Event publishing that awaits the relay `OK` acknowledgment
//! - Automatic reconnection with exponential backoff, re-subscribing from the
//!   last handled event time

mod error;
mod relay;

pub use error::{ClientError, Result};
pub use relay::{ConnectionState, RelayClient, RelayConfig, SubscriptionSpec};
