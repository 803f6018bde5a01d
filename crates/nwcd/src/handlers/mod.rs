//! Method handlers. Payment handlers in `payments`, thin node adapters in
//! `adapters`; all run as `Service` methods with capabilities injected by the
//! dispatcher.

mod adapters;
mod payments;

use crate::lnclient::LnError;
use nostr::{ErrorCode, Response};

/// Map a backend failure to the wire error, preserving the backend message.
pub(crate) fn ln_error_response(result_type: &str, err: &LnError) -> Response {
    let code = match err {
        LnError::Timeout(_) => ErrorCode::Timeout,
        _ => ErrorCode::Internal,
    };
    Response::error(result_type, code, &err.to_string())
}
