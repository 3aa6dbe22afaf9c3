//! Vendor HTTP adapters.

mod doubao;
mod gemini;
mod minimax;

pub use doubao::{Doubao, DoubaoConfig};
pub use gemini::{Gemini, GeminiConfig};
pub use minimax::{Minimax, MinimaxConfig};

use crate::provider::ProviderCallError;

/// Classify a non-success HTTP response from a vendor.
///
/// 5xx, 408 and 429 are transient and become transport errors; 401/403 are
/// transport errors too so the poll supervisor can recognize credential
/// failures by status; every other 4xx means the vendor rejected the request
/// and is terminal.
pub(crate) fn classify_status(status: u16, body: &str) -> ProviderCallError {
    match status {
        401 | 403 | 408 | 429 | 500..=599 => {
            ProviderCallError::transport(format!("HTTP {status}: {body}"), Some(status))
        }
        _ => ProviderCallError::Provider(format!("HTTP {status}: {body}")),
    }
}

pub(crate) fn transport_err(err: reqwest::Error) -> ProviderCallError {
    let status = err.status().map(|s| s.as_u16());
    ProviderCallError::transport(err.to_string(), status)
}
