//! HTTP clients for the engine's external collaborators, plus static
//! fallbacks used when no service URL is configured.

pub mod entitlements;
pub mod ledger;

pub use entitlements::{HttpEntitlements, StaticEntitlements};
pub use ledger::{FreeLedger, HttpLedger};
