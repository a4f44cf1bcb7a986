//!
//! Utility module for wallet adapters.
//!
//! Re-exports amount formatting helpers used throughout the codebase.
/// Amount formatting and parsing
pub mod index;

pub use index::{format_token_amount, parse_token_amount};
