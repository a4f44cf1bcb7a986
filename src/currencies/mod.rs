//! Adapter implementations, one per currency family.
//!
//! Each adapter composes an [`AdapterCore`](crate::adapter::AdapterCore) with the family's
//! address rules, payment URI scheme and fee inputs.

/// Bitcoin (P2WPKH) adapter and address rules
pub mod bitcoin;
/// Midnight shielded-address adapter and address rules
pub mod midnight;

pub use self::bitcoin::BitcoinAdapter;
pub use self::midnight::MidnightAdapter;
