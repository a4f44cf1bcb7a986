//! Currency adapters for a multi-currency wallet.
//!
//! Each supported currency family gets an [`Adapter`] that turns its sync engine's callbacks into a
//! uniform view of state, balance, block height and transaction records, and that quotes fees and
//! sends payments. [`AdapterFactory`] hands out one adapter per currency and wallet identity.

pub mod adapter;
pub mod config;
pub mod currencies;
pub mod currency;
pub mod engine;
pub mod factory;
pub mod fee_rates;
pub mod manager;
pub mod storage;
pub mod utils;

pub use adapter::{Adapter, AdapterError, AdapterState, FeeQuote, PaymentRequest, TransactionRecord};
pub use config::AdapterConfig;
pub use currency::{AuthMaterial, Currency, CurrencyFamily, NetworkKind};
pub use factory::AdapterFactory;
pub use manager::{Wallet, WalletManager};
