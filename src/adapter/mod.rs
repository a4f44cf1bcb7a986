//! Adapter contract.
//!
//! An adapter mediates between wallet-level features and one currency's sync engine. Every
//! currency family implements [`Adapter`] on its own, composing the shared pieces in this module:
//!
//! - `sync`: the serialization point for state, balance, height and records, the engine event pump,
//!   and the send pipeline.
//! - `state`: the `NotSynced -> Syncing -> Synced` machine.
//! - `events`: per-adapter broadcast channels.
//! - `fee`: fee quotes and coin selection.
//! - `payment`: payment-string parsing.
//! - `records`: transaction records and their storage.

pub mod events;
pub mod fee;
pub mod payment;
pub mod records;
pub mod state;
pub mod sync;

use crate::currency::Currency;
use crate::engine::EngineError;

pub use events::{AdapterEvent, BusError, EventBus, Subscription};
pub use fee::{FeeQuote, FeeRequest};
pub use payment::{PaymentRequest, PaymentUriParser};
pub use records::{RecordStore, TransactionRecord, TransactionStatus};
pub use state::{AdapterState, SyncStateMachine};
pub use sync::AdapterCore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
	#[error("Invalid address: {0}")]
	InvalidAddress(String),

	#[error("Insufficient amount, required fee {fee}")]
	InsufficientAmount { fee: u64 },

	#[error("Amount does not cover the fee {fee}")]
	AmountTooSmall { fee: u64 },

	#[error("Broadcast failed: {0}")]
	BroadcastFailed(String),

	#[error("Unauthorized: {0}")]
	Unauthorized(String),

	#[error("A send is in progress for this currency family")]
	SendInProgress,

	#[error("Engine error: {0}")]
	Engine(EngineError),

	#[error("Runtime error: {0}")]
	Runtime(String),
}

/// Broad classes of adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Bad input; the user corrects it and tries again.
	Validation,
	/// Network or sync failure; retrying `start()` or `send()` may succeed.
	Network,
	/// Keys are gone or unusable; the user has to log in again.
	Authorization,
	Internal,
}

impl AdapterError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			AdapterError::InvalidAddress(_)
			| AdapterError::InsufficientAmount { .. }
			| AdapterError::AmountTooSmall { .. } => ErrorKind::Validation,
			AdapterError::BroadcastFailed(_) | AdapterError::SendInProgress => ErrorKind::Network,
			AdapterError::Engine(EngineError::Disconnected(_)) => ErrorKind::Network,
			AdapterError::Unauthorized(_) => ErrorKind::Authorization,
			AdapterError::Engine(EngineError::KeyUnavailable) => ErrorKind::Authorization,
			AdapterError::Engine(_) | AdapterError::Runtime(_) => ErrorKind::Internal,
		}
	}
}

impl From<EngineError> for AdapterError {
	fn from(e: EngineError) -> Self {
		match e {
			EngineError::KeyUnavailable => {
				AdapterError::Unauthorized("signing key unavailable".to_string())
			}
			EngineError::Broadcast(reason) => AdapterError::BroadcastFailed(reason),
			other => AdapterError::Engine(other),
		}
	}
}

/// Invoked exactly once when a send finishes, with the transaction hash on success.
pub type SendCompletion = Box<dyn FnOnce(Result<String, AdapterError>) + Send + 'static>;

/// The contract every currency adapter satisfies.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
	fn currency(&self) -> &Currency;

	fn balance(&self) -> u64;
	fn subscribe_balance(&self) -> Subscription<u64>;

	fn state(&self) -> AdapterState;
	fn subscribe_state(&self) -> Subscription<AdapterState>;

	/// Confirmations after which a transaction counts as final.
	fn confirmations_threshold(&self) -> u32;
	fn last_block_height(&self) -> Option<u64>;
	/// Carries the new height, or `None` once the wallet's state is wiped.
	fn subscribe_last_block_height(&self) -> Subscription<Option<u64>>;

	fn transaction_records(&self) -> Vec<TransactionRecord>;
	/// Carries each changed batch. An empty batch means the record set was wiped.
	fn subscribe_transaction_records(&self) -> Subscription<Vec<TransactionRecord>>;

	fn debug_info(&self) -> String;

	/// Whether `refresh()` does anything for this currency.
	fn refreshable(&self) -> bool;

	async fn start(&self) -> Result<(), AdapterError>;
	async fn refresh(&self) -> Result<(), AdapterError>;

	/// Stop syncing and wipe this wallet's persisted state.
	async fn clear(&self) -> Result<(), AdapterError>;

	/// Validate, sign and broadcast a payment. Returns immediately; `completion` runs later.
	fn send(&self, address: &str, value: u64, completion: SendCompletion);

	fn fee(&self, value: u64, address: Option<&str>, sender_pays: bool)
	-> Result<FeeQuote, AdapterError>;

	fn validate(&self, address: &str) -> Result<(), AdapterError>;

	/// Never fails; see [`PaymentRequest`].
	fn parse(&self, payment: &str) -> PaymentRequest;

	fn receive_address(&self) -> String;
}
