//! Sync engine binding.
//!
//! This module defines the boundary between an adapter and the per-currency engine that performs
//! network synchronization. The engine runs on its own background tasks and reports what it sees
//! through an [`EngineListener`], which feeds a queue drained by the owning adapter. Nothing the
//! engine does calls back into adapter state directly, so engine callbacks can never re-enter the
//! adapter's lock.
//!
//! - `SyncEngine`: what an adapter consumes from an engine (start, refresh, balance, fees, signing,
//!   broadcast, wipe).
//! - `EngineProvider`: builds engines for a currency and wipes a whole currency family.
//! - `devnet`: an in-process engine with a simulated chain, used for development and tests.

pub mod devnet;

use crate::adapter::records::TransactionRecord;
use crate::currency::{AuthMaterial, Currency, CurrencyFamily};
use crate::storage::StorageError;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use devnet::{DevnetConfig, DevnetEngine, DevnetEngineProvider};

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Signing key unavailable")]
	KeyUnavailable,

	#[error("Broadcast failed: {0}")]
	Broadcast(String),

	#[error("Engine disconnected: {0}")]
	Disconnected(String),

	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),

	#[error("Invalid mnemonic: {0}")]
	InvalidMnemonic(String),

	#[error("Key derivation error: {0}")]
	KeyDerivation(String),

	#[error("Unsupported currency: {0}")]
	Unsupported(String),
}

/// Events an engine reports while it runs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
	/// The engine began a new sync run (fresh trigger or reorg).
	SyncStarted,
	/// Fraction of the current run that is done, in `[0, 1]`.
	Progress(f64),
	/// The engine caught up with the network tip.
	Completed,
	/// The engine lost its connection or failed; data reported afterwards is not trusted.
	Disconnected(String),
	BalanceChanged(u64),
	BlockHeightChanged(u64),
	/// Full batch of new or changed records.
	TransactionsChanged(Vec<TransactionRecord>),
}

/// Items drained by an adapter's event pump.
#[derive(Debug)]
pub(crate) enum AdapterInput {
	Engine(EngineEvent),
	/// Marks the point after which engine data belongs to a new session.
	Resume,
}

/// Handle an engine uses to report events to its adapter.
#[derive(Debug, Clone)]
pub struct EngineListener {
	tx: mpsc::UnboundedSender<AdapterInput>,
}

impl EngineListener {
	pub(crate) fn new(tx: mpsc::UnboundedSender<AdapterInput>) -> Self {
		Self { tx }
	}

	/// Queue an event for the adapter. Returns `false` once the adapter is gone.
	pub fn emit(&self, event: EngineEvent) -> bool {
		self.tx.send(AdapterInput::Engine(event)).is_ok()
	}

	pub fn sync_started(&self) -> bool {
		self.emit(EngineEvent::SyncStarted)
	}

	pub fn progress(&self, progress: f64) -> bool {
		self.emit(EngineEvent::Progress(progress))
	}

	pub fn completed(&self) -> bool {
		self.emit(EngineEvent::Completed)
	}

	pub fn disconnected(&self, reason: impl Into<String>) -> bool {
		self.emit(EngineEvent::Disconnected(reason.into()))
	}

	pub fn balance_changed(&self, balance: u64) -> bool {
		self.emit(EngineEvent::BalanceChanged(balance))
	}

	pub fn block_height_changed(&self, height: u64) -> bool {
		self.emit(EngineEvent::BlockHeightChanged(height))
	}

	pub fn transactions_changed(&self, records: Vec<TransactionRecord>) -> bool {
		self.emit(EngineEvent::TransactionsChanged(records))
	}
}

/// A spendable output owned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
	pub txid: String,
	pub vout: u32,
	pub value: u64,
}

/// Inputs for an engine fee estimate.
#[derive(Debug, Clone, Copy)]
pub struct FeeEstimateRequest<'a> {
	pub target_value: u64,
	pub inputs: &'a [UnspentOutput],
	/// Whether the transaction carries a change output back to the wallet.
	pub change_output: bool,
	/// Length of the recipient's output script in bytes.
	pub recipient_script_len: usize,
	/// Fee rate in base units per virtual byte. Ignored by flat-fee families.
	pub fee_rate: u64,
}

/// A fully specified payment, ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDraft {
	pub recipient: String,
	/// Amount the recipient receives.
	pub amount: u64,
	pub fee: u64,
	pub inputs: Vec<UnspentOutput>,
	pub change: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
	pub hash: String,
	pub raw: Vec<u8>,
	pub draft: PaymentDraft,
}

/// What an adapter consumes from a per-currency sync engine.
///
/// Implementations do their network work on their own tasks. `start` and `refresh` only kick
/// off work and return; everything observed afterwards is reported through the attached
/// [`EngineListener`].
#[async_trait::async_trait]
pub trait SyncEngine: Send + Sync {
	/// Attach the listener that receives this engine's events. Called once by the adapter.
	fn attach(&self, listener: EngineListener);

	async fn start(&self) -> Result<(), EngineError>;

	/// Re-check the network for new data without a full resync.
	async fn refresh(&self) -> Result<(), EngineError>;

	async fn stop(&self);

	fn current_balance(&self) -> u64;

	fn last_block_height(&self) -> Option<u64>;

	fn receive_address(&self) -> String;

	fn unspent_outputs(&self) -> Vec<UnspentOutput>;

	/// Smallest fee the network relays.
	fn min_relay_fee(&self) -> u64;

	fn estimate_fee(&self, request: FeeEstimateRequest<'_>) -> u64;

	/// Change below this is not worth an output and is paid as fee instead.
	fn dust_threshold(&self) -> u64 {
		0
	}

	/// Sign a payment. CPU-bound; never touches the network.
	fn sign(&self, draft: &PaymentDraft) -> Result<SignedTransaction, EngineError>;

	/// Hand a signed transaction to the network. Resolves on acknowledgement, not confirmation.
	async fn broadcast(&self, tx: &SignedTransaction) -> Result<String, EngineError>;

	/// Wipe this wallet's persisted chain state and keys.
	async fn clear(&self) -> Result<(), EngineError>;

	fn debug_info(&self) -> String {
		format!(
			"height={:?} balance={}",
			self.last_block_height(),
			self.current_balance()
		)
	}
}

/// Builds engines and owns the persisted state of whole currency families.
#[async_trait::async_trait]
pub trait EngineProvider: Send + Sync {
	/// Build the engine for one wallet. The same `(currency, wallet id)` must bind to the same
	/// persisted state.
	fn build(
		&self,
		currency: &Currency,
		auth: &AuthMaterial,
	) -> Result<Arc<dyn SyncEngine>, EngineError>;

	/// Wipe every wallet's persisted state for a family.
	async fn clear_family(&self, family: CurrencyFamily) -> Result<(), EngineError>;
}
