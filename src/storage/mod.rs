//! Persisted chain state for engine bindings.
//!
//! Engines persist what they have synced so that a wallet reopened with the same identity resumes
//! from the same state. The layout is owned here, behind the `ChainStateRepository` trait, and is
//! keyed by currency family, network and wallet identifier.

/// Repository trait and file-based implementation
pub mod repositories;

use crate::adapter::records::TransactionRecord;
use crate::currency::{CurrencyFamily, NetworkKind};
use crate::engine::UnspentOutput;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use repositories::{ChainStateRepository, FileChainStateRepository};

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Encode error: {0}")]
	Encode(String),

	#[error("Decode error: {0}")]
	Decode(String),
}

/// Identity of one wallet's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
	pub family: CurrencyFamily,
	pub network: NetworkKind,
	pub wallet_id: String,
}

/// Everything an engine has synced for one wallet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
	pub height: u64,
	pub utxos: Vec<UnspentOutput>,
	pub records: Vec<TransactionRecord>,
}

impl ChainSnapshot {
	pub fn balance(&self) -> u64 {
		self.utxos.iter().map(|u| u.value).sum()
	}
}
