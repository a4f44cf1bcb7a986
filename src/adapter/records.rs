//! Transaction records and their local storage.
//!
//! Records arrive from the engine in batches on an adapter's transaction channel. The fiat rate of a
//! record is filled in later by an external rate service, so a record without a rate is a normal,
//! persisted state ("non-filled").

use crate::adapter::events::BusError;
use crate::adapter::Adapter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
	pub hash: String,
	/// Net effect on the wallet in base units. Negative for outgoing payments.
	pub amount: i64,
	pub fee: Option<u64>,
	/// Block the transaction was mined in; `None` while in the mempool.
	pub block_height: Option<u64>,
	pub timestamp: DateTime<Utc>,
	pub counterparty: Option<String>,
	/// Fiat rate at the time of the transaction, once known.
	pub rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransactionStatus {
	Pending,
	Processing { progress: f64 },
	Completed,
}

impl TransactionRecord {
	pub fn is_incoming(&self) -> bool {
		self.amount > 0
	}

	pub fn confirmations(&self, last_block_height: Option<u64>) -> u32 {
		match (self.block_height, last_block_height) {
			(Some(mined), Some(tip)) if tip >= mined => {
				u32::try_from(tip - mined + 1).unwrap_or(u32::MAX)
			}
			_ => 0,
		}
	}

	pub fn status(&self, last_block_height: Option<u64>, threshold: u32) -> TransactionStatus {
		let confirmations = self.confirmations(last_block_height);
		if confirmations == 0 {
			TransactionStatus::Pending
		} else if confirmations >= threshold {
			TransactionStatus::Completed
		} else {
			TransactionStatus::Processing {
				progress: confirmations as f64 / threshold as f64,
			}
		}
	}
}

/// In-memory record storage keyed by transaction hash.
#[derive(Debug, Default)]
pub struct RecordStore {
	records: RwLock<HashMap<String, TransactionRecord>>,
}

impl RecordStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TransactionRecord>> {
		self.records.read().unwrap_or_else(|e| e.into_inner())
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TransactionRecord>> {
		self.records.write().unwrap_or_else(|e| e.into_inner())
	}

	pub fn record(&self, hash: &str) -> Option<TransactionRecord> {
		self.read().get(hash).cloned()
	}

	/// Records still waiting for a fiat rate.
	pub fn non_filled_records(&self) -> Vec<TransactionRecord> {
		let mut records: Vec<_> = self
			.read()
			.values()
			.filter(|r| r.rate.is_none())
			.cloned()
			.collect();
		records.sort_by_key(|r| r.timestamp);
		records
	}

	pub fn set_rate(&self, rate: f64, hash: &str) {
		if let Some(record) = self.write().get_mut(hash) {
			record.rate = Some(rate);
		}
	}

	pub fn clear_rates(&self) {
		for record in self.write().values_mut() {
			record.rate = None;
		}
	}

	/// Insert or replace records. A rate already filled in locally survives an update that
	/// carries none.
	pub fn update(&self, records: Vec<TransactionRecord>) {
		let mut stored = self.write();
		for mut record in records {
			if record.rate.is_none() {
				record.rate = stored.get(&record.hash).and_then(|r| r.rate);
			}
			stored.insert(record.hash.clone(), record);
		}
	}

	pub fn clear_records(&self) {
		self.write().clear();
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.read().is_empty()
	}

	/// Keep this store updated from an adapter's transaction channel until the adapter goes away.
	pub fn watch(self: &Arc<Self>, adapter: &dyn Adapter) -> JoinHandle<()> {
		let store = Arc::clone(self);
		let mut records = adapter.subscribe_transaction_records();
		let code = adapter.currency().code.clone();

		tokio::spawn(async move {
			loop {
				match records.recv().await {
					Ok(batch) if batch.is_empty() => {
						debug!("{} records were wiped", code);
						store.clear_records();
					}
					Ok(batch) => {
						debug!("Storing {} {} transaction records", batch.len(), code);
						store.update(batch);
					}
					Err(BusError::Lagged(missed)) => {
						warn!("Record store lagged behind {} by {} batches", code, missed);
					}
					Err(BusError::Closed) => break,
				}
			}
		})
	}
}
