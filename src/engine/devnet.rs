//! In-process sync engine over a simulated chain.
//!
//! `DevnetEngine` behaves like a remote node binding without a network: a simulated chain tip
//! advances when blocks are mined, sync runs walk from the wallet's persisted height to the tip on
//! a background task, and broadcasts land in a local mempool. Synced state is persisted through a
//! [`ChainStateRepository`], so an engine rebuilt for the same wallet resumes where it left off.
//!
//! The control methods (`fund`, `mine_blocks`, `disconnect`, `fail_next_broadcast`) drive the
//! simulated network from demos and tests.

use crate::adapter::records::TransactionRecord;
use crate::currencies::{bitcoin, midnight};
use crate::currency::{AuthMaterial, Currency, CurrencyFamily};
use crate::engine::{
	EngineError, EngineEvent, EngineListener, EngineProvider, FeeEstimateRequest, PaymentDraft,
	SignedTransaction, SyncEngine, UnspentOutput,
};
use crate::storage::{ChainSnapshot, ChainStateRepository, StateKey, StorageError};

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TX_OVERHEAD_VBYTES: u64 = 11;
const P2WPKH_INPUT_VBYTES: u64 = 68;
/// Output value plus script length prefix.
const OUTPUT_BASE_VBYTES: u64 = 9;
const P2WPKH_SCRIPT_LEN: u64 = 22;
const MIN_RELAY_FEE_RATE: u64 = 1;
/// Smallest P2WPKH output the network relays.
const P2WPKH_DUST_LIMIT: u64 = 294;

#[derive(Debug, Clone)]
pub struct DevnetConfig {
	/// Blocks already on the simulated chain before the wallet's first sync.
	pub sync_blocks: u64,
	/// Simulated time to process one block during a sync run.
	pub block_interval: Duration,
}

impl Default for DevnetConfig {
	fn default() -> Self {
		Self {
			sync_blocks: 20,
			block_interval: Duration::from_millis(50),
		}
	}
}

/// How a family prices its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeModel {
	/// `fee_rate` times the virtual size of a P2WPKH spend.
	VirtualSize,
	/// Same fee for every transaction.
	Flat(u64),
}

impl FeeModel {
	fn estimate(&self, request: &FeeEstimateRequest<'_>) -> u64 {
		match *self {
			FeeModel::Flat(fee) => fee,
			FeeModel::VirtualSize => {
				let inputs = request.inputs.len() as u64;
				let mut vsize = TX_OVERHEAD_VBYTES
					+ inputs * P2WPKH_INPUT_VBYTES
					+ OUTPUT_BASE_VBYTES
					+ request.recipient_script_len as u64;
				if request.change_output {
					vsize += OUTPUT_BASE_VBYTES + P2WPKH_SCRIPT_LEN;
				}
				vsize * request.fee_rate.max(MIN_RELAY_FEE_RATE)
			}
		}
	}

	fn dust_threshold(&self) -> u64 {
		match *self {
			FeeModel::Flat(_) => 0,
			FeeModel::VirtualSize => P2WPKH_DUST_LIMIT,
		}
	}

	fn min_relay_fee(&self) -> u64 {
		match *self {
			FeeModel::Flat(fee) => fee,
			FeeModel::VirtualSize => {
				(TX_OVERHEAD_VBYTES + P2WPKH_INPUT_VBYTES + OUTPUT_BASE_VBYTES + P2WPKH_SCRIPT_LEN)
					* MIN_RELAY_FEE_RATE
			}
		}
	}
}

struct Chain {
	/// What the simulated network knows about the wallet.
	network: ChainSnapshot,
	/// What the wallet has synced and persisted.
	synced: ChainSnapshot,
	loaded: bool,
}

struct Shared {
	key: StateKey,
	code: String,
	repository: Arc<dyn ChainStateRepository>,
	config: DevnetConfig,
	chain: Mutex<Chain>,
	listener: Mutex<Option<EngineListener>>,
}

impl Shared {
	fn chain(&self) -> MutexGuard<'_, Chain> {
		self.chain.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn emit(&self, event: EngineEvent) {
		if let Some(listener) = self
			.listener
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.as_ref()
		{
			if !listener.emit(event) {
				debug!("Adapter for {} is gone, dropping engine event", self.code);
			}
		}
	}

	async fn load(&self) -> Result<(), StorageError> {
		let loaded = self.chain().loaded;
		if loaded {
			return Ok(());
		}
		let persisted = self.repository.load(&self.key).await?;

		let mut chain = self.chain();
		if chain.loaded {
			return Ok(());
		}
		chain.loaded = true;
		if let Some(snapshot) = persisted {
			info!(
				"Resuming {} wallet from height {}",
				self.code, snapshot.height
			);
			if chain.network.records.is_empty() {
				let tip = chain.network.height.max(snapshot.height);
				chain.network = ChainSnapshot {
					height: tip,
					..snapshot.clone()
				};
			}
			chain.synced = snapshot;
		}
		Ok(())
	}

	fn has_new_data(&self) -> bool {
		let chain = self.chain();
		chain.network != chain.synced
	}

	async fn sync(self: Arc<Self>) {
		if let Err(e) = self.load().await {
			warn!("Failed to load {} chain state: {}", self.code, e);
			self.emit(EngineEvent::Disconnected(e.to_string()));
			return;
		}

		self.emit(EngineEvent::SyncStarted);

		let (from, to) = {
			let chain = self.chain();
			(chain.synced.height, chain.network.height)
		};
		let span = to.saturating_sub(from).max(1);
		debug!("Syncing {} from height {} to {}", self.code, from, to);

		for height in from + 1..=to {
			tokio::time::sleep(self.config.block_interval).await;
			self.emit(EngineEvent::BlockHeightChanged(height));
			self.emit(EngineEvent::Progress((height - from) as f64 / span as f64));
		}

		let snapshot = {
			let mut chain = self.chain();
			chain.synced = chain.network.clone();
			chain.synced.clone()
		};

		self.emit(EngineEvent::BlockHeightChanged(snapshot.height));
		self.emit(EngineEvent::BalanceChanged(snapshot.balance()));
		if !snapshot.records.is_empty() {
			self.emit(EngineEvent::TransactionsChanged(snapshot.records.clone()));
		}

		if let Err(e) = self.repository.save(&self.key, &snapshot).await {
			warn!("Failed to persist {} chain state: {}", self.code, e);
			self.emit(EngineEvent::Disconnected(format!(
				"Failed to persist chain state: {}",
				e
			)));
			return;
		}

		self.emit(EngineEvent::Completed);
		info!(
			"{} synced to height {} with {} outputs",
			self.code,
			snapshot.height,
			snapshot.utxos.len()
		);
	}
}

/// Engine for one wallet on the simulated chain.
pub struct DevnetEngine {
	shared: Arc<Shared>,
	fee_model: FeeModel,
	receive_address: String,
	signing_key: Mutex<Option<[u8; 32]>>,
	task: Mutex<Option<JoinHandle<()>>>,
	connected: AtomicBool,
	fail_next_broadcast: AtomicBool,
	broadcasts: AtomicUsize,
}

impl DevnetEngine {
	pub fn new(
		currency: &Currency,
		key: StateKey,
		receive_address: String,
		signing_key: [u8; 32],
		fee_model: FeeModel,
		repository: Arc<dyn ChainStateRepository>,
		config: DevnetConfig,
	) -> Self {
		let network = ChainSnapshot {
			height: config.sync_blocks,
			..Default::default()
		};
		let shared = Shared {
			key,
			code: currency.code.clone(),
			repository,
			config,
			chain: Mutex::new(Chain {
				network,
				synced: ChainSnapshot::default(),
				loaded: false,
			}),
			listener: Mutex::new(None),
		};

		Self {
			shared: Arc::new(shared),
			fee_model,
			receive_address,
			signing_key: Mutex::new(Some(signing_key)),
			task: Mutex::new(None),
			connected: AtomicBool::new(true),
			fail_next_broadcast: AtomicBool::new(false),
			broadcasts: AtomicUsize::new(0),
		}
	}

	pub fn state_key(&self) -> &StateKey {
		&self.shared.key
	}

	fn spawn_sync(&self) {
		let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
		if task.as_ref().is_some_and(|t| !t.is_finished()) {
			debug!("{} sync already running", self.shared.code);
			return;
		}
		*task = Some(tokio::spawn(Arc::clone(&self.shared).sync()));
	}

	fn abort_sync(&self) {
		if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
			task.abort();
		}
	}

	/// Mine a block paying `amount` to the wallet. Returns the funding transaction hash.
	pub fn fund(&self, amount: u64) -> String {
		let txid = hex::encode(rand::random::<[u8; 32]>());
		let mut chain = self.shared.chain();
		chain.network.height += 1;
		let height = chain.network.height;

		chain.network.utxos.push(UnspentOutput {
			txid: txid.clone(),
			vout: 0,
			value: amount,
		});
		chain.network.records.push(TransactionRecord {
			hash: txid.clone(),
			amount: i64::try_from(amount).unwrap_or(i64::MAX),
			fee: None,
			block_height: Some(height),
			timestamp: Utc::now(),
			counterparty: None,
			rate: None,
		});
		debug!("Funded {} wallet with {} at height {}", self.shared.code, amount, height);
		txid
	}

	/// Advance the tip by `blocks`, confirming everything in the mempool in the first new block.
	pub fn mine_blocks(&self, blocks: u64) {
		if blocks == 0 {
			return;
		}
		let mut chain = self.shared.chain();
		let next = chain.network.height + 1;
		chain.network.height += blocks;
		for record in chain
			.network
			.records
			.iter_mut()
			.filter(|r| r.block_height.is_none())
		{
			record.block_height = Some(next);
		}
	}

	pub fn network_height(&self) -> u64 {
		self.shared.chain().network.height
	}

	/// Drop the connection. The running sync stops and broadcasts fail until the next start.
	pub fn disconnect(&self, reason: &str) {
		self.connected.store(false, Ordering::SeqCst);
		self.abort_sync();
		warn!("{} devnet node disconnected: {}", self.shared.code, reason);
		self.shared
			.emit(EngineEvent::Disconnected(reason.to_string()));
	}

	/// Make the next broadcast fail with a node rejection.
	pub fn fail_next_broadcast(&self) {
		self.fail_next_broadcast.store(true, Ordering::SeqCst);
	}

	/// Broadcasts the node has accepted.
	pub fn broadcast_count(&self) -> usize {
		self.broadcasts.load(Ordering::SeqCst)
	}

	fn apply_broadcast(&self, tx: &SignedTransaction) -> Result<ChainSnapshot, EngineError> {
		let draft = &tx.draft;
		let mut guard = self.shared.chain();
		let chain = &mut *guard;

		let unspent = draft
			.inputs
			.iter()
			.all(|input| chain.network.utxos.contains(input));
		if !unspent {
			return Err(EngineError::Broadcast(
				"transaction spends unknown or spent outputs".to_string(),
			));
		}

		let spent = draft.amount.saturating_add(draft.fee);
		let record = TransactionRecord {
			hash: tx.hash.clone(),
			amount: -i64::try_from(spent).unwrap_or(i64::MAX),
			fee: Some(draft.fee),
			block_height: None,
			timestamp: Utc::now(),
			counterparty: Some(draft.recipient.clone()),
			rate: None,
		};
		let change = (draft.change > 0).then(|| UnspentOutput {
			txid: tx.hash.clone(),
			vout: 1,
			value: draft.change,
		});

		for snapshot in [&mut chain.network, &mut chain.synced] {
			snapshot.utxos.retain(|u| !draft.inputs.contains(u));
			snapshot.utxos.extend(change.clone());
			snapshot.records.push(record.clone());
		}
		Ok(chain.synced.clone())
	}
}

#[async_trait::async_trait]
impl SyncEngine for DevnetEngine {
	fn attach(&self, listener: EngineListener) {
		*self
			.shared
			.listener
			.lock()
			.unwrap_or_else(|e| e.into_inner()) = Some(listener);
	}

	async fn start(&self) -> Result<(), EngineError> {
		self.connected.store(true, Ordering::SeqCst);
		self.spawn_sync();
		Ok(())
	}

	async fn refresh(&self) -> Result<(), EngineError> {
		self.connected.store(true, Ordering::SeqCst);
		self.shared.load().await?;
		if self.shared.has_new_data() {
			self.spawn_sync();
		} else {
			debug!("{} is up to date", self.shared.code);
		}
		Ok(())
	}

	async fn stop(&self) {
		self.abort_sync();
	}

	fn current_balance(&self) -> u64 {
		self.shared.chain().synced.balance()
	}

	fn last_block_height(&self) -> Option<u64> {
		let height = self.shared.chain().synced.height;
		(height > 0).then_some(height)
	}

	fn receive_address(&self) -> String {
		self.receive_address.clone()
	}

	fn unspent_outputs(&self) -> Vec<UnspentOutput> {
		self.shared.chain().synced.utxos.clone()
	}

	fn min_relay_fee(&self) -> u64 {
		self.fee_model.min_relay_fee()
	}

	fn estimate_fee(&self, request: FeeEstimateRequest<'_>) -> u64 {
		self.fee_model.estimate(&request)
	}

	fn dust_threshold(&self) -> u64 {
		self.fee_model.dust_threshold()
	}

	fn sign(&self, draft: &PaymentDraft) -> Result<SignedTransaction, EngineError> {
		let key = self
			.signing_key
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.ok_or(EngineError::KeyUnavailable)?;

		let raw = bincode::serialize(draft)
			.map_err(|e| StorageError::Encode(format!("Failed to encode transaction: {}", e)))?;
		let mut hasher = Sha256::new();
		hasher.update(key);
		hasher.update(&raw);

		Ok(SignedTransaction {
			hash: hex::encode(hasher.finalize()),
			raw,
			draft: draft.clone(),
		})
	}

	async fn broadcast(&self, tx: &SignedTransaction) -> Result<String, EngineError> {
		if !self.connected.load(Ordering::SeqCst) {
			return Err(EngineError::Disconnected(
				"devnet node unreachable".to_string(),
			));
		}
		if self.fail_next_broadcast.swap(false, Ordering::SeqCst) {
			return Err(EngineError::Broadcast(
				"transaction rejected by devnet node".to_string(),
			));
		}

		let synced = self.apply_broadcast(tx)?;
		self.broadcasts.fetch_add(1, Ordering::SeqCst);

		self.shared
			.emit(EngineEvent::BalanceChanged(synced.balance()));
		if let Some(record) = synced.records.last() {
			self.shared
				.emit(EngineEvent::TransactionsChanged(vec![record.clone()]));
		}

		if let Err(e) = self.shared.repository.save(&self.shared.key, &synced).await {
			warn!("Failed to persist {} state after broadcast: {}", self.shared.code, e);
		}
		Ok(tx.hash.clone())
	}

	async fn clear(&self) -> Result<(), EngineError> {
		self.abort_sync();
		*self.signing_key.lock().unwrap_or_else(|e| e.into_inner()) = None;
		self.shared.repository.delete(&self.shared.key).await?;

		let mut chain = self.shared.chain();
		chain.synced = ChainSnapshot::default();
		chain.loaded = true;
		Ok(())
	}

	fn debug_info(&self) -> String {
		let chain = self.shared.chain();
		format!(
			"devnet tip={} synced={} outputs={} connected={} broadcasts={}",
			chain.network.height,
			chain.synced.height,
			chain.synced.utxos.len(),
			self.connected.load(Ordering::SeqCst),
			self.broadcast_count()
		)
	}
}

/// Builds devnet engines backed by one chain state repository.
pub struct DevnetEngineProvider {
	repository: Arc<dyn ChainStateRepository>,
	config: DevnetConfig,
	engines: Mutex<HashMap<StateKey, Weak<DevnetEngine>>>,
}

impl DevnetEngineProvider {
	pub fn new(repository: Arc<dyn ChainStateRepository>, config: DevnetConfig) -> Self {
		Self {
			repository,
			config,
			engines: Mutex::new(HashMap::new()),
		}
	}

	/// The live engine for a wallet, if one was built and is still in use.
	pub fn engine(&self, key: &StateKey) -> Option<Arc<DevnetEngine>> {
		self.engines
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(key)
			.and_then(Weak::upgrade)
	}
}

fn signing_key(seed: &[u8; 64], family: CurrencyFamily) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(seed);
	hasher.update(family.as_str().as_bytes());
	hasher.finalize().into()
}

#[async_trait::async_trait]
impl EngineProvider for DevnetEngineProvider {
	fn build(
		&self,
		currency: &Currency,
		auth: &AuthMaterial,
	) -> Result<Arc<dyn SyncEngine>, EngineError> {
		let seed = auth.seed()?;
		let (address, fee_model) = match currency.family {
			CurrencyFamily::Bitcoin => (
				bitcoin::derive_receive_address(&seed, currency.network)?,
				FeeModel::VirtualSize,
			),
			CurrencyFamily::Midnight => (
				midnight::derive_receive_address(&seed, currency.network)?,
				FeeModel::Flat(midnight::MIDNIGHT_FLAT_FEE),
			),
			CurrencyFamily::Ethereum => {
				return Err(EngineError::Unsupported(currency.code.clone()));
			}
		};

		let key = StateKey {
			family: currency.family,
			network: currency.network,
			wallet_id: auth.wallet_id().to_string(),
		};
		let engine = Arc::new(DevnetEngine::new(
			currency,
			key.clone(),
			address,
			signing_key(&seed, currency.family),
			fee_model,
			Arc::clone(&self.repository),
			self.config.clone(),
		));

		let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
		engines.retain(|_, engine| engine.strong_count() > 0);
		engines.insert(key, Arc::downgrade(&engine));

		info!("Built devnet engine for {} ({})", currency.code, currency.network.as_str());
		Ok(engine)
	}

	async fn clear_family(&self, family: CurrencyFamily) -> Result<(), EngineError> {
		self.repository.clear_family(family).await?;
		Ok(())
	}
}
