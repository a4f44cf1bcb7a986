//! Shared adapter core: the serialization point between an engine and its callers.
//!
//! `AdapterCore` owns the adapter's snapshot (sync state, balance, last block height and the
//! transaction set) behind a single lock. Two kinds of input mutate it:
//!
//! - Caller operations (`start`, `refresh`, `clear`) on the caller's task.
//! - Engine events, which arrive on an unbounded queue and are applied by a pump task in the order
//!   the engine reported them.
//!
//! Each mutation publishes its event while the lock is held. Publishing is a non-blocking handoff
//! to broadcast channels, so subscribers observe changes in the same order they were applied and a
//! slow subscriber never stalls the engine.
//!
//! Sends run on a spawned task. Fee quoting and coin selection happen up front on the caller's
//! task, so a payment that cannot be funded completes with an error without reaching the engine.
//! Every send holds a read guard on its family's send gate until broadcast returns; a clear takes
//! the write side and refuses to wait.

use crate::adapter::events::{AdapterEvent, EventBus, Subscription};
use crate::adapter::fee::{self, FeeQuote, FeeRequest};
use crate::adapter::records::TransactionRecord;
use crate::adapter::state::{AdapterState, SyncStateMachine};
use crate::adapter::{AdapterError, SendCompletion};
use crate::currency::Currency;
use crate::engine::{
	AdapterInput, EngineError, EngineEvent, EngineListener, PaymentDraft, SyncEngine,
};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Snapshot {
	machine: SyncStateMachine,
	balance: u64,
	last_block_height: Option<u64>,
	transactions: BTreeMap<String, TransactionRecord>,
	wiped: bool,
}

pub struct AdapterCore {
	currency: Currency,
	engine: Arc<dyn SyncEngine>,
	inner: Mutex<Snapshot>,
	bus: EventBus,
	inputs: mpsc::UnboundedSender<AdapterInput>,
	send_gate: Arc<RwLock<()>>,
	runtime: Handle,
	pump: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterCore {
	/// Bind a core to its engine and start draining engine events.
	///
	/// Must be called from within a Tokio runtime; sends and the event pump run on it.
	pub fn new(
		currency: Currency,
		engine: Arc<dyn SyncEngine>,
		send_gate: Arc<RwLock<()>>,
	) -> Result<Arc<Self>, AdapterError> {
		let runtime = Handle::try_current().map_err(|e| AdapterError::Runtime(e.to_string()))?;

		let (tx, rx) = mpsc::unbounded_channel();
		engine.attach(EngineListener::new(tx.clone()));

		let snapshot = Snapshot {
			machine: SyncStateMachine::new(),
			balance: engine.current_balance(),
			last_block_height: engine.last_block_height(),
			transactions: BTreeMap::new(),
			wiped: false,
		};

		let core = Arc::new(Self {
			currency,
			engine,
			inner: Mutex::new(snapshot),
			bus: EventBus::default(),
			inputs: tx,
			send_gate,
			runtime,
			pump: Mutex::new(None),
		});

		let pump = core.runtime.spawn(drain(Arc::downgrade(&core), rx));
		*core.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);

		debug!("Adapter core for {} bound to engine", core.currency.code);
		Ok(core)
	}

	fn lock(&self) -> MutexGuard<'_, Snapshot> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn currency(&self) -> &Currency {
		&self.currency
	}

	pub fn engine(&self) -> &Arc<dyn SyncEngine> {
		&self.engine
	}

	fn publish_state(&self, transition: Option<AdapterState>) {
		if let Some(state) = transition {
			debug!("{} state -> {:?}", self.currency.code, state);
			self.bus.publish(AdapterEvent::StateChanged(state));
		}
	}

	fn apply(&self, input: AdapterInput) {
		let mut inner = self.lock();

		let event = match input {
			AdapterInput::Resume => {
				inner.machine.resume();
				return;
			}
			AdapterInput::Engine(event) => event,
		};

		match event {
			EngineEvent::SyncStarted => self.publish_state(inner.machine.sync_started()),
			EngineEvent::Progress(progress) => self.publish_state(inner.machine.progress(progress)),
			EngineEvent::Completed => self.publish_state(inner.machine.completed()),
			EngineEvent::Disconnected(reason) => {
				warn!("{} engine disconnected: {}", self.currency.code, reason);
				self.publish_state(inner.machine.disconnected());
			}
			EngineEvent::BalanceChanged(balance) => {
				if !inner.machine.accepts_data() {
					debug!("Dropping stale {} balance update", self.currency.code);
					return;
				}
				if inner.balance != balance {
					inner.balance = balance;
					self.bus.publish(AdapterEvent::BalanceChanged(balance));
				}
			}
			EngineEvent::BlockHeightChanged(height) => {
				if !inner.machine.accepts_data() {
					return;
				}
				if inner.last_block_height != Some(height) {
					inner.last_block_height = Some(height);
					self.bus
						.publish(AdapterEvent::LastBlockHeightChanged(Some(height)));
				}
			}
			EngineEvent::TransactionsChanged(records) => {
				if !inner.machine.accepts_data() {
					debug!(
						"Dropping {} stale {} transaction records",
						records.len(),
						self.currency.code
					);
					return;
				}
				let changed: Vec<TransactionRecord> = records
					.into_iter()
					.filter(|r| inner.transactions.get(&r.hash) != Some(r))
					.collect();
				if changed.is_empty() {
					return;
				}
				for record in &changed {
					inner
						.transactions
						.insert(record.hash.clone(), record.clone());
				}
				self.bus
					.publish(AdapterEvent::TransactionRecordsChanged(changed));
			}
		}
	}

	pub async fn start(&self) -> Result<(), AdapterError> {
		{
			let mut inner = self.lock();
			let Some(state) = inner.machine.begin() else {
				debug!("{} start coalesced in {:?}", self.currency.code, inner.machine.state());
				return Ok(());
			};
			self.publish_state(Some(state));
			// Engine events queued after this marker belong to the new session.
			let _ = self.inputs.send(AdapterInput::Resume);
		}

		info!("Starting {} sync", self.currency.code);
		if let Err(e) = self.engine.start().await {
			warn!("{} engine failed to start: {}", self.currency.code, e);
			let transition = self.lock().machine.disconnected();
			self.publish_state(transition);
			return Err(e.into());
		}
		Ok(())
	}

	pub async fn refresh(&self) -> Result<(), AdapterError> {
		match self.state() {
			AdapterState::Syncing { .. } => {
				debug!("{} refresh coalesced into running sync", self.currency.code);
				Ok(())
			}
			AdapterState::NotSynced => {
				let _ = self.inputs.send(AdapterInput::Resume);
				self.engine.refresh().await.map_err(Into::into)
			}
			AdapterState::Synced => self.engine.refresh().await.map_err(Into::into),
		}
	}

	/// Stop syncing and wipe this wallet's state. Fails while a send holds the family gate.
	pub async fn clear(&self) -> Result<(), AdapterError> {
		let _exclusive = self
			.send_gate
			.try_write()
			.map_err(|_| AdapterError::SendInProgress)?;
		self.wipe().await
	}

	/// Wipe without touching the send gate; the caller holds it.
	pub(crate) async fn wipe(&self) -> Result<(), AdapterError> {
		self.engine.stop().await;
		self.engine.clear().await?;

		let mut inner = self.lock();
		self.publish_state(inner.machine.reset());
		if inner.balance != 0 {
			inner.balance = 0;
			self.bus.publish(AdapterEvent::BalanceChanged(0));
		}
		if inner.last_block_height.take().is_some() {
			self.bus.publish(AdapterEvent::LastBlockHeightChanged(None));
		}
		if !inner.transactions.is_empty() {
			inner.transactions.clear();
			self.bus
				.publish(AdapterEvent::TransactionRecordsChanged(Vec::new()));
		}
		inner.wiped = true;

		info!("Cleared {} wallet state", self.currency.code);
		Ok(())
	}

	pub fn quote_fee(&self, request: &FeeRequest) -> Result<FeeQuote, AdapterError> {
		fee::quote_fee(self.engine.as_ref(), request)
	}

	/// Quote, sign and broadcast a payment to `recipient`.
	///
	/// `request` carries the caller's validation result. `completion` runs exactly once on the
	/// runtime, after broadcast acknowledgement or on the first failure.
	pub fn send(
		&self,
		recipient: &str,
		request: Result<FeeRequest, AdapterError>,
		completion: SendCompletion,
	) {
		let prepared = self
			.send_gate
			.clone()
			.try_read_owned()
			.map_err(|_| AdapterError::SendInProgress)
			.and_then(|permit| {
				let request = request?;
				let quote = self.quote_fee(&request)?;
				let draft = PaymentDraft {
					recipient: recipient.to_string(),
					amount: quote.recipient_amount,
					fee: quote.fee,
					inputs: quote.inputs,
					change: quote.change,
				};
				Ok((permit, draft))
			});

		let engine = Arc::clone(&self.engine);
		let code = self.currency.code.clone();

		self.runtime.spawn(async move {
			let result = match prepared {
				Ok((_permit, draft)) => {
					debug!(
						"Sending {} {} to {} with fee {}",
						draft.amount, code, draft.recipient, draft.fee
					);
					submit(engine.as_ref(), &draft).await
				}
				Err(e) => Err(e),
			};

			match &result {
				Ok(hash) => info!("{} transaction {} broadcast", code, hash),
				Err(e) => warn!("{} send failed: {}", code, e),
			}
			completion(result);
		});
	}

	pub fn balance(&self) -> u64 {
		self.lock().balance
	}

	pub fn state(&self) -> AdapterState {
		self.lock().machine.state()
	}

	pub fn last_block_height(&self) -> Option<u64> {
		self.lock().last_block_height
	}

	/// Whether this core's wallet was wiped. A wiped core keeps serving its current holders but is
	/// never handed out again.
	pub fn is_wiped(&self) -> bool {
		self.lock().wiped
	}

	/// Known records, newest first.
	pub fn transaction_records(&self) -> Vec<TransactionRecord> {
		let mut records: Vec<_> = self.lock().transactions.values().cloned().collect();
		records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
		records
	}

	pub fn subscribe_balance(&self) -> Subscription<u64> {
		self.bus.subscribe_balance()
	}

	pub fn subscribe_state(&self) -> Subscription<AdapterState> {
		self.bus.subscribe_state()
	}

	pub fn subscribe_last_block_height(&self) -> Subscription<Option<u64>> {
		self.bus.subscribe_last_block_height()
	}

	pub fn subscribe_transaction_records(&self) -> Subscription<Vec<TransactionRecord>> {
		self.bus.subscribe_transaction_records()
	}

	pub fn debug_info(&self) -> String {
		let inner = self.lock();
		format!(
			"{} ({}) state={:?} balance={} height={:?} records={} runs={} engine[{}]",
			self.currency.code,
			self.currency.network.as_str(),
			inner.machine.state(),
			self.currency.format_amount(inner.balance),
			inner.last_block_height,
			inner.transactions.len(),
			inner.machine.runs(),
			self.engine.debug_info()
		)
	}
}

impl Drop for AdapterCore {
	fn drop(&mut self) {
		if let Some(pump) = self
			.pump
			.get_mut()
			.unwrap_or_else(|e| e.into_inner())
			.take()
		{
			pump.abort();
		}
	}
}

async fn drain(core: Weak<AdapterCore>, mut rx: mpsc::UnboundedReceiver<AdapterInput>) {
	while let Some(input) = rx.recv().await {
		let Some(core) = core.upgrade() else {
			break;
		};
		core.apply(input);
	}
}

async fn submit(engine: &dyn SyncEngine, draft: &PaymentDraft) -> Result<String, AdapterError> {
	let signed = engine.sign(draft)?;
	engine.broadcast(&signed).await.map_err(|e| match e {
		EngineError::Disconnected(reason) => AdapterError::BroadcastFailed(reason),
		other => other.into(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapter::records::tests::record;
	use crate::currency::{CurrencyFamily, NetworkKind};
	use crate::engine::devnet::tests::test_engine;
	use std::time::Duration;

	async fn core(dir: &std::path::Path) -> (Arc<AdapterCore>, Arc<crate::engine::DevnetEngine>) {
		let engine = test_engine(CurrencyFamily::Bitcoin, dir);
		let core = AdapterCore::new(
			Currency::bitcoin(NetworkKind::TestNet),
			engine.clone(),
			Arc::new(RwLock::new(())),
		)
		.unwrap();
		(core, engine)
	}

	fn inject(core: &AdapterCore, event: EngineEvent) {
		core.inputs.send(AdapterInput::Engine(event)).unwrap();
	}

	async fn next<T: Clone>(sub: &mut Subscription<T>) -> T {
		tokio::time::timeout(Duration::from_secs(5), sub.recv())
			.await
			.expect("timed out waiting for event")
			.expect("channel closed")
	}

	async fn wait_for(sub: &mut Subscription<AdapterState>, target: AdapterState) {
		loop {
			if next(sub).await == target {
				return;
			}
		}
	}

	#[tokio::test]
	async fn one_balance_change_yields_one_notification() {
		let dir = tempfile::tempdir().unwrap();
		let (core, _engine) = core(dir.path()).await;
		let mut balance = core.subscribe_balance();
		let mut height = core.subscribe_last_block_height();

		inject(&core, EngineEvent::BalanceChanged(5_000));
		inject(&core, EngineEvent::BalanceChanged(5_000));
		inject(&core, EngineEvent::BlockHeightChanged(7));

		assert_eq!(next(&mut balance).await, 5_000);
		// Height is queued after both balance events, so the pump has drained them.
		assert_eq!(next(&mut height).await, Some(7));
		assert!(balance.try_recv().is_none());
		assert_eq!(core.balance(), 5_000);
	}

	#[tokio::test]
	async fn data_after_disconnect_is_discarded_until_restart() {
		let dir = tempfile::tempdir().unwrap();
		let (core, _engine) = core(dir.path()).await;
		let mut state = core.subscribe_state();
		let mut balance = core.subscribe_balance();

		inject(&core, EngineEvent::SyncStarted);
		inject(&core, EngineEvent::Progress(0.5));
		inject(&core, EngineEvent::Disconnected("connection reset".into()));
		inject(&core, EngineEvent::BalanceChanged(42));
		inject(&core, EngineEvent::Completed);
		inject(&core, EngineEvent::SyncStarted);

		wait_for(&mut state, AdapterState::NotSynced).await;
		assert_eq!(
			next(&mut state).await,
			AdapterState::Syncing { progress: Some(0.0) }
		);
		assert!(balance.try_recv().is_none());
		assert_eq!(core.balance(), 0);
	}

	#[tokio::test]
	async fn duplicate_records_are_not_republished() {
		let dir = tempfile::tempdir().unwrap();
		let (core, _engine) = core(dir.path()).await;
		let mut records = core.subscribe_transaction_records();

		let a = record("a", 10, Some(1));
		inject(&core, EngineEvent::TransactionsChanged(vec![a.clone()]));
		inject(
			&core,
			EngineEvent::TransactionsChanged(vec![a.clone(), record("b", -4, None)]),
		);

		assert_eq!(next(&mut records).await.len(), 1);
		let second = next(&mut records).await;
		assert_eq!(second.len(), 1);
		assert_eq!(second[0].hash, "b");
		assert_eq!(core.transaction_records().len(), 2);
	}

	#[tokio::test]
	async fn start_syncs_and_coalesces() {
		let dir = tempfile::tempdir().unwrap();
		let (core, engine) = core(dir.path()).await;
		engine.fund(25_000);
		let mut state = core.subscribe_state();

		core.start().await.unwrap();
		core.start().await.unwrap();
		core.refresh().await.unwrap();

		wait_for(&mut state, AdapterState::Synced).await;
		assert_eq!(core.balance(), 25_000);
		assert_eq!(core.last_block_height(), engine.last_block_height());
		assert!(core.debug_info().contains("tBTC"));
	}

	#[tokio::test]
	async fn clear_is_refused_while_a_send_is_in_flight() {
		let dir = tempfile::tempdir().unwrap();
		let (core, engine) = core(dir.path()).await;
		engine.fund(100_000);
		let mut state = core.subscribe_state();
		core.start().await.unwrap();
		wait_for(&mut state, AdapterState::Synced).await;

		let (tx, rx) = tokio::sync::oneshot::channel();
		let request = FeeRequest {
			value: 10_000,
			recipient_script_len: 22,
			fee_rate: 2,
			sender_pays: true,
		};
		core.send(
			"tb1qrecipient",
			Ok(request),
			Box::new(move |result| {
				let _ = tx.send(result);
			}),
		);

		assert!(matches!(core.clear().await, Err(AdapterError::SendInProgress)));
		assert!(rx.await.unwrap().is_ok());
		core.clear().await.unwrap();
		assert_eq!(core.balance(), 0);
		assert_eq!(core.state(), AdapterState::NotSynced);
	}

	#[tokio::test]
	async fn wipe_publishes_cleared_height_and_records() {
		let dir = tempfile::tempdir().unwrap();
		let (core, engine) = core(dir.path()).await;
		engine.fund(15_000);
		let mut state = core.subscribe_state();
		core.start().await.unwrap();
		wait_for(&mut state, AdapterState::Synced).await;
		assert!(core.last_block_height().is_some());
		assert_eq!(core.transaction_records().len(), 1);
		assert!(!core.is_wiped());

		let mut height = core.subscribe_last_block_height();
		let mut records = core.subscribe_transaction_records();
		core.clear().await.unwrap();

		assert_eq!(next(&mut height).await, None);
		assert_eq!(core.last_block_height(), None);
		assert!(next(&mut records).await.is_empty());
		assert!(core.transaction_records().is_empty());
		assert!(core.is_wiped());
	}

	#[tokio::test]
	async fn rejected_request_completes_without_broadcast() {
		let dir = tempfile::tempdir().unwrap();
		let (core, engine) = core(dir.path()).await;

		let (tx, rx) = tokio::sync::oneshot::channel();
		core.send(
			"nowhere",
			Err(AdapterError::InvalidAddress("nowhere".into())),
			Box::new(move |result| {
				let _ = tx.send(result);
			}),
		);

		assert!(matches!(
			rx.await.unwrap(),
			Err(AdapterError::InvalidAddress(_))
		));
		assert_eq!(engine.broadcast_count(), 0);
	}
}
