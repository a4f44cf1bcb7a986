//! Adapter construction and currency-family lifecycle.
//!
//! `AdapterFactory` hands out at most one live adapter per `(family, network, wallet id)`. Asking
//! again with the same inputs returns the same instance while anyone still holds it, and a rebuilt
//! adapter binds to the same persisted chain state through its engine. A currency whose family has
//! no adapter implementation yields `None`.
//!
//! An adapter whose wallet was wiped is never reused: the next request after a clear builds a fresh
//! adapter with a fresh engine and keys, as a login after logout does.
//!
//! Each supported family has a `FamilyManager`. It owns the family's send gate, shared by every
//! adapter of that family, and performs the family-wide wipe used on full logout. The wipe takes the
//! gate exclusively and fails with `SendInProgress` instead of waiting for in-flight sends.

use crate::adapter::{Adapter, AdapterCore, AdapterError};
use crate::currencies::{BitcoinAdapter, MidnightAdapter};
use crate::currency::{AuthMaterial, Currency, CurrencyFamily, NetworkKind};
use crate::engine::EngineProvider;
use crate::fee_rates::{FeeRatePriority, FeeRateProvider};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identity of one adapter instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterKey {
	pub family: CurrencyFamily,
	pub network: NetworkKind,
	pub wallet_id: String,
}

impl AdapterKey {
	pub fn new(currency: &Currency, auth: &AuthMaterial) -> Self {
		Self {
			family: currency.family,
			network: currency.network,
			wallet_id: auth.wallet_id().to_string(),
		}
	}
}

/// Lifecycle owner for one currency family.
pub struct FamilyManager {
	family: CurrencyFamily,
	send_gate: Arc<RwLock<()>>,
	provider: Arc<dyn EngineProvider>,
	live: Mutex<Vec<Weak<AdapterCore>>>,
}

impl FamilyManager {
	fn new(family: CurrencyFamily, provider: Arc<dyn EngineProvider>) -> Self {
		Self {
			family,
			send_gate: Arc::new(RwLock::new(())),
			provider,
			live: Mutex::new(Vec::new()),
		}
	}

	pub fn family(&self) -> CurrencyFamily {
		self.family
	}

	fn register(&self, core: &Arc<AdapterCore>) {
		let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
		live.retain(|core| core.strong_count() > 0);
		live.push(Arc::downgrade(core));
	}

	fn live_cores(&self) -> Vec<Arc<AdapterCore>> {
		self.live
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.iter()
			.filter_map(Weak::upgrade)
			.collect()
	}

	/// Irreversibly wipe every wallet's state for this family.
	///
	/// Live adapters stop syncing, drop their keys and reset to `NotSynced`. Fails with
	/// `SendInProgress`, without wiping anything, while any adapter of the family is sending.
	pub async fn clear(&self) -> Result<(), AdapterError> {
		let _exclusive = self
			.send_gate
			.try_write()
			.map_err(|_| AdapterError::SendInProgress)?;

		let cores = self.live_cores();
		for core in &cores {
			core.wipe().await?;
		}
		self.provider.clear_family(self.family).await?;

		info!(
			"Cleared all {} wallet state ({} live adapters)",
			self.family,
			cores.len()
		);
		Ok(())
	}
}

struct CachedAdapter {
	adapter: Weak<dyn Adapter>,
	core: Weak<AdapterCore>,
}

impl CachedAdapter {
	/// The cached adapter if someone still holds it and its wallet was not wiped.
	fn reusable(&self) -> Option<Arc<dyn Adapter>> {
		let core = self.core.upgrade()?;
		if core.is_wiped() {
			return None;
		}
		self.adapter.upgrade()
	}
}

pub struct AdapterFactory {
	provider: Arc<dyn EngineProvider>,
	fee_rates: Arc<dyn FeeRateProvider>,
	fee_priority: FeeRatePriority,
	families: HashMap<CurrencyFamily, Arc<FamilyManager>>,
	adapters: Mutex<HashMap<AdapterKey, CachedAdapter>>,
}

impl AdapterFactory {
	pub fn new(
		provider: Arc<dyn EngineProvider>,
		fee_rates: Arc<dyn FeeRateProvider>,
		fee_priority: FeeRatePriority,
	) -> Self {
		let families = [CurrencyFamily::Bitcoin, CurrencyFamily::Midnight]
			.into_iter()
			.map(|family| {
				let manager = FamilyManager::new(family, Arc::clone(&provider));
				(family, Arc::new(manager))
			})
			.collect();

		Self {
			provider,
			fee_rates,
			fee_priority,
			families,
			adapters: Mutex::new(HashMap::new()),
		}
	}

	pub fn supports(&self, family: CurrencyFamily) -> bool {
		self.families.contains_key(&family)
	}

	/// The lifecycle manager for a supported family.
	pub fn family(&self, family: CurrencyFamily) -> Option<Arc<FamilyManager>> {
		self.families.get(&family).cloned()
	}

	/// The adapter for `currency` and `auth`, or `None` when the family is unsupported.
	///
	/// Must be called from within a Tokio runtime.
	pub fn adapter(
		&self,
		currency: &Currency,
		auth: &AuthMaterial,
	) -> Result<Option<Arc<dyn Adapter>>, AdapterError> {
		let Some(family) = self.families.get(&currency.family) else {
			debug!("No adapter implementation for {}", currency.family);
			return Ok(None);
		};

		let key = AdapterKey::new(currency, auth);
		let mut adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(cached) = adapters.get(&key) {
			if let Some(existing) = cached.reusable() {
				debug!("Reusing {} adapter", currency.code);
				return Ok(Some(existing));
			}
			debug!("Replacing wiped or dropped {} adapter", currency.code);
		}

		let engine = self.provider.build(currency, auth)?;
		let core = AdapterCore::new(currency.clone(), engine, Arc::clone(&family.send_gate))?;
		family.register(&core);
		let cached_core = Arc::downgrade(&core);

		let adapter: Arc<dyn Adapter> = match currency.family {
			CurrencyFamily::Bitcoin => Arc::new(BitcoinAdapter::new(
				core,
				Arc::clone(&self.fee_rates),
				self.fee_priority,
			)),
			CurrencyFamily::Midnight => Arc::new(MidnightAdapter::new(core)),
			CurrencyFamily::Ethereum => return Ok(None),
		};

		adapters.retain(|_, cached| cached.adapter.strong_count() > 0);
		adapters.insert(
			key,
			CachedAdapter {
				adapter: Arc::downgrade(&adapter),
				core: cached_core,
			},
		);
		info!(
			"Created {} adapter on {}",
			currency.code,
			currency.network.as_str()
		);
		Ok(Some(adapter))
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::adapter::AdapterState;
	use crate::adapter::tests::wait_for_state;
	use crate::currency::tests::test_auth;
	use crate::engine::devnet::tests::fast_config;
	use crate::engine::{DevnetEngine, DevnetEngineProvider};
	use crate::fee_rates::{FeeRates, StaticFeeRateProvider};
	use crate::storage::{FileChainStateRepository, StateKey};
	use std::path::Path;
	use tokio::sync::oneshot;

	pub(crate) struct Fixture {
		pub(crate) factory: Arc<AdapterFactory>,
		pub(crate) provider: Arc<DevnetEngineProvider>,
	}

	impl Fixture {
		pub(crate) fn new(dir: &Path) -> Self {
			let provider = Arc::new(DevnetEngineProvider::new(
				Arc::new(FileChainStateRepository::new(dir.to_path_buf())),
				fast_config(),
			));
			let factory = Arc::new(AdapterFactory::new(
				provider.clone(),
				Arc::new(StaticFeeRateProvider::new(FeeRates::default())),
				FeeRatePriority::Medium,
			));
			Self { factory, provider }
		}

		pub(crate) fn adapter(&self, currency: &Currency, auth: &AuthMaterial) -> Arc<dyn Adapter> {
			self.factory.adapter(currency, auth).unwrap().unwrap()
		}

		pub(crate) fn engine(&self, currency: &Currency, auth: &AuthMaterial) -> Arc<DevnetEngine> {
			let key = StateKey {
				family: currency.family,
				network: currency.network,
				wallet_id: auth.wallet_id().to_string(),
			};
			self.provider.engine(&key).unwrap()
		}
	}

	fn other_auth() -> AuthMaterial {
		let words = "legal winner thank year wave sausage worth useful legal winner thank yellow";
		AuthMaterial::from_words(&words.split(' ').collect::<Vec<_>>()).unwrap()
	}

	async fn funded(
		fixture: &Fixture,
		currency: &Currency,
		auth: &AuthMaterial,
		amount: u64,
	) -> Arc<dyn Adapter> {
		let adapter = fixture.adapter(currency, auth);
		fixture.engine(currency, auth).fund(amount);
		adapter.start().await.unwrap();
		wait_for_state(adapter.as_ref(), AdapterState::Synced).await;
		adapter
	}

	pub(crate) fn send(
		adapter: &dyn Adapter,
		address: &str,
		value: u64,
	) -> oneshot::Receiver<Result<String, AdapterError>> {
		let (tx, rx) = oneshot::channel();
		adapter.send(
			address,
			value,
			Box::new(move |result| {
				let _ = tx.send(result);
			}),
		);
		rx
	}

	#[tokio::test]
	async fn same_inputs_yield_same_instance() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);

		let a = fixture.adapter(&btc, &test_auth());
		let b = fixture.adapter(&btc, &test_auth());
		assert!(Arc::ptr_eq(&a, &b));

		let mainnet = fixture.adapter(&Currency::bitcoin(NetworkKind::MainNet), &test_auth());
		assert!(!Arc::ptr_eq(&a, &mainnet));
		let other = fixture.adapter(&btc, &other_auth());
		assert!(!Arc::ptr_eq(&a, &other));
	}

	#[tokio::test]
	async fn unsupported_family_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let eth = Currency::ethereum(NetworkKind::TestNet);

		assert!(fixture.factory.adapter(&eth, &test_auth()).unwrap().is_none());
		assert!(!fixture.factory.supports(CurrencyFamily::Ethereum));
		assert!(fixture.factory.family(CurrencyFamily::Ethereum).is_none());
	}

	#[tokio::test]
	async fn clear_on_one_handle_wipes_state_seen_by_the_other() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);

		let a = funded(&fixture, &btc, &test_auth(), 80_000).await;
		let b = fixture.adapter(&btc, &test_auth());
		assert_eq!(b.balance(), 80_000);

		a.clear().await.unwrap();
		assert_eq!(b.balance(), 0);
		assert_eq!(b.state(), AdapterState::NotSynced);
		assert!(b.transaction_records().is_empty());
	}

	#[tokio::test]
	async fn rebuilt_adapter_resumes_persisted_state() {
		let dir = tempfile::tempdir().unwrap();
		let btc = Currency::bitcoin(NetworkKind::TestNet);
		{
			let fixture = Fixture::new(dir.path());
			funded(&fixture, &btc, &test_auth(), 12_345).await;
		}

		let fixture = Fixture::new(dir.path());
		let adapter = fixture.adapter(&btc, &test_auth());
		adapter.start().await.unwrap();
		wait_for_state(adapter.as_ref(), AdapterState::Synced).await;
		assert_eq!(adapter.balance(), 12_345);
	}

	#[tokio::test]
	async fn send_above_balance_never_reaches_the_network() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);
		let adapter = funded(&fixture, &btc, &test_auth(), 50_000).await;
		let recipient = fixture.adapter(&btc, &other_auth()).receive_address();

		let result = send(adapter.as_ref(), &recipient, 50_001).await.unwrap();
		assert!(matches!(result, Err(AdapterError::InsufficientAmount { .. })));

		let result = send(adapter.as_ref(), "not-an-address", 1_000).await.unwrap();
		assert!(matches!(result, Err(AdapterError::InvalidAddress(_))));

		assert_eq!(fixture.engine(&btc, &test_auth()).broadcast_count(), 0);
	}

	#[tokio::test]
	async fn send_broadcasts_and_updates_balance() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);
		let adapter = funded(&fixture, &btc, &test_auth(), 100_000).await;
		let recipient = fixture.adapter(&btc, &other_auth()).receive_address();

		let quote = adapter.fee(30_000, Some(&recipient), true).unwrap();
		let mut records = adapter.subscribe_transaction_records();
		let hash = send(adapter.as_ref(), &recipient, 30_000).await.unwrap().unwrap();

		assert_eq!(fixture.engine(&btc, &test_auth()).broadcast_count(), 1);
		let batch = records.recv().await.unwrap();
		assert_eq!(batch[0].hash, hash);
		assert_eq!(batch[0].amount, -(30_000 + quote.fee as i64));
		assert_eq!(adapter.balance(), 100_000 - 30_000 - quote.fee);
	}

	#[tokio::test]
	async fn broadcast_failures_are_reported_through_completion() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let dust = Currency::midnight(NetworkKind::TestNet);
		let adapter = funded(&fixture, &dust, &test_auth(), 5_000_000).await;
		let recipient = fixture.adapter(&dust, &other_auth()).receive_address();
		let engine = fixture.engine(&dust, &test_auth());

		engine.fail_next_broadcast();
		let result = send(adapter.as_ref(), &recipient, 1_000_000).await.unwrap();
		assert!(matches!(result, Err(AdapterError::BroadcastFailed(_))));

		engine.disconnect("node went away");
		let result = send(adapter.as_ref(), &recipient, 1_000_000).await.unwrap();
		assert!(matches!(result, Err(AdapterError::BroadcastFailed(_))));
		wait_for_state(adapter.as_ref(), AdapterState::NotSynced).await;
	}

	#[tokio::test]
	async fn family_clear_is_refused_during_a_send() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);
		let adapter = funded(&fixture, &btc, &test_auth(), 100_000).await;
		let recipient = fixture.adapter(&btc, &other_auth()).receive_address();
		let family = fixture.factory.family(CurrencyFamily::Bitcoin).unwrap();

		let pending = send(adapter.as_ref(), &recipient, 10_000);
		assert!(matches!(family.clear().await, Err(AdapterError::SendInProgress)));
		assert!(pending.await.unwrap().is_ok());

		family.clear().await.unwrap();
		assert_eq!(adapter.balance(), 0);
	}

	#[tokio::test]
	async fn family_clear_wipes_every_wallet_and_drops_keys() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);
		let dust = Currency::midnight(NetworkKind::TestNet);

		let first = funded(&fixture, &btc, &test_auth(), 70_000).await;
		let second = funded(&fixture, &btc, &other_auth(), 30_000).await;
		let midnight = funded(&fixture, &dust, &test_auth(), 9_000_000).await;

		fixture
			.factory
			.family(CurrencyFamily::Bitcoin)
			.unwrap()
			.clear()
			.await
			.unwrap();

		assert_eq!(first.balance(), 0);
		assert_eq!(second.balance(), 0);
		assert_eq!(midnight.balance(), 9_000_000);
		assert!(!dir.path().join("bitcoin").exists());

		// Keys are gone until the user logs in again.
		first.start().await.unwrap();
		wait_for_state(first.as_ref(), AdapterState::Synced).await;
		let recipient = second.receive_address();
		let result = send(first.as_ref(), &recipient, 1_000).await.unwrap();
		assert!(matches!(result, Err(AdapterError::Unauthorized(_))));
	}

	#[tokio::test]
	async fn login_after_family_clear_gets_a_working_adapter() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);

		let before = funded(&fixture, &btc, &test_auth(), 60_000).await;
		fixture
			.factory
			.family(CurrencyFamily::Bitcoin)
			.unwrap()
			.clear()
			.await
			.unwrap();

		// The old handle is still alive, but logging in again must not hand it back.
		let after = funded(&fixture, &btc, &test_auth(), 40_000).await;
		assert!(!Arc::ptr_eq(&before, &after));
		assert!(Arc::ptr_eq(&after, &fixture.adapter(&btc, &test_auth())));
		assert_eq!(after.balance(), 40_000);

		let recipient = fixture.adapter(&btc, &other_auth()).receive_address();
		let hash = send(after.as_ref(), &recipient, 5_000).await.unwrap().unwrap();
		assert!(!hash.is_empty());
		assert_eq!(fixture.engine(&btc, &test_auth()).broadcast_count(), 1);
	}

	#[tokio::test]
	async fn single_clear_also_retires_the_instance() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);

		let first = fixture.adapter(&btc, &test_auth());
		first.clear().await.unwrap();
		let second = fixture.adapter(&btc, &test_auth());
		assert!(!Arc::ptr_eq(&first, &second));
		assert_eq!(second.state(), AdapterState::NotSynced);
	}

	#[tokio::test]
	async fn receive_addresses_validate_and_parse() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());

		for currency in [
			Currency::bitcoin(NetworkKind::TestNet),
			Currency::bitcoin(NetworkKind::MainNet),
			Currency::midnight(NetworkKind::TestNet),
			Currency::midnight(NetworkKind::MainNet),
		] {
			let adapter = fixture.adapter(&currency, &test_auth());
			let address = adapter.receive_address();
			assert!(adapter.validate(&address).is_ok(), "{}", address);
			assert_eq!(adapter.parse(&address).address, address);
			assert!(adapter.validate("").is_err());
			assert!(adapter.validate("not-an-address").is_err());
		}
	}
}
