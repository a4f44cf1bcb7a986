//! Wallet list for one logged-in user.
//!
//! A `Wallet` pairs a currency with its adapter and a record store fed from the adapter's
//! transaction channel. `WalletManager` builds the wallets on login, publishes the list whenever it
//! changes, and clears every currency family on logout.

use crate::adapter::{Adapter, AdapterError, RecordStore, Subscription};
use crate::currency::{AuthMaterial, Currency, CurrencyFamily};
use crate::factory::AdapterFactory;

use futures::future::join_all;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Wallet {
	pub currency: Currency,
	pub adapter: Arc<dyn Adapter>,
	pub records: Arc<RecordStore>,
}

pub struct WalletManager {
	factory: Arc<AdapterFactory>,
	wallets: RwLock<Vec<Wallet>>,
	updates: broadcast::Sender<Vec<Wallet>>,
}

impl WalletManager {
	pub fn new(factory: Arc<AdapterFactory>) -> Self {
		Self {
			factory,
			wallets: RwLock::new(Vec::new()),
			updates: broadcast::channel(16).0,
		}
	}

	pub fn factory(&self) -> &Arc<AdapterFactory> {
		&self.factory
	}

	/// Build and start a wallet for every supported currency in `currencies`.
	///
	/// Unsupported currencies are skipped. A wallet whose sync fails to start is still listed; its
	/// adapter reports `NotSynced` and can be started again.
	pub async fn init_wallets(
		&self,
		currencies: &[Currency],
		auth: &AuthMaterial,
	) -> Result<Vec<Wallet>, AdapterError> {
		let mut wallets = Vec::with_capacity(currencies.len());

		for currency in currencies {
			let Some(adapter) = self.factory.adapter(currency, auth)? else {
				info!("Skipping {}: no adapter for {}", currency.code, currency.family);
				continue;
			};

			let records = Arc::new(RecordStore::new());
			records.watch(adapter.as_ref());

			wallets.push(Wallet {
				currency: currency.clone(),
				adapter,
				records,
			});
		}

		let started = join_all(wallets.iter().map(|wallet| wallet.adapter.start())).await;
		for (wallet, result) in wallets.iter().zip(started) {
			if let Err(e) = result {
				warn!("Failed to start {} sync: {}", wallet.currency.code, e);
			}
		}

		info!("Initialized {} wallets", wallets.len());
		*self.wallets.write().unwrap_or_else(|e| e.into_inner()) = wallets.clone();
		let _ = self.updates.send(wallets.clone());
		Ok(wallets)
	}

	pub fn wallets(&self) -> Vec<Wallet> {
		self.wallets
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}

	pub fn wallet(&self, currency: &Currency) -> Option<Wallet> {
		self.wallets()
			.into_iter()
			.find(|wallet| &wallet.currency == currency)
	}

	pub fn subscribe_wallets(&self) -> Subscription<Vec<Wallet>> {
		Subscription::new(self.updates.subscribe())
	}

	/// Full logout: wipe every supported family and drop the wallet list.
	///
	/// Fails with `SendInProgress` while any wallet is sending; the list is kept in that case.
	pub async fn clear_wallets(&self) -> Result<(), AdapterError> {
		for family in [
			CurrencyFamily::Bitcoin,
			CurrencyFamily::Midnight,
			CurrencyFamily::Ethereum,
		] {
			if let Some(manager) = self.factory.family(family) {
				manager.clear().await?;
			}
		}

		let wallets =
			std::mem::take(&mut *self.wallets.write().unwrap_or_else(|e| e.into_inner()));
		for wallet in &wallets {
			wallet.records.clear_records();
		}
		let _ = self.updates.send(Vec::new());

		info!("Cleared {} wallets", wallets.len());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapter::AdapterState;
	use crate::adapter::tests::wait_for_state;
	use crate::currency::NetworkKind;
	use crate::currency::tests::test_auth;
	use crate::factory::tests::Fixture;
	use std::time::Duration;

	#[tokio::test]
	async fn init_skips_unsupported_and_publishes_the_list() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let manager = WalletManager::new(Arc::clone(&fixture.factory));

		let mut updates = manager.subscribe_wallets();
		let currencies = [
			Currency::bitcoin(NetworkKind::TestNet),
			Currency::ethereum(NetworkKind::TestNet),
			Currency::midnight(NetworkKind::TestNet),
		];
		let wallets = manager.init_wallets(&currencies, &test_auth()).await.unwrap();

		assert_eq!(wallets.len(), 2);
		assert_eq!(updates.recv().await.unwrap().len(), 2);
		assert!(manager.wallet(&currencies[1]).is_none());

		let btc = manager.wallet(&currencies[0]).unwrap();
		wait_for_state(btc.adapter.as_ref(), AdapterState::Synced).await;
		assert!(btc.adapter.last_block_height().is_some());
	}

	#[tokio::test]
	async fn records_follow_the_adapter_and_logout_clears_everything() {
		let dir = tempfile::tempdir().unwrap();
		let fixture = Fixture::new(dir.path());
		let btc = Currency::bitcoin(NetworkKind::TestNet);

		// Fund before login so the first sync delivers a record.
		let adapter = fixture.adapter(&btc, &test_auth());
		fixture.engine(&btc, &test_auth()).fund(21_000);

		let manager = WalletManager::new(Arc::clone(&fixture.factory));
		let wallets = manager.init_wallets(&[btc.clone()], &test_auth()).await.unwrap();
		let wallet = &wallets[0];
		assert!(Arc::ptr_eq(&wallet.adapter, &adapter));

		wait_for_state(adapter.as_ref(), AdapterState::Synced).await;
		tokio::time::timeout(Duration::from_secs(5), async {
			while wallet.records.non_filled_records().is_empty() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
		assert_eq!(wallet.records.non_filled_records()[0].amount, 21_000);

		let mut updates = manager.subscribe_wallets();
		manager.clear_wallets().await.unwrap();
		assert!(manager.wallets().is_empty());
		assert!(updates.recv().await.unwrap().is_empty());
		assert!(wallet.records.is_empty());
		assert_eq!(adapter.balance(), 0);
	}
}
