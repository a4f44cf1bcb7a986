use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use wallet_adapters::adapter::{Adapter, AdapterState, BusError};
use wallet_adapters::currency::generate_words;
use wallet_adapters::engine::DevnetEngineProvider;
use wallet_adapters::fee_rates::{FeeRateProvider, RemoteFeeRateProvider, StaticFeeRateProvider};
use wallet_adapters::storage::{FileChainStateRepository, StateKey};
use wallet_adapters::{AdapterConfig, AdapterFactory, AuthMaterial, Currency, WalletManager};

const FEE_RATE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() {
	dotenv::dotenv().ok();

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let config = AdapterConfig::from_env();
	info!(
		"Starting wallet adapters on {} (data in {})",
		config.network.as_str(),
		config.data_dir.display()
	);

	let repository = Arc::new(FileChainStateRepository::new(config.data_dir.clone()));
	let provider = Arc::new(DevnetEngineProvider::new(repository, config.devnet.clone()));

	let fee_rates: Arc<dyn FeeRateProvider> = match &config.fee_rate_url {
		Some(url) => match RemoteFeeRateProvider::new(url.clone(), config.fee_rates) {
			Ok(remote) => {
				let remote = Arc::new(remote);
				remote.spawn_refresh(FEE_RATE_REFRESH_INTERVAL);
				remote
			}
			Err(e) => {
				warn!("Fee rate service unavailable, using static rates: {}", e);
				Arc::new(StaticFeeRateProvider::new(config.fee_rates))
			}
		},
		None => Arc::new(StaticFeeRateProvider::new(config.fee_rates)),
	};

	let factory = Arc::new(AdapterFactory::new(
		provider.clone(),
		fee_rates,
		config.fee_priority,
	));
	let manager = WalletManager::new(Arc::clone(&factory));

	let auth = match std::env::var("WALLET_MNEMONIC") {
		Ok(phrase) => AuthMaterial::from_words(&phrase.split_whitespace().collect::<Vec<_>>()),
		Err(_) => generate_words().and_then(|words| AuthMaterial::from_words(&words)),
	};
	let auth = match auth {
		Ok(auth) => auth,
		Err(e) => {
			error!("Failed to load wallet words: {}", e);
			return;
		}
	};
	let recipient_auth = match generate_words().and_then(|words| AuthMaterial::from_words(&words)) {
		Ok(auth) => auth,
		Err(e) => {
			error!("Failed to generate recipient words: {}", e);
			return;
		}
	};
	info!("Wallet {}", auth.wallet_id());

	let currencies = [
		Currency::bitcoin(config.network),
		Currency::midnight(config.network),
		Currency::ethereum(config.network),
	];

	// Build the adapters up front so the devnet can fund them before the first sync.
	let mut held = Vec::new();
	for currency in &currencies {
		match factory.adapter(currency, &auth) {
			Ok(Some(adapter)) => held.push(adapter),
			Ok(None) => {}
			Err(e) => {
				error!("Failed to build {} adapter: {}", currency.code, e);
				return;
			}
		}
		let key = StateKey {
			family: currency.family,
			network: currency.network,
			wallet_id: auth.wallet_id().to_string(),
		};
		if let Some(engine) = provider.engine(&key) {
			let amount = 10u64.pow(currency.decimals);
			let txid = engine.fund(amount);
			info!(
				"Funded {} with {} in {}",
				currency.code,
				currency.format_amount(amount),
				txid
			);
		}
	}

	let wallets = match manager.init_wallets(&currencies, &auth).await {
		Ok(wallets) => wallets,
		Err(e) => {
			error!("Failed to initialize wallets: {}", e);
			return;
		}
	};
	drop(held);

	for wallet in &wallets {
		let adapter = wallet.adapter.as_ref();
		let code = &wallet.currency.code;

		if let Err(e) = wait_until_synced(adapter).await {
			error!("{} did not sync: {}", code, e);
			continue;
		}
		info!(
			"{} synced at height {:?}: balance {}, receive address {}",
			code,
			adapter.last_block_height(),
			wallet.currency.format_amount(adapter.balance()),
			adapter.receive_address()
		);

		let recipient = match factory.adapter(&wallet.currency, &recipient_auth) {
			Ok(Some(recipient)) => recipient.receive_address(),
			Ok(None) => continue,
			Err(e) => {
				error!("Failed to build recipient for {}: {}", code, e);
				continue;
			}
		};

		let value = adapter.balance() / 4;
		match adapter.fee(value, Some(&recipient), true) {
			Ok(quote) => info!(
				"Sending {} to {} costs {}",
				wallet.currency.format_amount(quote.recipient_amount),
				recipient,
				wallet.currency.format_amount(quote.fee)
			),
			Err(e) => {
				warn!("Cannot quote a {} payment: {}", code, e);
				continue;
			}
		}

		let (tx, rx) = oneshot::channel();
		adapter.send(
			&recipient,
			value,
			Box::new(move |result| {
				let _ = tx.send(result);
			}),
		);
		match rx.await {
			Ok(Ok(hash)) => info!("{} payment broadcast as {}", code, hash),
			Ok(Err(e)) => error!("{} payment failed: {}", code, e),
			Err(_) => error!("{} payment completion was dropped", code),
		}

		info!(
			"{} balance now {} with {} records",
			code,
			wallet.currency.format_amount(adapter.balance()),
			wallet.records.len()
		);
		info!("{}", adapter.debug_info());
	}
}

async fn wait_until_synced(adapter: &dyn Adapter) -> Result<(), String> {
	let mut states = adapter.subscribe_state();
	if adapter.state() == AdapterState::Synced {
		return Ok(());
	}

	tokio::time::timeout(SYNC_TIMEOUT, async {
		loop {
			match states.recv().await {
				Ok(AdapterState::Synced) => return Ok(()),
				Ok(_) | Err(BusError::Lagged(_)) => {}
				Err(BusError::Closed) => return Err("state channel closed".to_string()),
			}
		}
	})
	.await
	.map_err(|_| format!("timed out after {:?}", SYNC_TIMEOUT))?
}
