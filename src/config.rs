//! Runtime configuration read from `WALLET_*` environment variables.
//!
//! The binary loads a `.env` file first when one is present. Unparseable values are logged and
//! replaced with their defaults.

use crate::currency::NetworkKind;
use crate::engine::DevnetConfig;
use crate::fee_rates::{FeeRatePriority, FeeRates};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
	pub network: NetworkKind,
	pub data_dir: PathBuf,
	pub fee_rates: FeeRates,
	/// Mempool-style fee estimation endpoint; static rates are used when unset.
	pub fee_rate_url: Option<String>,
	pub fee_priority: FeeRatePriority,
	pub devnet: DevnetConfig,
}

impl Default for AdapterConfig {
	fn default() -> Self {
		Self {
			network: NetworkKind::TestNet,
			data_dir: PathBuf::from("./wallet-data"),
			fee_rates: FeeRates::default(),
			fee_rate_url: None,
			fee_priority: FeeRatePriority::default(),
			devnet: DevnetConfig::default(),
		}
	}
}

impl AdapterConfig {
	pub fn from_env() -> Self {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Build from any variable source; `from_env` reads the process environment.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
		let defaults = Self::default();
		let var = |name: &str| {
			lookup(name)
				.map(|v| v.trim().to_string())
				.filter(|v| !v.is_empty())
		};

		let test_mode = parse_or(&var, "WALLET_TEST_MODE", true);
		let network = if test_mode {
			NetworkKind::TestNet
		} else {
			NetworkKind::MainNet
		};

		let fee_rates = FeeRates {
			low: parse_or(&var, "WALLET_FEE_RATE_LOW", defaults.fee_rates.low),
			medium: parse_or(&var, "WALLET_FEE_RATE_MEDIUM", defaults.fee_rates.medium),
			high: parse_or(&var, "WALLET_FEE_RATE_HIGH", defaults.fee_rates.high),
		}
		.normalized();

		let devnet = DevnetConfig {
			sync_blocks: parse_or(&var, "WALLET_DEVNET_SYNC_BLOCKS", defaults.devnet.sync_blocks),
			block_interval: Duration::from_millis(parse_or(
				&var,
				"WALLET_DEVNET_BLOCK_INTERVAL_MS",
				defaults.devnet.block_interval.as_millis() as u64,
			)),
		};

		Self {
			network,
			data_dir: var("WALLET_DATA_DIR")
				.map(PathBuf::from)
				.unwrap_or(defaults.data_dir),
			fee_rates,
			fee_rate_url: var("WALLET_FEE_RATE_URL"),
			fee_priority: parse_or(&var, "WALLET_FEE_PRIORITY", defaults.fee_priority),
			devnet,
		}
	}
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
	T: FromStr + std::fmt::Debug,
{
	match var(name) {
		None => default,
		Some(raw) => raw.parse().unwrap_or_else(|_| {
			warn!("Ignoring invalid {}={:?}, using {:?}", name, raw, default);
			default
		}),
	}
}
