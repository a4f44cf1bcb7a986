//!
//! Fee rate sources for rate-priced currencies.
//!
//! Adapters read rates synchronously from a provider when they quote a fee. A remote provider keeps
//! the last rates it fetched and refreshes them in the background, so quoting never waits on the
//! network.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FeeRateError {
	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("Invalid fee rate response: {0}")]
	InvalidResponse(String),

	#[error("Unknown fee priority: {0}")]
	UnknownPriority(String),
}

/// How quickly a payment should confirm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeRatePriority {
	Low,
	#[default]
	Medium,
	High,
}

impl FromStr for FeeRatePriority {
	type Err = FeeRateError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"low" => Ok(FeeRatePriority::Low),
			"medium" => Ok(FeeRatePriority::Medium),
			"high" => Ok(FeeRatePriority::High),
			other => Err(FeeRateError::UnknownPriority(other.to_string())),
		}
	}
}

/// Rates in base units per virtual byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
	pub low: u64,
	pub medium: u64,
	pub high: u64,
}

impl Default for FeeRates {
	fn default() -> Self {
		Self {
			low: 1,
			medium: 5,
			high: 10,
		}
	}
}

impl FeeRates {
	pub fn get(&self, priority: FeeRatePriority) -> u64 {
		match priority {
			FeeRatePriority::Low => self.low,
			FeeRatePriority::Medium => self.medium,
			FeeRatePriority::High => self.high,
		}
	}

	/// Every rate at least 1, and higher priorities never cheaper than lower ones.
	pub fn normalized(self) -> Self {
		let low = self.low.max(1);
		let medium = self.medium.max(low);
		let high = self.high.max(medium);
		Self { low, medium, high }
	}
}

pub trait FeeRateProvider: Send + Sync {
	fn fee_rate(&self, priority: FeeRatePriority) -> u64;
}

/// Fixed rates, e.g. from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticFeeRateProvider {
	rates: FeeRates,
}

impl StaticFeeRateProvider {
	pub fn new(rates: FeeRates) -> Self {
		Self {
			rates: rates.normalized(),
		}
	}
}

impl FeeRateProvider for StaticFeeRateProvider {
	fn fee_rate(&self, priority: FeeRatePriority) -> u64 {
		self.rates.get(priority)
	}
}

/// Body of a mempool-style `/v1/fees/recommended` endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
	fastest_fee: u64,
	half_hour_fee: u64,
	hour_fee: u64,
}

impl From<RecommendedFees> for FeeRates {
	fn from(fees: RecommendedFees) -> Self {
		FeeRates {
			low: fees.hour_fee,
			medium: fees.half_hour_fee,
			high: fees.fastest_fee,
		}
		.normalized()
	}
}

/// Rates fetched from a fee estimation service, falling back to the last known rates.
pub struct RemoteFeeRateProvider {
	http_client: Client,
	url: String,
	rates: RwLock<FeeRates>,
}

impl RemoteFeeRateProvider {
	pub fn new(url: String, fallback: FeeRates) -> Result<Self, FeeRateError> {
		let http_client = Client::builder().timeout(Duration::from_secs(10)).build()?;

		Ok(Self {
			http_client,
			url,
			rates: RwLock::new(fallback.normalized()),
		})
	}

	pub fn rates(&self) -> FeeRates {
		*self.rates.read().unwrap_or_else(|e| e.into_inner())
	}

	/// Fetch current rates and cache them.
	pub async fn refresh(&self) -> Result<FeeRates, FeeRateError> {
		debug!("Fetching fee rates from {}", self.url);
		let response = self.http_client.get(&self.url).send().await?;

		if !response.status().is_success() {
			return Err(FeeRateError::InvalidResponse(format!(
				"HTTP {}",
				response.status()
			)));
		}

		let fees: RecommendedFees = response
			.json()
			.await
			.map_err(|e| FeeRateError::InvalidResponse(e.to_string()))?;
		let rates = FeeRates::from(fees);

		*self.rates.write().unwrap_or_else(|e| e.into_inner()) = rates;
		info!(
			"Fee rates updated: low={} medium={} high={}",
			rates.low, rates.medium, rates.high
		);
		Ok(rates)
	}

	/// Refresh rates every `interval` until the provider is dropped.
	pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
		let provider = Arc::downgrade(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				ticker.tick().await;
				let Some(provider) = provider.upgrade() else {
					break;
				};
				if let Err(e) = provider.refresh().await {
					warn!("Keeping cached fee rates: {}", e);
				}
			}
		})
	}
}

impl FeeRateProvider for RemoteFeeRateProvider {
	fn fee_rate(&self, priority: FeeRatePriority) -> u64 {
		self.rates().get(priority)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn priority_parses_case_insensitively() {
		assert_eq!("HIGH".parse::<FeeRatePriority>().unwrap(), FeeRatePriority::High);
		assert_eq!(" low ".parse::<FeeRatePriority>().unwrap(), FeeRatePriority::Low);
		assert!(matches!(
			"urgent".parse::<FeeRatePriority>(),
			Err(FeeRateError::UnknownPriority(_))
		));
	}

	#[test]
	fn rates_are_normalized() {
		let provider = StaticFeeRateProvider::new(FeeRates {
			low: 0,
			medium: 8,
			high: 3,
		});
		assert_eq!(provider.fee_rate(FeeRatePriority::Low), 1);
		assert_eq!(provider.fee_rate(FeeRatePriority::Medium), 8);
		assert_eq!(provider.fee_rate(FeeRatePriority::High), 8);
	}

	#[test]
	fn recommended_fees_map_to_priorities() {
		let body = r#"{"fastestFee":25,"halfHourFee":12,"hourFee":6,"economyFee":3,"minimumFee":1}"#;
		let fees: RecommendedFees = serde_json::from_str(body).unwrap();
		let rates = FeeRates::from(fees);
		assert_eq!(
			rates,
			FeeRates {
				low: 6,
				medium: 12,
				high: 25
			}
		);
	}

	#[tokio::test]
	async fn unreachable_service_keeps_fallback_rates() {
		let provider =
			RemoteFeeRateProvider::new("http://127.0.0.1:9/v1/fees/recommended".to_string(), FeeRates::default())
				.unwrap();
		assert!(provider.refresh().await.is_err());
		assert_eq!(provider.fee_rate(FeeRatePriority::Medium), 5);
	}
}
