use bip39::Mnemonic;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::engine::EngineError;

/// Protocol family a currency belongs to. One adapter implementation exists per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyFamily {
	Bitcoin,
	Midnight,
	Ethereum,
}

impl CurrencyFamily {
	pub fn as_str(&self) -> &'static str {
		match self {
			CurrencyFamily::Bitcoin => "bitcoin",
			CurrencyFamily::Midnight => "midnight",
			CurrencyFamily::Ethereum => "ethereum",
		}
	}
}

impl fmt::Display for CurrencyFamily {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkKind {
	MainNet,
	TestNet,
}

impl NetworkKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			NetworkKind::MainNet => "mainnet",
			NetworkKind::TestNet => "testnet",
		}
	}

	pub fn is_test(&self) -> bool {
		matches!(self, NetworkKind::TestNet)
	}
}

/// A currency the wallet can hold. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
	pub id: String,
	pub code: String,
	pub family: CurrencyFamily,
	pub network: NetworkKind,
	pub decimals: u32,
}

impl Currency {
	pub fn new(
		id: impl Into<String>,
		code: impl Into<String>,
		family: CurrencyFamily,
		network: NetworkKind,
		decimals: u32,
	) -> Self {
		Self {
			id: id.into(),
			code: code.into(),
			family,
			network,
			decimals,
		}
	}

	pub fn bitcoin(network: NetworkKind) -> Self {
		let code = if network.is_test() { "tBTC" } else { "BTC" };
		Self::new("bitcoin", code, CurrencyFamily::Bitcoin, network, 8)
	}

	pub fn midnight(network: NetworkKind) -> Self {
		let code = if network.is_test() { "tDUST" } else { "DUST" };
		Self::new("midnight", code, CurrencyFamily::Midnight, network, 6)
	}

	/// Listed but without an adapter implementation.
	pub fn ethereum(network: NetworkKind) -> Self {
		let code = if network.is_test() { "tETH" } else { "ETH" };
		Self::new("ethereum", code, CurrencyFamily::Ethereum, network, 18)
	}

	pub fn format_amount(&self, amount: u64) -> String {
		format!(
			"{} {}",
			crate::utils::format_token_amount(amount, self.decimals),
			self.code
		)
	}
}

/// Mnemonic words plus the stable wallet identifier derived from them.
///
/// The words are handed to the engine binding at construction time only. `Debug` output never
/// includes them.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthMaterial {
	words: Vec<String>,
	wallet_id: String,
}

impl AuthMaterial {
	/// Validate a BIP39 phrase and derive its wallet identifier.
	pub fn from_words<S: AsRef<str>>(words: &[S]) -> Result<Self, EngineError> {
		let phrase = words
			.iter()
			.map(|w| w.as_ref().trim().to_lowercase())
			.collect::<Vec<_>>()
			.join(" ");
		let mnemonic =
			Mnemonic::parse(&phrase).map_err(|e| EngineError::InvalidMnemonic(e.to_string()))?;

		let normalized = mnemonic.to_string();
		let wallet_id = hex::encode(Sha256::digest(normalized.as_bytes()));

		Ok(Self {
			words: normalized.split_whitespace().map(str::to_string).collect(),
			wallet_id,
		})
	}

	pub fn wallet_id(&self) -> &str {
		&self.wallet_id
	}

	pub fn words(&self) -> &[String] {
		&self.words
	}

	/// BIP39 seed bytes (empty passphrase).
	pub fn seed(&self) -> Result<[u8; 64], EngineError> {
		let mnemonic = Mnemonic::parse(self.words.join(" "))
			.map_err(|e| EngineError::InvalidMnemonic(e.to_string()))?;
		Ok(mnemonic.to_seed(""))
	}
}

impl fmt::Debug for AuthMaterial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AuthMaterial")
			.field("words", &"<redacted>")
			.field("wallet_id", &self.wallet_id)
			.finish()
	}
}

/// Generate a fresh 12-word BIP39 phrase.
pub fn generate_words() -> Result<Vec<String>, EngineError> {
	let mut entropy = [0u8; 16];
	rand::rng().fill(&mut entropy);
	let mnemonic =
		Mnemonic::from_entropy(&entropy).map_err(|e| EngineError::InvalidMnemonic(e.to_string()))?;
	Ok(mnemonic
		.to_string()
		.split_whitespace()
		.map(str::to_string)
		.collect())
}
