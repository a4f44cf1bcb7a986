use crate::adapter::{
	Adapter, AdapterCore, AdapterError, AdapterState, FeeQuote, FeeRequest, PaymentRequest,
	PaymentUriParser, SendCompletion, Subscription, TransactionRecord,
};
use crate::currency::{Currency, NetworkKind};
use crate::engine::EngineError;

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32m, Hrp};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Fee charged for every Midnight transaction, in DUST base units.
pub const MIDNIGHT_FLAT_FEE: u64 = 50_000;

pub const CONFIRMATIONS_THRESHOLD: u32 = 1;

const SHIELDED_ADDRESS_TYPE: &str = "shield-addr";
const COIN_PUBLIC_KEY_LEN: usize = 32;

const PARSER: PaymentUriParser = PaymentUriParser::new(&["midnight"], 6);

#[derive(Error, Debug)]
pub enum MidnightAddressError {
	#[error("invalid bech32m encoding: {0}")]
	Encoding(String),
	#[error("prefix first part != 'mn'")]
	PrefixInvalidConstant,
	#[error("prefix missing type")]
	PrefixMissingType,
}

/// Bech32m address with an `mn_<type>[_<network>]` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidnightAddress {
	pub type_: String,
	pub network: Option<String>,
	pub data: Vec<u8>,
}

fn network_suffix(kind: NetworkKind) -> Option<String> {
	match kind {
		NetworkKind::MainNet => None,
		NetworkKind::TestNet => Some("test".to_string()),
	}
}

impl MidnightAddress {
	pub fn decode(encoded_data: &str) -> Result<Self, MidnightAddressError> {
		// Only the Bech32m checksum is valid; a classic Bech32 string is rejected here.
		let checked = CheckedHrpstring::new::<Bech32m>(encoded_data)
			.map_err(|e| MidnightAddressError::Encoding(e.to_string()))?;
		let data = checked.byte_iter().collect::<Vec<u8>>();
		let hrp = checked.hrp().as_str().to_ascii_lowercase();
		let prefix_parts = hrp.split('_').collect::<Vec<&str>>();
		prefix_parts
			.first()
			.filter(|c| *c == &"mn")
			.ok_or(MidnightAddressError::PrefixInvalidConstant)?;
		let type_ = prefix_parts
			.get(1)
			.ok_or(MidnightAddressError::PrefixMissingType)?
			.to_string();
		let network = prefix_parts.get(2).map(|s| s.to_string());

		Ok(Self {
			type_,
			network,
			data,
		})
	}

	pub fn encode(&self) -> Result<String, MidnightAddressError> {
		let network_str = match &self.network {
			Some(network) => format!("_{}", network),
			None => "".to_string(),
		};

		let hrp = Hrp::parse(&format!("mn_{}{}", self.type_, network_str))
			.map_err(|e| MidnightAddressError::Encoding(e.to_string()))?;
		bech32::encode::<Bech32m>(hrp, &self.data)
			.map_err(|e| MidnightAddressError::Encoding(e.to_string()))
	}

	/// Shielded address for a BIP39 seed: coin public key followed by encryption public key.
	pub fn from_seed(seed: &[u8], kind: NetworkKind) -> Self {
		let coin_public_key = Sha256::new()
			.chain_update(seed)
			.chain_update(b"midnight:coin-pk")
			.finalize();
		let enc_public_key = Sha256::new()
			.chain_update(seed)
			.chain_update(b"midnight:enc-pk")
			.finalize();

		Self {
			type_: SHIELDED_ADDRESS_TYPE.to_string(),
			network: network_suffix(kind),
			data: [&coin_public_key[..], &enc_public_key[..]].concat(),
		}
	}
}

pub fn derive_receive_address(seed: &[u8], kind: NetworkKind) -> Result<String, EngineError> {
	MidnightAddress::from_seed(seed, kind)
		.encode()
		.map_err(|e| EngineError::KeyDerivation(e.to_string()))
}

/// Decode a shielded address and check it belongs to `kind`'s network.
pub fn parse_address(address: &str, kind: NetworkKind) -> Result<MidnightAddress, AdapterError> {
	let invalid = |reason: &dyn std::fmt::Display| {
		AdapterError::InvalidAddress(format!("{}: {}", address, reason))
	};

	let decoded = MidnightAddress::decode(address.trim()).map_err(|e| invalid(&e))?;
	if decoded.type_ != SHIELDED_ADDRESS_TYPE {
		return Err(invalid(&format!("unsupported address type {}", decoded.type_)));
	}
	if decoded.network != network_suffix(kind) {
		return Err(invalid(&format!(
			"address is for network {:?}",
			decoded.network.as_deref().unwrap_or("mainnet")
		)));
	}
	if decoded.data.len() < COIN_PUBLIC_KEY_LEN {
		return Err(invalid(&"payload too short"));
	}
	Ok(decoded)
}

pub struct MidnightAdapter {
	core: Arc<AdapterCore>,
}

impl MidnightAdapter {
	pub fn new(core: Arc<AdapterCore>) -> Self {
		Self { core }
	}

	pub fn core(&self) -> &Arc<AdapterCore> {
		&self.core
	}

	fn fee_request(
		&self,
		value: u64,
		address: Option<&str>,
		sender_pays: bool,
	) -> Result<FeeRequest, AdapterError> {
		if let Some(address) = address {
			self.validate(address)?;
		}
		Ok(FeeRequest {
			value,
			recipient_script_len: 0,
			fee_rate: 0,
			sender_pays,
		})
	}
}

#[async_trait::async_trait]
impl Adapter for MidnightAdapter {
	fn currency(&self) -> &Currency {
		self.core.currency()
	}

	fn balance(&self) -> u64 {
		self.core.balance()
	}

	fn subscribe_balance(&self) -> Subscription<u64> {
		self.core.subscribe_balance()
	}

	fn state(&self) -> AdapterState {
		self.core.state()
	}

	fn subscribe_state(&self) -> Subscription<AdapterState> {
		self.core.subscribe_state()
	}

	fn confirmations_threshold(&self) -> u32 {
		CONFIRMATIONS_THRESHOLD
	}

	fn last_block_height(&self) -> Option<u64> {
		self.core.last_block_height()
	}

	fn subscribe_last_block_height(&self) -> Subscription<Option<u64>> {
		self.core.subscribe_last_block_height()
	}

	fn transaction_records(&self) -> Vec<TransactionRecord> {
		self.core.transaction_records()
	}

	fn subscribe_transaction_records(&self) -> Subscription<Vec<TransactionRecord>> {
		self.core.subscribe_transaction_records()
	}

	fn debug_info(&self) -> String {
		self.core.debug_info()
	}

	// The engine streams new blocks continuously; there is nothing to poll.
	fn refreshable(&self) -> bool {
		false
	}

	async fn start(&self) -> Result<(), AdapterError> {
		self.core.start().await
	}

	async fn refresh(&self) -> Result<(), AdapterError> {
		debug!("Ignoring refresh for {}", self.core.currency().code);
		Ok(())
	}

	async fn clear(&self) -> Result<(), AdapterError> {
		self.core.clear().await
	}

	fn send(&self, address: &str, value: u64, completion: SendCompletion) {
		let request = self.fee_request(value, Some(address), true);
		self.core.send(address.trim(), request, completion);
	}

	fn fee(
		&self,
		value: u64,
		address: Option<&str>,
		sender_pays: bool,
	) -> Result<FeeQuote, AdapterError> {
		let request = self.fee_request(value, address, sender_pays)?;
		self.core.quote_fee(&request)
	}

	fn validate(&self, address: &str) -> Result<(), AdapterError> {
		parse_address(address, self.core.currency().network).map(|_| ())
	}

	fn parse(&self, payment: &str) -> PaymentRequest {
		PARSER.parse(payment, |address| self.validate(address).is_ok())
	}

	fn receive_address(&self) -> String {
		self.core.engine().receive_address()
	}
}
