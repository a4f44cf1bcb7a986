use crate::adapter::{
	Adapter, AdapterCore, AdapterError, AdapterState, FeeQuote, FeeRequest, PaymentRequest,
	PaymentUriParser, SendCompletion, Subscription, TransactionRecord,
};
use crate::currency::{Currency, NetworkKind};
use crate::engine::EngineError;
use crate::fee_rates::{FeeRatePriority, FeeRateProvider};

use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network};
use std::str::FromStr;
use std::sync::Arc;

pub const CONFIRMATIONS_THRESHOLD: u32 = 6;

/// Script length assumed when no recipient is known yet (P2WSH and P2TR outputs).
const WORST_CASE_SCRIPT_LEN: usize = 34;

const PARSER: PaymentUriParser = PaymentUriParser::new(&["bitcoin"], 8);

pub fn network(kind: NetworkKind) -> Network {
	match kind {
		NetworkKind::MainNet => Network::Bitcoin,
		NetworkKind::TestNet => Network::Testnet,
	}
}

/// BIP84 receive address `m/84'/coin'/0'/0/0` for a BIP39 seed.
pub fn derive_receive_address(seed: &[u8], kind: NetworkKind) -> Result<String, EngineError> {
	let network = network(kind);
	let secp = Secp256k1::new();
	let master = Xpriv::new_master(network, seed)
		.map_err(|e| EngineError::KeyDerivation(e.to_string()))?;

	// Coin type 1 for every test network.
	let coin_type = if kind.is_test() { 1 } else { 0 };
	let path = DerivationPath::from_str(&format!("m/84'/{}'/0'/0/0", coin_type))
		.map_err(|e| EngineError::KeyDerivation(e.to_string()))?;

	let child = master
		.derive_priv(&secp, &path)
		.map_err(|e| EngineError::KeyDerivation(e.to_string()))?;
	let public_key = CompressedPublicKey(child.private_key.public_key(&secp));

	Ok(Address::p2wpkh(&public_key, network).to_string())
}

/// Parse an address and check it belongs to `kind`'s network.
pub fn parse_address(address: &str, kind: NetworkKind) -> Result<Address, AdapterError> {
	Address::from_str(address.trim())
		.map_err(|e| AdapterError::InvalidAddress(format!("{}: {}", address, e)))?
		.require_network(network(kind))
		.map_err(|e| AdapterError::InvalidAddress(format!("{}: {}", address, e)))
}

pub struct BitcoinAdapter {
	core: Arc<AdapterCore>,
	fee_rates: Arc<dyn FeeRateProvider>,
	priority: FeeRatePriority,
}

impl BitcoinAdapter {
	pub fn new(
		core: Arc<AdapterCore>,
		fee_rates: Arc<dyn FeeRateProvider>,
		priority: FeeRatePriority,
	) -> Self {
		Self {
			core,
			fee_rates,
			priority,
		}
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
		let recipient_script_len = match address {
			Some(address) => parse_address(address, self.core.currency().network)?
				.script_pubkey()
				.len(),
			None => WORST_CASE_SCRIPT_LEN,
		};

		Ok(FeeRequest {
			value,
			recipient_script_len,
			fee_rate: self.fee_rates.fee_rate(self.priority),
			sender_pays,
		})
	}
}

#[async_trait::async_trait]
impl Adapter for BitcoinAdapter {
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
		format!(
			"{} fee_rate={}",
			self.core.debug_info(),
			self.fee_rates.fee_rate(self.priority)
		)
	}

	fn refreshable(&self) -> bool {
		true
	}

	async fn start(&self) -> Result<(), AdapterError> {
		self.core.start().await
	}

	async fn refresh(&self) -> Result<(), AdapterError> {
		self.core.refresh().await
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
