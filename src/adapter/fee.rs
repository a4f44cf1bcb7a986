//! Fee quoting and coin selection.
//!
//! A quote is computed fresh on every call from the engine's current unspent outputs. Outputs are
//! taken largest first until they cover the payment. The fee is re-estimated for each candidate
//! input set and never drops below the engine's minimum relay fee.
//!
//! A change output is only paid for when the change is at least the engine's dust threshold. When
//! the sender pays, smaller change is added to the fee instead. A recipient-pays quote spends
//! exactly `value`, so sub-dust change stays an output there.
//!
//! With `sender_pays` the fee is added on top of the value; otherwise it is carved out of the value
//! and the recipient receives `value - fee`. `value_spent` is what leaves the wallet either way,
//! excluding change.

use crate::adapter::AdapterError;
use crate::engine::{FeeEstimateRequest, SyncEngine, UnspentOutput};

use serde::Serialize;

/// Candidate payment to quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRequest {
	pub value: u64,
	pub recipient_script_len: usize,
	pub fee_rate: u64,
	pub sender_pays: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
	pub fee: u64,
	pub sender_pays: bool,
	/// Amount leaving the wallet, excluding change.
	pub value_spent: u64,
	/// Amount the recipient receives.
	pub recipient_amount: u64,
	pub change: u64,
	#[serde(skip)]
	pub inputs: Vec<UnspentOutput>,
}

fn estimate(
	engine: &dyn SyncEngine,
	request: &FeeRequest,
	inputs: &[UnspentOutput],
	change_output: bool,
) -> u64 {
	engine
		.estimate_fee(FeeEstimateRequest {
			target_value: request.value,
			inputs,
			change_output,
			recipient_script_len: request.recipient_script_len,
			fee_rate: request.fee_rate,
		})
		.max(engine.min_relay_fee())
}

/// Quote a payment against the engine's current outputs.
///
/// Fails with `InsufficientAmount { fee }` when the outputs cannot cover the payment; `fee` is then
/// the estimate with every output spent. Fails with `AmountTooSmall` when the recipient would
/// receive nothing.
pub fn quote_fee(engine: &dyn SyncEngine, request: &FeeRequest) -> Result<FeeQuote, AdapterError> {
	let mut available = engine.unspent_outputs();
	available.sort_by(|a, b| b.value.cmp(&a.value));

	let dust = engine.dust_threshold().max(1);
	let mut selected: Vec<UnspentOutput> = Vec::new();
	let mut selected_total: u64 = 0;

	for utxo in available {
		selected_total = selected_total.saturating_add(utxo.value);
		selected.push(utxo);

		if let Some(spend) = fit(engine, request, &selected, selected_total, dust) {
			return finish(request, spend, selected);
		}
	}

	let fee = estimate(engine, request, &selected, false);
	Err(AdapterError::InsufficientAmount { fee })
}

struct Spend {
	fee: u64,
	value_spent: u64,
	change: u64,
}

/// How `selected` pays for the request, if it covers it.
fn fit(
	engine: &dyn SyncEngine,
	request: &FeeRequest,
	selected: &[UnspentOutput],
	selected_total: u64,
	dust: u64,
) -> Option<Spend> {
	let spent = |fee: u64| {
		if request.sender_pays {
			request.value.saturating_add(fee)
		} else {
			request.value
		}
	};

	let fee = estimate(engine, request, selected, true);
	if let Some(change) = selected_total.checked_sub(spent(fee)) {
		if change >= dust {
			return Some(Spend {
				fee,
				value_spent: spent(fee),
				change,
			});
		}
	}

	let fee = estimate(engine, request, selected, false);
	let leftover = selected_total.checked_sub(spent(fee))?;
	if request.sender_pays {
		return Some(Spend {
			fee: fee + leftover,
			value_spent: selected_total,
			change: 0,
		});
	}
	if leftover == 0 {
		return Some(Spend {
			fee,
			value_spent: request.value,
			change: 0,
		});
	}
	Some(Spend {
		fee: estimate(engine, request, selected, true),
		value_spent: request.value,
		change: leftover,
	})
}

fn finish(
	request: &FeeRequest,
	spend: Spend,
	inputs: Vec<UnspentOutput>,
) -> Result<FeeQuote, AdapterError> {
	let Spend {
		fee,
		value_spent,
		change,
	} = spend;
	let recipient_amount = if request.sender_pays {
		request.value
	} else {
		request.value.saturating_sub(fee)
	};
	if recipient_amount == 0 {
		return Err(AdapterError::AmountTooSmall { fee });
	}

	Ok(FeeQuote {
		fee,
		sender_pays: request.sender_pays,
		value_spent,
		recipient_amount,
		change,
		inputs,
	})
}
