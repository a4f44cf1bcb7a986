//! Turning pasted or scanned payment strings into a [`PaymentRequest`].

use crate::utils::parse_token_amount;

use serde::Serialize;
use tracing::debug;

/// Structured form of a pasted or scanned payment string.
///
/// `address` is empty when no valid address could be extracted; callers validate it before use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaymentRequest {
	pub address: String,
	/// Requested amount in base units.
	pub amount: Option<u64>,
	pub label: Option<String>,
	pub message: Option<String>,
}

/// Parses bare addresses and `scheme:address?amount=..&label=..` URIs (BIP21 style).
///
/// Parsing never fails. Malformed query fields are dropped, and unknown ones are ignored.
#[derive(Debug, Clone)]
pub struct PaymentUriParser {
	schemes: &'static [&'static str],
	decimals: u32,
}

impl PaymentUriParser {
	pub const fn new(schemes: &'static [&'static str], decimals: u32) -> Self {
		Self { schemes, decimals }
	}

	pub fn parse(&self, input: &str, is_valid_address: impl Fn(&str) -> bool) -> PaymentRequest {
		let input = input.trim();
		let body = self.strip_scheme(input);

		let (path, query) = match body.split_once('?') {
			Some((path, query)) => (path, Some(query)),
			None => (body, None),
		};

		let candidate = path.trim();
		let address = if is_valid_address(candidate) {
			candidate.to_string()
		} else {
			debug!("No valid address in payment string");
			String::new()
		};

		let mut request = PaymentRequest {
			address,
			..Default::default()
		};

		for pair in query.into_iter().flat_map(|q| q.split('&')) {
			let Some((key, value)) = pair.split_once('=') else {
				continue;
			};
			let value = value.replace('+', " ");
			let Ok(value) = urlencoding::decode(&value).map(|v| v.into_owned()) else {
				continue;
			};

			match key.to_ascii_lowercase().as_str() {
				"amount" => request.amount = parse_token_amount(&value, self.decimals),
				"label" if !value.is_empty() => request.label = Some(value),
				"message" if !value.is_empty() => request.message = Some(value),
				_ => {}
			}
		}

		request
	}

	fn strip_scheme<'a>(&self, input: &'a str) -> &'a str {
		if let Some((scheme, rest)) = input.split_once(':') {
			if self
				.schemes
				.iter()
				.any(|known| known.eq_ignore_ascii_case(scheme))
			{
				return rest.trim_start_matches("//");
			}
		}
		input
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const PARSER: PaymentUriParser = PaymentUriParser::new(&["bitcoin"], 8);

	fn valid(address: &str) -> bool {
		address == "tb1qvalid" || address == "TB1QVALID"
	}

	#[test]
	fn bare_address_round_trips() {
		let request = PARSER.parse("tb1qvalid", valid);
		assert_eq!(request.address, "tb1qvalid");
		assert_eq!(request.amount, None);
	}

	#[test]
	fn full_uri_is_parsed() {
		let request = PARSER.parse(
			"bitcoin:tb1qvalid?amount=0.0015&label=Coffee%20Shop&message=thanks+again",
			valid,
		);
		assert_eq!(request.address, "tb1qvalid");
		assert_eq!(request.amount, Some(150_000));
		assert_eq!(request.label.as_deref(), Some("Coffee Shop"));
		assert_eq!(request.message.as_deref(), Some("thanks again"));
	}

	#[test]
	fn scheme_is_case_insensitive() {
		let request = PARSER.parse("BITCOIN:TB1QVALID?AMOUNT=1", valid);
		assert_eq!(request.address, "TB1QVALID");
		assert_eq!(request.amount, Some(100_000_000));
	}

	#[test]
	fn malformed_fields_are_dropped() {
		let request = PARSER.parse(
			"bitcoin:tb1qvalid?amount=abc&label&req-foo=1&label=%FF&message=",
			valid,
		);
		assert_eq!(request.address, "tb1qvalid");
		assert_eq!(request.amount, None);
		assert_eq!(request.label, None);
		assert_eq!(request.message, None);
	}

	#[test]
	fn invalid_address_yields_empty_address() {
		let request = PARSER.parse("bitcoin:nonsense?amount=2", valid);
		assert_eq!(request.address, "");
		assert_eq!(request.amount, Some(200_000_000));

		assert_eq!(PARSER.parse("", valid), PaymentRequest::default());
		assert_eq!(PARSER.parse("ethereum:tb1qvalid", valid).address, "");
	}
}
