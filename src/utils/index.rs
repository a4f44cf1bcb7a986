/// Render a base-unit amount with `decimals` fractional digits.
pub fn format_token_amount(amount: u64, decimals: u32) -> String {
	if decimals == 0 {
		return amount.to_string();
	}
	let Some(scale) = 10u64.checked_pow(decimals) else {
		// Every u64 is below the scale, so the whole part is zero.
		return format!("0.{:0width$}", amount, width = decimals as usize);
	};
	format!(
		"{}.{:0width$}",
		amount / scale,
		amount % scale,
		width = decimals as usize
	)
}

/// Parse a decimal string (e.g. "0.0015") into base units.
///
/// Returns `None` for negative, malformed, or over-precise input, or on overflow.
pub fn parse_token_amount(value: &str, decimals: u32) -> Option<u64> {
	let value = value.trim();
	if value.is_empty() || value.starts_with('-') || value.starts_with('+') {
		return None;
	}

	let (whole, fraction) = match value.split_once('.') {
		Some((whole, fraction)) => (whole, fraction),
		None => (value, ""),
	};
	if whole.is_empty() && fraction.is_empty() {
		return None;
	}
	if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
		return None;
	}

	let fraction = fraction.trim_end_matches('0');
	if fraction.len() > decimals as usize {
		return None;
	}

	let scale = 10u64.checked_pow(decimals)?;
	let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
	let fraction_units: u64 = if fraction.is_empty() {
		0
	} else {
		let padded = format!("{:0<width$}", fraction, width = decimals as usize);
		padded.parse().ok()?
	};

	whole.checked_mul(scale)?.checked_add(fraction_units)
}
