//! Small formatting helpers used in log lines.

/// Shortens an identifier for display.
///
/// Keeps the first 8 characters and appends `..` when longer.
pub fn truncate_id(id: &str) -> String {
	match id.char_indices().nth(8) {
		Some((idx, _)) => format!("{}..", &id[..idx]),
		None => id.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_truncate_id() {
		assert_eq!(truncate_id("order-1"), "order-1");
		assert_eq!(truncate_id("12345678"), "12345678");
		assert_eq!(truncate_id("123456789"), "12345678..");
		assert_eq!(truncate_id("c0ffee00-0000-4000"), "c0ffee00..");
	}
}
