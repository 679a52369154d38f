#![forbid(unsafe_code)]

//! UTF-16 offset helpers. Emote positions are exchanged in UTF-16 code units,
//! which is how both chat platforms index message text.

/// Length of `s` in UTF-16 code units.
#[inline]
pub fn utf16_len(s: &str) -> usize {
	s.chars().map(char::len_utf16).sum()
}

/// Convert an inclusive code-point range `[start, end]` of `text` into a
/// half-open UTF-16 range. Returns `None` when the range is inverted or runs
/// past the end of `text`.
pub fn codepoint_range_to_utf16(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
	if end < start {
		return None;
	}

	let mut units = 0usize;
	let mut utf16_start = None;
	for (idx, ch) in text.chars().enumerate() {
		if idx == start {
			utf16_start = Some(units);
		}
		units += ch.len_utf16();
		if idx == end {
			return utf16_start.map(|s| (s, units));
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn counts_surrogate_pairs() {
		assert_eq!(utf16_len(""), 0);
		assert_eq!(utf16_len("abc"), 3);
		assert_eq!(utf16_len("é"), 1);
		assert_eq!(utf16_len("😀"), 2);
		assert_eq!(utf16_len("a😀b"), 4);
	}

	#[test]
	fn converts_ranges_after_astral_chars() {
		// "😀 Kappa": Kappa spans code points 2..=6, UTF-16 units 3..8
		assert_eq!(codepoint_range_to_utf16("😀 Kappa", 2, 6), Some((3, 8)));
		assert_eq!(codepoint_range_to_utf16("Kappa", 0, 4), Some((0, 5)));
	}

	#[test]
	fn rejects_out_of_range() {
		assert_eq!(codepoint_range_to_utf16("abc", 1, 5), None);
		assert_eq!(codepoint_range_to_utf16("abc", 2, 1), None);
	}

	proptest! {
		#[test]
		fn utf16_len_matches_encoder(s in "\\PC*") {
			prop_assert_eq!(utf16_len(&s), s.encode_utf16().count());
		}

		#[test]
		fn whole_string_range_covers_all_units(s in "\\PC{1,40}") {
			let n = s.chars().count();
			prop_assert_eq!(codepoint_range_to_utf16(&s, 0, n - 1), Some((0, utf16_len(&s))));
		}
	}
}
