use std::{collections::HashSet, sync::LazyLock};

use rust_stemmers::{Algorithm, Stemmer};
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

static STEMMER: LazyLock<Stemmer> = LazyLock::new(|| Stemmer::create(Algorithm::English));

pub fn normalize_whitespace(text: &str) -> String {
	text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-folded, stemmed word tokens in document order. Duplicates are kept so callers can
/// compute term frequencies.
pub fn tokenize(text: &str) -> Vec<String> {
	let normalized: String = text.nfkc().collect();

	normalized.unicode_words().filter_map(stem_word).collect()
}

/// Distinct query terms, first occurrence order.
pub fn query_terms(query: &str) -> Vec<String> {
	let mut seen = HashSet::new();

	tokenize(query).into_iter().filter(|term| seen.insert(term.clone())).collect()
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
	match text.char_indices().nth(max_chars) {
		Some((byte_idx, _)) => &text[..byte_idx],
		None => text,
	}
}

/// Returns a window of at most `max_chars` characters around the first word whose stem is in
/// `terms`, or the head of the content when nothing matches.
pub fn snippet(content: &str, terms: &[String], max_chars: usize) -> String {
	let normalized = normalize_whitespace(content);

	if max_chars == 0 {
		return String::new();
	}

	let hit = normalized.unicode_word_indices().find_map(|(byte_idx, word)| {
		let stemmed = stem_word(word)?;

		terms.contains(&stemmed).then_some(byte_idx)
	});
	let start_char = match hit {
		Some(byte_idx) => normalized[..byte_idx].chars().count().saturating_sub(max_chars / 4),
		None => 0,
	};
	let window: String = normalized.chars().skip(start_char).take(max_chars).collect();

	window.trim().to_string()
}

fn stem_word(word: &str) -> Option<String> {
	let lowered = word.to_lowercase();
	let trimmed = lowered.trim_matches(|c: char| !c.is_alphanumeric());

	if trimmed.is_empty() {
		return None;
	}

	Some(STEMMER.stem(trimmed).into_owned())
}
