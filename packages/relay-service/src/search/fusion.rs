use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashMap},
};

use crate::ScoredUnit;

pub const LEXICAL: &str = "lexical";
pub const VECTOR: &str = "vector";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Weights {
	pub lexical: f32,
	pub vector: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FusedCandidate {
	pub unit_id: String,
	pub score: f32,
	/// Normalized score of every signal used by the request; a signal that has no score for
	/// this unit reports 0.0.
	pub breakdown: BTreeMap<String, f32>,
}

/// Anything the final ordering can be applied to.
pub trait Ranked {
	fn score(&self) -> f32;

	/// Event timestamp or episode end time; more recent ranks first on equal scores.
	fn recency(&self) -> i64;

	fn unit_id(&self) -> &str;
}

/// Min-max normalization of raw lexical scores within the candidate set. A single candidate, or a
/// set whose scores are all equal, normalizes to 1.0.
pub fn normalize_lexical(hits: &[ScoredUnit]) -> HashMap<String, f32> {
	let finite = hits.iter().map(|hit| hit.score).filter(|score| score.is_finite());
	let (min, max) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), score| {
		(min.min(score), max.max(score))
	});
	let span = max - min;
	let mut out = HashMap::with_capacity(hits.len());

	for hit in hits {
		let normalized = if !hit.score.is_finite() {
			0.0
		} else if span > f32::EPSILON {
			((hit.score - min) / span).clamp(0.0, 1.0)
		} else {
			1.0
		};

		out.entry(hit.unit_id.clone())
			.and_modify(|current: &mut f32| *current = current.max(normalized))
			.or_insert(normalized);
	}

	out
}

/// Vector scores are already on [0, 1]; only clamping is applied.
pub fn normalize_vector(hits: &[ScoredUnit]) -> HashMap<String, f32> {
	let mut out = HashMap::with_capacity(hits.len());

	for hit in hits {
		let normalized = if hit.score.is_finite() { hit.score.clamp(0.0, 1.0) } else { 0.0 };

		out.entry(hit.unit_id.clone())
			.and_modify(|current: &mut f32| *current = current.max(normalized))
			.or_insert(normalized);
	}

	out
}

/// Union of both candidate sets by unit id. `None` means the signal was not used.
///
/// The final score is the weighted mean over the signals present for the unit, so a signal
/// missing for one unit hands its weight to the other. A unit with a single present signal, or
/// whose present signals all carry zero weight, takes the plain mean of its normalized scores.
/// The output is ordered by unit id.
pub fn fuse(
	lexical: Option<&[ScoredUnit]>,
	vector: Option<&[ScoredUnit]>,
	weights: Weights,
) -> Vec<FusedCandidate> {
	let lexical = lexical.map(normalize_lexical);
	let vector = vector.map(normalize_vector);
	let mut unit_ids: Vec<&String> =
		lexical.iter().chain(vector.iter()).flat_map(|scores| scores.keys()).collect();

	unit_ids.sort();
	unit_ids.dedup();

	unit_ids
		.into_iter()
		.map(|unit_id| {
			let mut breakdown = BTreeMap::new();
			let mut weighted = 0.0_f32;
			let mut weight_sum = 0.0_f32;
			let mut plain = 0.0_f32;
			let mut present = 0_u8;

			for (name, scores, weight) in
				[(LEXICAL, &lexical, weights.lexical), (VECTOR, &vector, weights.vector)]
			{
				let Some(scores) = scores else {
					continue;
				};

				match scores.get(unit_id) {
					Some(score) => {
						weighted += weight * score;
						weight_sum += weight;
						plain += score;
						present += 1;

						breakdown.insert(name.to_string(), *score);
					},
					None => {
						breakdown.insert(name.to_string(), 0.0);
					},
				}
			}

			let score = match present {
				0 => 0.0,
				1 => plain,
				_ if weight_sum > 0.0 => weighted / weight_sum,
				_ => plain / f32::from(present),
			}
			.clamp(0.0, 1.0);

			FusedCandidate { unit_id: unit_id.clone(), score, breakdown }
		})
		.collect()
}

/// Final ordering: score descending, then recency descending, then unit id ascending. Items
/// below `min_score` are dropped before `limit` is applied.
pub fn rank<T>(mut items: Vec<T>, min_score: f32, limit: usize) -> Vec<T>
where
	T: Ranked,
{
	items.retain(|item| item.score() >= min_score);
	items.sort_by(|left, right| {
		cmp_f32_desc(left.score(), right.score())
			.then_with(|| right.recency().cmp(&left.recency()))
			.then_with(|| left.unit_id().cmp(right.unit_id()))
	});
	items.truncate(limit);

	items
}

pub fn cmp_f32_desc(a: f32, b: f32) -> Ordering {
	match (a.is_nan(), b.is_nan()) {
		(true, true) => Ordering::Equal,
		(true, false) => Ordering::Greater,
		(false, true) => Ordering::Less,
		(false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
	}
}
