/// Cosine similarity, or `None` when the vectors differ in length or either has zero norm.
pub fn cosine(left: &[f32], right: &[f32]) -> Option<f32> {
	if left.len() != right.len() || left.is_empty() {
		return None;
	}

	let mut dot = 0.0_f64;
	let mut left_norm = 0.0_f64;
	let mut right_norm = 0.0_f64;

	for (l, r) in left.iter().zip(right) {
		let (l, r) = (f64::from(*l), f64::from(*r));

		dot += l * r;
		left_norm += l * l;
		right_norm += r * r;
	}

	if left_norm == 0.0 || right_norm == 0.0 {
		return None;
	}

	Some((dot / (left_norm.sqrt() * right_norm.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// Maps a cosine in [-1, 1] onto [0, 1]: opposite 0.0, orthogonal 0.5, identical 1.0.
pub fn unit_score(cosine: f32) -> f32 {
	((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// pgvector's `<=>` yields cosine distance (`1 - cos`).
pub fn unit_score_from_distance(distance: f32) -> f32 {
	unit_score(1.0 - distance)
}
