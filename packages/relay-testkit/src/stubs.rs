//! Embedding providers that never leave the process.

use std::{
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};

use relay_config::EmbeddingProviderConfig;
use relay_domain::text;
use relay_service::{BoxFuture, EmbeddingProvider, Error, Result};

/// Bag-of-stems vectors: each token adds 1.0 to a bucket picked by its blake3 hash, so texts
/// sharing words point in similar directions.
#[derive(Default)]
pub struct HashEmbedding {
	calls: AtomicUsize,
}
impl HashEmbedding {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn vector(text: &str, dimensions: usize) -> Vec<f32> {
		let dimensions = dimensions.max(1);
		let mut vec = vec![0.0_f32; dimensions];

		for token in text::tokenize(text) {
			let hash = blake3::hash(token.as_bytes());
			let bytes = hash.as_bytes();
			let bucket = u64::from_le_bytes([
				bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
			]) % dimensions as u64;

			vec[bucket as usize] += 1.0;
		}

		if vec.iter().all(|value| *value == 0.0) {
			vec[0] = 1.0;
		}

		vec
	}
}
impl EmbeddingProvider for HashEmbedding {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		_model: &'a str,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		let dimensions = cfg.dimensions as usize;
		let vectors = texts.iter().map(|text| Self::vector(text, dimensions)).collect();

		Box::pin(async move { Ok(vectors) })
	}
}

/// Returns the same vector for every input.
pub struct StaticEmbedding {
	pub vector: Vec<f32>,
}
impl EmbeddingProvider for StaticEmbedding {
	fn embed<'a>(
		&'a self,
		_cfg: &'a EmbeddingProviderConfig,
		_model: &'a str,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		let vectors = vec![self.vector.clone(); texts.len()];

		Box::pin(async move { Ok(vectors) })
	}
}

pub struct FailingEmbedding;
impl EmbeddingProvider for FailingEmbedding {
	fn embed<'a>(
		&'a self,
		_cfg: &'a EmbeddingProviderConfig,
		_model: &'a str,
		_texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		Box::pin(async move {
			Err(Error::Provider { message: "Embedding provider is unreachable.".to_string() })
		})
	}
}

/// Answers like [`HashEmbedding`] after `delay`.
pub struct SlowEmbedding {
	pub delay: Duration,
}
impl EmbeddingProvider for SlowEmbedding {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		_model: &'a str,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		Box::pin(async move {
			tokio::time::sleep(self.delay).await;

			Ok(texts.iter().map(|text| HashEmbedding::vector(text, cfg.dimensions as usize)).collect())
		})
	}
}
