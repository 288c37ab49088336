mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Config, DefinitionConfig, EmbeddingProviderConfig, POLICY_THREAD_BOUNDED,
	POLICY_TIME_GAP_BOUNDED, Postgres, Providers, Search, Segmentation, Service, Storage, Tracking,
	Worker,
};

use std::{collections::HashSet, fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	parse(&raw).map_err(|err| match err {
		Error::ParseConfig { source, .. } =>
			Error::ParseConfig { path: path.to_path_buf(), source },
		other => other,
	})
}

pub fn parse(raw: &str) -> Result<Config> {
	let mut cfg: Config = toml::from_str(raw)
		.map_err(|err| Error::ParseConfig { path: Default::default(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.storage.postgres.dsn.trim().is_empty() {
		return Err(validation("storage.postgres.dsn must be non-empty."));
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(validation("storage.postgres.pool_max_conns must be greater than zero."));
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(validation("providers.embedding.dimensions must be greater than zero."));
	}
	if cfg.providers.embedding.api_key.trim().is_empty() {
		return Err(validation("Provider embedding api_key must be non-empty."));
	}
	if cfg.providers.embedding.model.trim().is_empty() {
		return Err(validation("providers.embedding.model must be non-empty."));
	}

	validate_search(&cfg.search)?;
	validate_segmentation(&cfg.segmentation)?;

	if cfg.worker.batch_size == 0 {
		return Err(validation("worker.batch_size must be greater than zero."));
	}
	if cfg.worker.embed_batch_size == 0 {
		return Err(validation("worker.embed_batch_size must be greater than zero."));
	}

	Ok(())
}

fn validate_search(search: &Search) -> Result<()> {
	for (label, weight) in
		[("search.lexical_weight", search.lexical_weight), ("search.vector_weight", search.vector_weight)]
	{
		if !weight.is_finite() {
			return Err(validation(format!("{label} must be a finite number.")));
		}
		if weight < 0.0 {
			return Err(validation(format!("{label} must be zero or greater.")));
		}
	}

	if search.lexical_weight + search.vector_weight <= 0.0 {
		return Err(validation("search weights must not both be zero."));
	}
	if search.default_limit == 0 {
		return Err(validation("search.default_limit must be greater than zero."));
	}
	if search.default_limit > search.max_limit {
		return Err(validation("search.default_limit must not exceed search.max_limit."));
	}
	if search.candidate_k < search.max_limit {
		return Err(validation("search.candidate_k must be at least search.max_limit."));
	}
	if search.timeout_ms == 0 {
		return Err(validation("search.timeout_ms must be greater than zero."));
	}

	Ok(())
}

fn validate_segmentation(segmentation: &Segmentation) -> Result<()> {
	if segmentation.definitions.is_empty() {
		return Err(validation("segmentation.definitions must be non-empty."));
	}
	if segmentation.summary_max_chars == 0 {
		return Err(validation("segmentation.summary_max_chars must be greater than zero."));
	}

	let mut seen = HashSet::new();

	for definition in &segmentation.definitions {
		if definition.name.is_empty() {
			return Err(validation("segmentation.definitions.name must be non-empty."));
		}
		if !seen.insert(definition.name.as_str()) {
			return Err(validation(format!(
				"segmentation.definitions.name must be unique; duplicate {:?}.",
				definition.name
			)));
		}

		match definition.kind.as_str() {
			POLICY_THREAD_BOUNDED =>
				if definition.max_gap_seconds.is_some() {
					return Err(validation(format!(
						"segmentation definition {:?} is thread_bounded and must not set max_gap_seconds.",
						definition.name
					)));
				},
			POLICY_TIME_GAP_BOUNDED => match definition.max_gap_seconds {
				Some(gap) if gap > 0 => {},
				_ => {
					return Err(validation(format!(
						"segmentation definition {:?} requires max_gap_seconds greater than zero.",
						definition.name
					)));
				},
			},
			other => {
				return Err(validation(format!(
					"segmentation definition {:?} has unknown kind {other:?}; expected thread_bounded or time_gap_bounded.",
					definition.name
				)));
			},
		}
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	for definition in &mut cfg.segmentation.definitions {
		definition.name = definition.name.trim().to_string();
		definition.kind = definition.kind.trim().to_ascii_lowercase();
		definition.channels = definition
			.channels
			.iter()
			.map(|channel| channel.trim().to_string())
			.filter(|channel| !channel.is_empty())
			.collect();
	}
}

fn validation(message: impl Into<String>) -> Error {
	Error::Validation { message: message.into() }
}
