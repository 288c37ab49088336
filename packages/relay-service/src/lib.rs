pub mod indexing;
pub mod pg;
pub mod search;
pub mod segmentation;
pub mod tracking;

mod error;
mod locks;

pub use error::{Error, Result};
pub use indexing::{IngestAction, IngestOutcome};
pub use pg::PgBackend;
pub use search::{
	DocumentItem, DocumentSearchResponse, EpisodeItem, EpisodeSearchRequest,
	EpisodeSearchResponse, SearchRequest, SearchStage,
};
pub use tracking::RetrievalRecord;

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use uuid::Uuid;

use relay_config::{Config, EmbeddingProviderConfig};
use relay_domain::{
	event::Event,
	segmentation::{Definition, Episode, EpisodeKey, SegmentScope},
	unit::{UnitFilter, UnitScope},
};
use relay_providers::embedding;

use crate::locks::KeyLocks;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read-only view of the event log.
pub trait EventSource
where
	Self: Send + Sync,
{
	/// Events inside `scope`, ordered by (timestamp, identifier).
	fn list_events<'a>(&'a self, scope: &'a SegmentScope) -> BoxFuture<'a, Result<Vec<Event>>>;

	/// Events with the given identifiers; unknown identifiers are silently absent.
	fn get_events<'a>(&'a self, event_ids: &'a [String]) -> BoxFuture<'a, Result<Vec<Event>>>;
}

/// Persisted episodes. Every write also maintains the episode's lexical entry and invalidates
/// vectors whose text changed, within one store operation.
pub trait EpisodeStore
where
	Self: Send + Sync,
{
	fn latest_episode<'a>(
		&'a self,
		definition_name: &'a str,
		key: &'a EpisodeKey,
	) -> BoxFuture<'a, Result<Option<Episode>>>;

	/// The episode that currently claims `event_id` under `definition_name`.
	fn member_episode<'a>(
		&'a self,
		definition_name: &'a str,
		event_id: &'a str,
	) -> BoxFuture<'a, Result<Option<Episode>>>;

	fn get_episodes<'a>(&'a self, episode_ids: &'a [Uuid]) -> BoxFuture<'a, Result<Vec<Episode>>>;

	/// Replaces every stored episode of the definition inside `scope` with `episodes`.
	fn replace_episodes<'a>(
		&'a self,
		definition_name: &'a str,
		scope: &'a SegmentScope,
		episodes: &'a [IndexedEpisode],
	) -> BoxFuture<'a, Result<ReplaceReport>>;

	fn upsert_episode<'a>(&'a self, episode: &'a IndexedEpisode) -> BoxFuture<'a, Result<()>>;

	fn definition_fingerprint<'a>(
		&'a self,
		definition_name: &'a str,
	) -> BoxFuture<'a, Result<Option<String>>>;

	fn set_definition_fingerprint<'a>(
		&'a self,
		definition_name: &'a str,
		fingerprint: &'a str,
	) -> BoxFuture<'a, Result<()>>;
}

pub trait LexicalIndex
where
	Self: Send + Sync,
{
	fn index<'a>(
		&'a self,
		unit_id: &'a str,
		scope: &'a UnitScope,
		text: &'a str,
	) -> BoxFuture<'a, Result<()>>;

	fn remove<'a>(&'a self, unit_ids: &'a [String]) -> BoxFuture<'a, Result<()>>;

	/// Raw engine scores, best first. Scores are only comparable within one call.
	fn search<'a>(
		&'a self,
		query: &'a str,
		filter: &'a UnitFilter,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ScoredUnit>>>;
}

pub trait VectorIndex
where
	Self: Send + Sync,
{
	fn upsert<'a>(
		&'a self,
		unit_id: &'a str,
		model: &'a str,
		scope: &'a UnitScope,
		vec: &'a [f32],
	) -> BoxFuture<'a, Result<()>>;

	/// `model = None` removes the vectors of every model.
	fn remove<'a>(
		&'a self,
		unit_ids: &'a [String],
		model: Option<&'a str>,
	) -> BoxFuture<'a, Result<()>>;

	/// Cosine scores mapped onto [0, 1], best first. Units without a vector for `model` are
	/// absent.
	fn similarity_search<'a>(
		&'a self,
		query_vec: &'a [f32],
		model: &'a str,
		filter: &'a UnitFilter,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ScoredUnit>>>;

	/// Lexically indexed units that have no vector for `model` yet.
	fn pending<'a>(&'a self, model: &'a str, limit: usize)
	-> BoxFuture<'a, Result<Vec<PendingUnit>>>;
}

pub trait RetrievalTracker
where
	Self: Send + Sync,
{
	fn track<'a>(&'a self, record: &'a RetrievalRecord) -> BoxFuture<'a, Result<()>>;
}

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		model: &'a str,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoredUnit {
	pub unit_id: String,
	pub score: f32,
}

#[derive(Clone, Debug)]
pub struct PendingUnit {
	pub unit_id: String,
	pub scope: UnitScope,
	pub text: String,
}

/// An episode together with the text its lexical entry carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedEpisode {
	pub episode: Episode,
	pub summary: String,
}
impl IndexedEpisode {
	pub fn unit_id(&self) -> String {
		episode_unit_id(self.episode.episode_id)
	}

	pub fn scope(&self) -> UnitScope {
		UnitScope::episode(
			self.episode.definition_name.clone(),
			self.episode.channel(),
			self.episode.thread_id().map(str::to_string),
		)
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaceReport {
	pub written: usize,
	pub removed: usize,
}

#[derive(Clone)]
pub struct Backends {
	pub events: Arc<dyn EventSource>,
	pub episodes: Arc<dyn EpisodeStore>,
	pub lexical: Arc<dyn LexicalIndex>,
	pub vectors: Arc<dyn VectorIndex>,
	pub tracker: Arc<dyn RetrievalTracker>,
}
impl Backends {
	/// Uses one backend for every capability.
	pub fn shared<B>(backend: Arc<B>) -> Self
	where
		B: EventSource + EpisodeStore + LexicalIndex + VectorIndex + RetrievalTracker + 'static,
	{
		Self {
			events: backend.clone(),
			episodes: backend.clone(),
			lexical: backend.clone(),
			vectors: backend.clone(),
			tracker: backend,
		}
	}
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
}
impl Providers {
	pub fn new(embedding: Arc<dyn EmbeddingProvider>) -> Self {
		Self { embedding }
	}
}
impl Default for Providers {
	fn default() -> Self {
		Self { embedding: Arc::new(HttpEmbedding) }
	}
}

#[derive(Clone)]
pub struct RelayService {
	pub cfg: Arc<Config>,
	pub backends: Backends,
	pub providers: Providers,
	definitions: Arc<BTreeMap<String, Definition>>,
	locks: Arc<KeyLocks>,
}
impl RelayService {
	pub fn new(cfg: Config, backends: Backends) -> Result<Self> {
		Self::with_providers(cfg, backends, Providers::default())
	}

	pub fn with_providers(cfg: Config, backends: Backends, providers: Providers) -> Result<Self> {
		let mut definitions = BTreeMap::new();

		for definition_cfg in &cfg.segmentation.definitions {
			let definition = Definition::from_config(definition_cfg).ok_or_else(|| {
				Error::InvalidRequest {
					message: format!(
						"Segmentation definition {:?} has inconsistent policy parameters.",
						definition_cfg.name
					),
				}
			})?;

			definitions.insert(definition.name.clone(), definition);
		}

		Ok(Self {
			cfg: Arc::new(cfg),
			backends,
			providers,
			definitions: Arc::new(definitions),
			locks: Arc::new(KeyLocks::default()),
		})
	}

	pub fn definition(&self, name: &str) -> Result<&Definition> {
		self.definitions
			.get(name.trim())
			.ok_or_else(|| Error::UnknownDefinition { name: name.trim().to_string() })
	}

	pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
		self.definitions.values()
	}

	pub(crate) fn default_model(&self) -> &str {
		self.cfg.providers.embedding.model.as_str()
	}
}

/// Unit id of an episode's lexical and vector entries. Event units use the event id itself.
pub fn episode_unit_id(episode_id: Uuid) -> String {
	episode_id.to_string()
}

struct HttpEmbedding;
impl EmbeddingProvider for HttpEmbedding {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		model: &'a str,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		Box::pin(async move { Ok(embedding::embed(cfg, model, texts).await?) })
	}
}
