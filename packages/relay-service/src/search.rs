pub mod fusion;

use std::{
	collections::{BTreeMap, HashMap},
	slice,
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use relay_domain::{
	event::Event,
	segmentation::{Definition, Episode, EpisodeKey, SegmentScope, ThreadKey},
	text,
	unit::{UnitFilter, UnitKind},
};

use crate::{
	Error, RelayService, Result, ScoredUnit,
	search::fusion::{FusedCandidate, Ranked, Weights},
	tracking::RetrievalRecord,
};

/// Per-request lifecycle. Every transition emits a `debug` event; a request ends either with a
/// response or with the first error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchStage {
	Validating,
	Segmenting,
	Retrieving,
	Fusing,
	Ranking,
	Tracking,
	Responding,
}
impl SearchStage {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Validating => "validating",
			Self::Segmenting => "segmenting",
			Self::Retrieving => "retrieving",
			Self::Fusing => "fusing",
			Self::Ranking => "ranking",
			Self::Tracking => "tracking",
			Self::Responding => "responding",
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
	pub query: String,
	/// Precomputed query embedding; skips the provider call when set.
	pub query_vector: Option<Vec<f32>>,
	/// Empty means every channel.
	pub channels: Vec<String>,
	/// Non-positive values fall back to `search.default_limit`; capped at `search.max_limit`.
	pub limit: i64,
	pub min_score: f32,
	/// Embedding model; defaults to the configured provider model.
	pub model: Option<String>,
	pub use_embeddings: bool,
	pub use_lexical: bool,
	pub track_retrieval: bool,
	/// Deadline for the whole call; defaults to `search.timeout_ms`.
	pub timeout_ms: Option<u64>,
}
impl SearchRequest {
	pub fn new(query: impl Into<String>) -> Self {
		Self { query: query.into(), ..Default::default() }
	}
}
impl Default for SearchRequest {
	fn default() -> Self {
		Self {
			query: String::new(),
			query_vector: None,
			channels: Vec::new(),
			limit: 0,
			min_score: 0.0,
			model: None,
			use_embeddings: true,
			use_lexical: true,
			track_retrieval: false,
			timeout_ms: None,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct EpisodeSearchRequest {
	#[serde(flatten)]
	pub search: SearchRequest,
	pub definition: String,
	#[serde(default)]
	pub thread_id: Option<String>,
	/// Re-segment the requested scope before retrieving.
	#[serde(default)]
	pub refresh: bool,
}
impl EpisodeSearchRequest {
	pub fn new(definition: impl Into<String>, search: SearchRequest) -> Self {
		Self { search, definition: definition.into(), thread_id: None, refresh: false }
	}
}

#[derive(Clone, Debug, Serialize)]
pub struct DocumentSearchResponse {
	pub query: String,
	pub model: Option<String>,
	pub lexical_used: bool,
	pub embedding_used: bool,
	pub items: Vec<DocumentItem>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DocumentItem {
	pub unit_id: String,
	pub event_id: String,
	pub channel: String,
	pub title: String,
	pub description: String,
	pub snippet: String,
	pub ts: i64,
	pub score: f32,
	pub breakdown: BTreeMap<String, f32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EpisodeSearchResponse {
	pub query: String,
	pub model: Option<String>,
	pub definition: String,
	pub lexical_used: bool,
	pub embedding_used: bool,
	pub items: Vec<EpisodeItem>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EpisodeItem {
	pub unit_id: String,
	pub episode_id: Uuid,
	pub definition_name: String,
	pub channel: String,
	pub thread_id: Option<String>,
	pub thread_name: Option<String>,
	pub start_ts: i64,
	pub end_ts: i64,
	pub event_count: usize,
	pub score: f32,
	pub breakdown: BTreeMap<String, f32>,
}

struct SearchPlan {
	query: String,
	limit: usize,
	min_score: f32,
	model: String,
	use_lexical: bool,
	use_embeddings: bool,
	timeout: Duration,
}

struct Signals {
	lexical: Option<Vec<ScoredUnit>>,
	vector: Option<Vec<ScoredUnit>>,
}
impl Signals {
	fn unit_ids(&self) -> Vec<String> {
		let mut unit_ids: Vec<String> = self
			.lexical
			.iter()
			.chain(self.vector.iter())
			.flatten()
			.map(|hit| hit.unit_id.clone())
			.collect();

		unit_ids.sort();
		unit_ids.dedup();

		unit_ids
	}

	/// Drops every hit whose unit has no source row and returns the dropped unit ids. Runs before
	/// fusion so stale hits never shift the normalization of live ones.
	fn retain_resolved<F>(&mut self, resolved: F) -> Vec<String>
	where
		F: Fn(&str) -> bool,
	{
		let mut stale = Vec::new();

		for hits in [self.lexical.as_mut(), self.vector.as_mut()].into_iter().flatten() {
			hits.retain(|hit| {
				let keep = resolved(&hit.unit_id);

				if !keep {
					stale.push(hit.unit_id.clone());
				}

				keep
			});
		}

		stale.sort();
		stale.dedup();

		stale
	}
}

enum VectorLookup {
	Disabled,
	NoQueryText,
	EmbeddingFailed(Error),
	Searched(Result<Vec<ScoredUnit>>),
}

/// A fused candidate joined with its source row.
struct Resolved<'a, S> {
	candidate: FusedCandidate,
	source: &'a S,
	recency: i64,
}
impl<S> Ranked for Resolved<'_, S> {
	fn score(&self) -> f32 {
		self.candidate.score
	}

	fn recency(&self) -> i64 {
		self.recency
	}

	fn unit_id(&self) -> &str {
		self.candidate.unit_id.as_str()
	}
}

impl RelayService {
	pub async fn search_documents(&self, req: SearchRequest) -> Result<DocumentSearchResponse> {
		enter(SearchStage::Validating);

		let plan = self.plan_search(&req)?;
		let started = Instant::now();

		tokio::time::timeout(plan.timeout, self.search_documents_inner(&req, &plan))
			.await
			.map_err(|_| timed_out(started))?
	}

	pub async fn search_episodes(&self, req: EpisodeSearchRequest) -> Result<EpisodeSearchResponse> {
		enter(SearchStage::Validating);

		let definition = self.definition(&req.definition)?.clone();
		let plan = self.plan_search(&req.search)?;
		let started = Instant::now();

		tokio::time::timeout(plan.timeout, self.search_episodes_inner(&req, &definition, &plan))
			.await
			.map_err(|_| timed_out(started))?
	}

	async fn search_documents_inner(
		&self,
		req: &SearchRequest,
		plan: &SearchPlan,
	) -> Result<DocumentSearchResponse> {
		let filter = UnitFilter::documents(req.channels.iter().cloned());
		let mut signals = self.retrieve(req, plan, &filter).await?;
		let lexical_used = signals.lexical.is_some();
		let embedding_used = signals.vector.is_some();
		let events = self.backends.events.get_events(&signals.unit_ids()).await?;
		let by_id: HashMap<&str, &Event> =
			events.iter().map(|event| (event.event_id.as_str(), event)).collect();
		let stale = signals.retain_resolved(|unit_id| by_id.contains_key(unit_id));

		self.repair_stale(UnitKind::Event, stale);
		enter(SearchStage::Fusing);

		let fused = fusion::fuse(signals.lexical.as_deref(), signals.vector.as_deref(), self.weights());

		enter(SearchStage::Ranking);

		let resolved: Vec<_> = fused
			.into_iter()
			.filter_map(|candidate| {
				let event = *by_id.get(candidate.unit_id.as_str())?;

				Some(Resolved { recency: event.ts, source: event, candidate })
			})
			.collect();
		let terms = text::query_terms(&plan.query);
		let snippet_chars = self.cfg.search.snippet_chars as usize;
		let items: Vec<DocumentItem> = fusion::rank(resolved, plan.min_score, plan.limit)
			.into_iter()
			.map(|resolved| document_item(resolved.candidate, resolved.source, &terms, snippet_chars))
			.collect();

		self.track_surfaced(req, plan, embedding_used, UnitKind::Event, &items, |item| {
			item.unit_id.clone()
		});

		enter(SearchStage::Responding);

		Ok(DocumentSearchResponse {
			query: req.query.clone(),
			model: plan.use_embeddings.then(|| plan.model.clone()),
			lexical_used,
			embedding_used,
			items,
		})
	}

	async fn search_episodes_inner(
		&self,
		req: &EpisodeSearchRequest,
		definition: &Definition,
		plan: &SearchPlan,
	) -> Result<EpisodeSearchResponse> {
		let thread_id =
			req.thread_id.as_deref().map(str::trim).filter(|thread_id| !thread_id.is_empty());

		if req.refresh {
			enter(SearchStage::Segmenting);

			self.refresh_detached(definition, refresh_scope(&req.search.channels, thread_id))
				.await?;
		}

		let filter =
			UnitFilter::episodes(&definition.name, req.search.channels.iter().cloned(), thread_id);
		let mut signals = self.retrieve(&req.search, plan, &filter).await?;
		let lexical_used = signals.lexical.is_some();
		let embedding_used = signals.vector.is_some();
		let ids: Vec<Uuid> = signals
			.unit_ids()
			.iter()
			.filter_map(|unit_id| Uuid::parse_str(unit_id).ok())
			.collect();
		let episodes = self.backends.episodes.get_episodes(&ids).await?;
		let by_id: HashMap<String, &Episode> = episodes
			.iter()
			.filter(|episode| episode.definition_name == definition.name)
			.map(|episode| (crate::episode_unit_id(episode.episode_id), episode))
			.collect();
		let stale = signals.retain_resolved(|unit_id| by_id.contains_key(unit_id));

		self.repair_stale(UnitKind::Episode, stale);
		enter(SearchStage::Fusing);

		let fused = fusion::fuse(signals.lexical.as_deref(), signals.vector.as_deref(), self.weights());

		enter(SearchStage::Ranking);

		let resolved: Vec<_> = fused
			.into_iter()
			.filter_map(|candidate| {
				let episode = *by_id.get(&candidate.unit_id)?;

				Some(Resolved { recency: episode.end_ts, source: episode, candidate })
			})
			.collect();
		let ranked = fusion::rank(resolved, plan.min_score, plan.limit);
		let thread_names = self.thread_names(ranked.iter().map(|resolved| resolved.source)).await?;
		let items: Vec<EpisodeItem> = ranked
			.into_iter()
			.map(|resolved| {
				let thread_name = thread_names
					.get(&resolved.source.episode_id)
					.cloned()
					.or_else(|| resolved.source.thread_id().map(str::to_string));

				episode_item(resolved.candidate, resolved.source, thread_name)
			})
			.collect();

		self.track_surfaced(&req.search, plan, embedding_used, UnitKind::Episode, &items, |item| {
			item.unit_id.clone()
		});

		enter(SearchStage::Responding);

		Ok(EpisodeSearchResponse {
			query: req.search.query.clone(),
			model: plan.use_embeddings.then(|| plan.model.clone()),
			definition: definition.name.clone(),
			lexical_used,
			embedding_used,
			items,
		})
	}

	fn plan_search(&self, req: &SearchRequest) -> Result<SearchPlan> {
		let search = &self.cfg.search;

		if !req.use_lexical && !req.use_embeddings {
			return Err(invalid("At least one of use_lexical or use_embeddings must be enabled."));
		}
		if let Some(vec) = req.query_vector.as_ref()
			&& (vec.is_empty() || vec.iter().any(|value| !value.is_finite()))
		{
			return Err(invalid("query_vector must be non-empty and finite."));
		}

		let query = req.query.trim().to_string();
		let has_vector = req.use_embeddings && req.query_vector.is_some();

		if query.is_empty() && !has_vector && !req.use_lexical {
			return Err(invalid(
				"query must be non-empty when lexical search is disabled and no query_vector is given.",
			));
		}
		if !req.min_score.is_finite() || !(0.0..=1.0).contains(&req.min_score) {
			return Err(invalid("min_score must be between 0.0 and 1.0."));
		}

		let model = match req.model.as_deref().map(str::trim) {
			Some("") => return Err(invalid("model must be non-empty when provided.")),
			Some(model) => model.to_string(),
			None => self.default_model().to_string(),
		};
		let limit = if req.limit <= 0 { search.default_limit } else { clamp_u32(req.limit) };
		let timeout_ms = req.timeout_ms.filter(|ms| *ms > 0).unwrap_or(search.timeout_ms);

		Ok(SearchPlan {
			query,
			limit: limit.min(search.max_limit) as usize,
			min_score: req.min_score,
			model,
			use_lexical: req.use_lexical,
			use_embeddings: req.use_embeddings,
			timeout: Duration::from_millis(timeout_ms),
		})
	}

	/// Runs the enabled lookups concurrently. A failed signal degrades the response when another
	/// signal is still available and fails the call otherwise.
	async fn retrieve(
		&self,
		req: &SearchRequest,
		plan: &SearchPlan,
		filter: &UnitFilter,
	) -> Result<Signals> {
		enter(SearchStage::Retrieving);

		let candidate_k = self.cfg.search.candidate_k;
		let lexical_lookup = async {
			if !plan.use_lexical {
				return None;
			}

			Some(self.backends.lexical.search(&plan.query, filter, candidate_k).await)
		};
		let vector_lookup = async {
			if !plan.use_embeddings {
				return VectorLookup::Disabled;
			}

			let query_vec = match req.query_vector.clone() {
				Some(vec) => vec,
				None if plan.query.is_empty() => return VectorLookup::NoQueryText,
				None => match self.embed_texts(&plan.model, slice::from_ref(&plan.query)).await {
					Ok(mut vectors) => match vectors.pop() {
						Some(vec) => vec,
						None =>
							return VectorLookup::EmbeddingFailed(Error::Provider {
								message: "Embedding provider returned no vector.".to_string(),
							}),
					},
					Err(err) => return VectorLookup::EmbeddingFailed(err),
				},
			};

			VectorLookup::Searched(
				self.backends
					.vectors
					.similarity_search(&query_vec, &plan.model, filter, candidate_k)
					.await,
			)
		};
		let (lexical, vector) = tokio::join!(lexical_lookup, vector_lookup);
		let mut failures = Vec::new();
		let lexical = match lexical {
			None => None,
			Some(Ok(hits)) => Some(hits),
			Some(Err(err)) => {
				failures.push(format!("lexical lookup failed: {err}"));

				None
			},
		};
		let vector = match vector {
			VectorLookup::Disabled | VectorLookup::NoQueryText => None,
			VectorLookup::EmbeddingFailed(err) => {
				if !plan.use_lexical {
					return Err(Error::Dependency { message: err.to_string() });
				}

				tracing::warn!(error = %err, model = %plan.model, "Embedding failed. Falling back to lexical-only search.");

				None
			},
			VectorLookup::Searched(Ok(hits)) => Some(hits),
			VectorLookup::Searched(Err(err)) => {
				failures.push(format!("vector lookup failed: {err}"));

				None
			},
		};

		if lexical.is_none() && vector.is_none() && !failures.is_empty() {
			return Err(Error::Index { message: failures.join("; ") });
		}

		for failure in &failures {
			tracing::warn!(failure = %failure, "Continuing with the remaining signal.");
		}

		Ok(Signals { lexical, vector })
	}

	fn weights(&self) -> Weights {
		Weights { lexical: self.cfg.search.lexical_weight, vector: self.cfg.search.vector_weight }
	}

	/// Re-segments the scope on a detached task so an expiring deadline abandons only the wait,
	/// never a half-written scope.
	async fn refresh_detached(&self, definition: &Definition, scope: SegmentScope) -> Result<()> {
		let service = self.clone();
		let definition_name = definition.name.clone();
		let task =
			tokio::spawn(async move { service.segment(&definition_name, &scope).await.map(|_| ()) });

		task.await.map_err(refresh_failed)?
	}

	/// Removes index entries whose source row is gone. Runs detached; the search never waits.
	///
	/// A deleted event is also dropped from the episodes that claimed it.
	fn repair_stale(&self, kind: UnitKind, stale: Vec<String>) {
		if stale.is_empty() {
			return;
		}

		tracing::warn!(count = stale.len(), unit_ids = ?stale, "Skipping index entries without a source row.");

		if kind == UnitKind::Event {
			let service = self.clone();

			tokio::spawn(async move {
				for event_id in &stale {
					if let Err(err) = service.remove_event(event_id).await {
						tracing::warn!(error = %err, event_id = %event_id, "Failed to remove stale event.");
					}
				}
			});

			return;
		}

		let lexical = self.backends.lexical.clone();
		let vectors = self.backends.vectors.clone();

		tokio::spawn(async move {
			if let Err(err) = lexical.remove(&stale).await {
				tracing::warn!(error = %err, "Failed to prune stale lexical entries.");
			}
			if let Err(err) = vectors.remove(&stale, None).await {
				tracing::warn!(error = %err, "Failed to prune stale vectors.");
			}
		});
	}

	/// Title of each episode's first member.
	async fn thread_names<'a, I>(&self, episodes: I) -> Result<HashMap<Uuid, String>>
	where
		I: Iterator<Item = &'a Episode>,
	{
		let firsts: Vec<(Uuid, String)> = episodes
			.filter_map(|episode| {
				episode.events.first().map(|member| (episode.episode_id, member.event_id.clone()))
			})
			.collect();

		if firsts.is_empty() {
			return Ok(HashMap::new());
		}

		let ids: Vec<String> = firsts.iter().map(|(_, event_id)| event_id.clone()).collect();
		let events = self.backends.events.get_events(&ids).await?;
		let titles: HashMap<&str, &str> = events
			.iter()
			.filter_map(|event| event.title.as_deref().map(|title| (event.event_id.as_str(), title)))
			.collect();

		Ok(firsts
			.iter()
			.filter_map(|(episode_id, event_id)| {
				titles.get(event_id.as_str()).map(|title| (*episode_id, title.to_string()))
			})
			.collect())
	}

	fn track_surfaced<T, F>(
		&self,
		req: &SearchRequest,
		plan: &SearchPlan,
		embedding_used: bool,
		kind: UnitKind,
		items: &[T],
		unit_id: F,
	) where
		F: Fn(&T) -> String,
	{
		if !self.tracking_enabled(req.track_retrieval) {
			return;
		}

		enter(SearchStage::Tracking);

		self.track_detached(RetrievalRecord {
			query: plan.query.clone(),
			model: embedding_used.then(|| plan.model.clone()),
			kind,
			unit_ids: items.iter().map(unit_id).collect(),
			ts: OffsetDateTime::now_utc(),
		});
	}
}

fn enter(stage: SearchStage) {
	tracing::debug!(stage = stage.as_str(), "Search stage.");
}

fn invalid(message: &str) -> Error {
	Error::InvalidRequest { message: message.to_string() }
}

fn timed_out(started: Instant) -> Error {
	let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

	tracing::warn!(elapsed_ms, "Search deadline expired.");

	Error::Timeout { elapsed_ms }
}

fn clamp_u32(value: i64) -> u32 {
	u32::try_from(value).unwrap_or(u32::MAX)
}

fn refresh_scope(channels: &[String], thread_id: Option<&str>) -> SegmentScope {
	match (channels, thread_id) {
		([channel], Some(thread_id)) => SegmentScope::key(EpisodeKey {
			channel: channel.trim().to_string(),
			thread: ThreadKey::Thread(thread_id.to_string()),
		}),
		_ => SegmentScope::channels(
			channels
				.iter()
				.map(|channel| channel.trim().to_string())
				.filter(|channel| !channel.is_empty()),
		),
	}
}

fn document_item(
	candidate: FusedCandidate,
	event: &Event,
	terms: &[String],
	snippet_chars: usize,
) -> DocumentItem {
	let description = event
		.content
		.lines()
		.map(text::normalize_whitespace)
		.find(|line| !line.is_empty())
		.map(|line| text::truncate_chars(&line, snippet_chars).to_string())
		.unwrap_or_default();

	DocumentItem {
		unit_id: candidate.unit_id,
		event_id: event.event_id.clone(),
		channel: event.channel.clone(),
		title: event.title.clone().unwrap_or_else(|| event.channel.clone()),
		description,
		snippet: text::snippet(&event.content, terms, snippet_chars),
		ts: event.ts,
		score: candidate.score,
		breakdown: candidate.breakdown,
	}
}

/// A refresh task that panicked or was cancelled never finished writing its scope.
fn refresh_failed(err: tokio::task::JoinError) -> Error {
	Error::Storage { message: format!("Segmentation refresh task failed: {err}.") }
}

fn episode_item(candidate: FusedCandidate, episode: &Episode, thread_name: Option<String>) -> EpisodeItem {
	EpisodeItem {
		unit_id: candidate.unit_id,
		episode_id: episode.episode_id,
		definition_name: episode.definition_name.clone(),
		channel: episode.channel().to_string(),
		thread_id: episode.thread_id().map(str::to_string),
		thread_name,
		start_ts: episode.start_ts,
		end_ts: episode.end_ts,
		event_count: episode.event_count(),
		score: candidate.score,
		breakdown: candidate.breakdown,
	}
}
