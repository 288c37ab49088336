//! In-process backend for service tests. Lexical scoring is Okapi BM25 over the same stemmed
//! tokens the Postgres index stores; vector scoring is exact cosine.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	future,
	sync::{
		Mutex, MutexGuard, PoisonError,
		atomic::{AtomicBool, Ordering},
	},
};

use uuid::Uuid;

use relay_domain::{
	event::{self, Event},
	segmentation::{Episode, EpisodeKey, SegmentScope, ThreadKey},
	similarity, text,
	unit::{UnitFilter, UnitScope},
};
use relay_service::{
	BoxFuture, EpisodeStore, Error, EventSource, IndexedEpisode, LexicalIndex, PendingUnit,
	ReplaceReport, Result, RetrievalRecord, RetrievalTracker, ScoredUnit, VectorIndex,
};

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

struct LexicalEntry {
	scope: UnitScope,
	content: String,
	tokens: Vec<String>,
}

struct VectorEntry {
	scope: UnitScope,
	vec: Vec<f32>,
}

#[derive(Default)]
struct State {
	events: BTreeMap<String, Event>,
	episodes: BTreeMap<Uuid, Episode>,
	/// (definition, event id) to the claiming episode.
	members: HashMap<(String, String), Uuid>,
	lexical: BTreeMap<String, LexicalEntry>,
	vectors: BTreeMap<(String, String), VectorEntry>,
	fingerprints: HashMap<String, String>,
	records: Vec<RetrievalRecord>,
}
impl State {
	/// Fails when an event of `indexed` is claimed by another episode, counting only claims that
	/// survive the write: those of `released` episodes are dropped by it. Nothing is mutated.
	fn check_claims(&self, indexed: &[IndexedEpisode], released: &HashSet<Uuid>) -> Result<()> {
		let mut claimed: HashMap<(&str, &str), Uuid> = HashMap::new();

		for item in indexed {
			let episode = &item.episode;

			for member in &episode.events {
				let member_key = (episode.definition_name.as_str(), member.event_id.as_str());
				let owner = claimed.get(&member_key).copied().or_else(|| {
					self.members
						.get(&(episode.definition_name.clone(), member.event_id.clone()))
						.copied()
						.filter(|owner| !released.contains(owner))
				});

				if let Some(owner) = owner
					&& owner != episode.episode_id
				{
					return Err(Error::Storage {
						message: format!(
							"Event {} is already claimed by episode {owner} under {}.",
							member.event_id, episode.definition_name
						),
					});
				}

				claimed.insert(member_key, episode.episode_id);
			}
		}

		Ok(())
	}

	fn write_episode(&mut self, item: &IndexedEpisode) -> Result<()> {
		let episode = &item.episode;

		self.check_claims(std::slice::from_ref(item), &HashSet::from([episode.episode_id]))?;

		let definition_name = episode.definition_name.clone();

		self.members.retain(|(definition, _), episode_id| {
			definition != &definition_name || *episode_id != episode.episode_id
		});

		for member in &episode.events {
			self.members
				.insert((definition_name.clone(), member.event_id.clone()), episode.episode_id);
		}

		self.episodes.insert(episode.episode_id, episode.clone());

		let unit_id = item.unit_id();
		let changed =
			self.lexical.get(&unit_id).is_none_or(|entry| entry.content != item.summary);

		self.lexical.insert(
			unit_id.clone(),
			LexicalEntry {
				scope: item.scope(),
				content: item.summary.clone(),
				tokens: text::tokenize(&item.summary),
			},
		);

		if changed {
			self.vectors.retain(|(vector_unit, _), _| vector_unit != &unit_id);
		}

		Ok(())
	}

	fn drop_units(&mut self, unit_ids: &[String]) {
		let unit_ids: HashSet<&String> = unit_ids.iter().collect();

		self.lexical.retain(|unit_id, _| !unit_ids.contains(unit_id));
		self.vectors.retain(|(unit_id, _), _| !unit_ids.contains(unit_id));
	}

	fn load_episode(&self, episode_id: Uuid) -> Option<Episode> {
		self.episodes.get(&episode_id).cloned()
	}
}

#[derive(Default)]
pub struct MemoryBackend {
	state: Mutex<State>,
	fail_lexical: AtomicBool,
	fail_vectors: AtomicBool,
	fail_tracking: AtomicBool,
}
impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds or replaces a source event. Indexing is the service's job.
	pub fn insert_event(&self, event: Event) {
		self.state().events.insert(event.event_id.clone(), event);
	}

	pub fn insert_events<I>(&self, events: I)
	where
		I: IntoIterator<Item = Event>,
	{
		let mut state = self.state();

		for event in events {
			state.events.insert(event.event_id.clone(), event);
		}
	}

	/// Removes only the source row, leaving index entries behind.
	pub fn delete_event_row(&self, event_id: &str) {
		self.state().events.remove(event_id);
	}

	pub fn set_fail_lexical(&self, fail: bool) {
		self.fail_lexical.store(fail, Ordering::SeqCst);
	}

	pub fn set_fail_vectors(&self, fail: bool) {
		self.fail_vectors.store(fail, Ordering::SeqCst);
	}

	pub fn set_fail_tracking(&self, fail: bool) {
		self.fail_tracking.store(fail, Ordering::SeqCst);
	}

	pub fn records(&self) -> Vec<RetrievalRecord> {
		self.state().records.clone()
	}

	pub fn lexical_unit_ids(&self) -> Vec<String> {
		self.state().lexical.keys().cloned().collect()
	}

	pub fn lexical_content(&self, unit_id: &str) -> Option<String> {
		self.state().lexical.get(unit_id).map(|entry| entry.content.clone())
	}

	pub fn vector_unit_ids(&self, model: &str) -> Vec<String> {
		self.state()
			.vectors
			.keys()
			.filter(|(_, vector_model)| vector_model == model)
			.map(|(unit_id, _)| unit_id.clone())
			.collect()
	}

	/// Stored episodes of a definition, ordered by start time, then key, then id.
	pub fn episodes(&self, definition_name: &str) -> Vec<Episode> {
		let mut episodes: Vec<Episode> = self
			.state()
			.episodes
			.values()
			.filter(|episode| episode.definition_name == definition_name)
			.cloned()
			.collect();

		episodes.sort_by(|left, right| {
			left.start_ts
				.cmp(&right.start_ts)
				.then_with(|| left.key.cmp(&right.key))
				.then_with(|| left.episode_id.cmp(&right.episode_id))
		});

		episodes
	}

	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn list_events_now(&self, scope: &SegmentScope) -> Vec<Event> {
		let mut events: Vec<Event> = self
			.state()
			.events
			.values()
			.filter(|event| scope.covers_channel(&event.channel))
			.filter(|event| scope.key.as_ref().is_none_or(|key| key_matches(key, event)))
			.cloned()
			.collect();

		events.sort_by(event::event_order);

		events
	}

	fn get_events_now(&self, event_ids: &[String]) -> Vec<Event> {
		let state = self.state();
		let mut events: Vec<Event> =
			event_ids.iter().filter_map(|event_id| state.events.get(event_id)).cloned().collect();

		events.sort_by(event::event_order);
		events.dedup_by(|left, right| left.event_id == right.event_id);

		events
	}

	fn latest_now(&self, definition_name: &str, key: &EpisodeKey) -> Option<Episode> {
		self.state()
			.episodes
			.values()
			.filter(|episode| episode.definition_name == definition_name && &episode.key == key)
			.max_by(|left, right| {
				left.end_ts
					.cmp(&right.end_ts)
					.then_with(|| left.start_ts.cmp(&right.start_ts))
					.then_with(|| left.episode_id.cmp(&right.episode_id))
			})
			.cloned()
	}

	fn member_now(&self, definition_name: &str, event_id: &str) -> Option<Episode> {
		let state = self.state();
		let episode_id =
			state.members.get(&(definition_name.to_string(), event_id.to_string())).copied()?;

		state.load_episode(episode_id)
	}

	fn replace_now(
		&self,
		definition_name: &str,
		scope: &SegmentScope,
		indexed: &[IndexedEpisode],
	) -> Result<ReplaceReport> {
		let mut state = self.state();
		let existing: Vec<Uuid> = state
			.episodes
			.values()
			.filter(|episode| episode.definition_name == definition_name)
			.filter(|episode| match scope.key.as_ref() {
				Some(key) => &episode.key == key,
				None => scope.covers_channel(episode.channel()),
			})
			.map(|episode| episode.episode_id)
			.collect();
		let kept: HashSet<Uuid> = indexed.iter().map(|item| item.episode.episode_id).collect();
		let removed: Vec<Uuid> = existing.iter().copied().filter(|id| !kept.contains(id)).collect();
		let touched: HashSet<Uuid> = existing.iter().copied().chain(kept.iter().copied()).collect();

		// A conflict must leave the store untouched, as the rolled-back transaction does.
		state.check_claims(indexed, &touched)?;
		state.members.retain(|(definition, _), episode_id| {
			definition != definition_name || !touched.contains(episode_id)
		});

		for episode_id in &removed {
			state.episodes.remove(episode_id);
		}

		for item in indexed {
			state.write_episode(item)?;
		}

		let removed_units: Vec<String> =
			removed.iter().map(|id| relay_service::episode_unit_id(*id)).collect();

		state.drop_units(&removed_units);

		Ok(ReplaceReport { written: indexed.len(), removed: removed.len() })
	}

	fn lexical_search_now(&self, query: &str, filter: &UnitFilter, limit: u32) -> Vec<ScoredUnit> {
		let terms = text::query_terms(query);

		if terms.is_empty() || limit == 0 {
			return Vec::new();
		}

		let state = self.state();
		let corpus: Vec<(&String, &LexicalEntry)> =
			state.lexical.iter().filter(|(_, entry)| filter.matches(&entry.scope)).collect();

		if corpus.is_empty() {
			return Vec::new();
		}

		let doc_count = corpus.len() as f32;
		let avg_len =
			corpus.iter().map(|(_, entry)| entry.tokens.len() as f32).sum::<f32>() / doc_count;
		let idf: HashMap<&str, f32> = terms
			.iter()
			.map(|term| {
				let df = corpus
					.iter()
					.filter(|(_, entry)| entry.tokens.iter().any(|token| token == term))
					.count() as f32;

				(term.as_str(), (1.0 + (doc_count - df + 0.5) / (df + 0.5)).ln())
			})
			.collect();
		let mut hits: Vec<ScoredUnit> = corpus
			.iter()
			.filter_map(|(unit_id, entry)| {
				let len = entry.tokens.len() as f32;
				let mut score = 0.0_f32;
				let mut matched = false;

				for term in &terms {
					let tf = entry.tokens.iter().filter(|token| *token == term).count() as f32;

					if tf == 0.0 {
						continue;
					}

					matched = true;
					score += idf[term.as_str()] * tf * (BM25_K1 + 1.0)
						/ (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0)));
				}

				matched.then(|| ScoredUnit { unit_id: (*unit_id).clone(), score })
			})
			.collect();

		sort_hits(&mut hits, limit);

		hits
	}

	fn vector_search_now(
		&self,
		query_vec: &[f32],
		model: &str,
		filter: &UnitFilter,
		limit: u32,
	) -> Vec<ScoredUnit> {
		let state = self.state();
		let mut hits: Vec<ScoredUnit> = state
			.vectors
			.iter()
			.filter(|((_, vector_model), entry)| vector_model == model && filter.matches(&entry.scope))
			.filter_map(|((unit_id, _), entry)| {
				similarity::cosine(query_vec, &entry.vec).map(|cosine| ScoredUnit {
					unit_id: unit_id.clone(),
					score: similarity::unit_score(cosine),
				})
			})
			.collect();

		sort_hits(&mut hits, limit);

		hits
	}

	fn pending_now(&self, model: &str, limit: usize) -> Vec<PendingUnit> {
		let state = self.state();

		state
			.lexical
			.iter()
			.filter(|(unit_id, _)| {
				!state.vectors.contains_key(&((*unit_id).clone(), model.to_string()))
			})
			.filter(|(_, entry)| !entry.content.is_empty())
			.take(limit)
			.map(|(unit_id, entry)| PendingUnit {
				unit_id: unit_id.clone(),
				scope: entry.scope.clone(),
				text: entry.content.clone(),
			})
			.collect()
	}
}

impl EventSource for MemoryBackend {
	fn list_events<'a>(&'a self, scope: &'a SegmentScope) -> BoxFuture<'a, Result<Vec<Event>>> {
		Box::pin(future::ready(Ok(self.list_events_now(scope))))
	}

	fn get_events<'a>(&'a self, event_ids: &'a [String]) -> BoxFuture<'a, Result<Vec<Event>>> {
		Box::pin(future::ready(Ok(self.get_events_now(event_ids))))
	}
}

impl EpisodeStore for MemoryBackend {
	fn latest_episode<'a>(
		&'a self,
		definition_name: &'a str,
		key: &'a EpisodeKey,
	) -> BoxFuture<'a, Result<Option<Episode>>> {
		Box::pin(future::ready(Ok(self.latest_now(definition_name, key))))
	}

	fn member_episode<'a>(
		&'a self,
		definition_name: &'a str,
		event_id: &'a str,
	) -> BoxFuture<'a, Result<Option<Episode>>> {
		Box::pin(future::ready(Ok(self.member_now(definition_name, event_id))))
	}

	fn get_episodes<'a>(&'a self, episode_ids: &'a [Uuid]) -> BoxFuture<'a, Result<Vec<Episode>>> {
		let state = self.state();
		let episodes =
			episode_ids.iter().filter_map(|episode_id| state.load_episode(*episode_id)).collect();

		Box::pin(future::ready(Ok(episodes)))
	}

	fn replace_episodes<'a>(
		&'a self,
		definition_name: &'a str,
		scope: &'a SegmentScope,
		episodes: &'a [IndexedEpisode],
	) -> BoxFuture<'a, Result<ReplaceReport>> {
		Box::pin(future::ready(self.replace_now(definition_name, scope, episodes)))
	}

	fn upsert_episode<'a>(&'a self, episode: &'a IndexedEpisode) -> BoxFuture<'a, Result<()>> {
		Box::pin(future::ready(self.state().write_episode(episode)))
	}

	fn definition_fingerprint<'a>(
		&'a self,
		definition_name: &'a str,
	) -> BoxFuture<'a, Result<Option<String>>> {
		let fingerprint = self.state().fingerprints.get(definition_name).cloned();

		Box::pin(future::ready(Ok(fingerprint)))
	}

	fn set_definition_fingerprint<'a>(
		&'a self,
		definition_name: &'a str,
		fingerprint: &'a str,
	) -> BoxFuture<'a, Result<()>> {
		self.state().fingerprints.insert(definition_name.to_string(), fingerprint.to_string());

		Box::pin(future::ready(Ok(())))
	}
}

impl LexicalIndex for MemoryBackend {
	fn index<'a>(
		&'a self,
		unit_id: &'a str,
		scope: &'a UnitScope,
		text: &'a str,
	) -> BoxFuture<'a, Result<()>> {
		self.state().lexical.insert(
			unit_id.to_string(),
			LexicalEntry {
				scope: scope.clone(),
				content: text.to_string(),
				tokens: text::tokenize(text),
			},
		);

		Box::pin(future::ready(Ok(())))
	}

	fn remove<'a>(&'a self, unit_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		let unit_ids: HashSet<&String> = unit_ids.iter().collect();

		self.state().lexical.retain(|unit_id, _| !unit_ids.contains(unit_id));

		Box::pin(future::ready(Ok(())))
	}

	fn search<'a>(
		&'a self,
		query: &'a str,
		filter: &'a UnitFilter,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ScoredUnit>>> {
		if self.fail_lexical.load(Ordering::SeqCst) {
			return Box::pin(future::ready(Err(Error::Index {
				message: "Lexical index is unavailable.".to_string(),
			})));
		}

		Box::pin(future::ready(Ok(self.lexical_search_now(query, filter, limit))))
	}
}

impl VectorIndex for MemoryBackend {
	fn upsert<'a>(
		&'a self,
		unit_id: &'a str,
		model: &'a str,
		scope: &'a UnitScope,
		vec: &'a [f32],
	) -> BoxFuture<'a, Result<()>> {
		self.state().vectors.insert(
			(unit_id.to_string(), model.to_string()),
			VectorEntry { scope: scope.clone(), vec: vec.to_vec() },
		);

		Box::pin(future::ready(Ok(())))
	}

	fn remove<'a>(
		&'a self,
		unit_ids: &'a [String],
		model: Option<&'a str>,
	) -> BoxFuture<'a, Result<()>> {
		let unit_ids: HashSet<&String> = unit_ids.iter().collect();

		self.state().vectors.retain(|(unit_id, vector_model), _| {
			!(unit_ids.contains(unit_id) && model.is_none_or(|model| model == vector_model))
		});

		Box::pin(future::ready(Ok(())))
	}

	fn similarity_search<'a>(
		&'a self,
		query_vec: &'a [f32],
		model: &'a str,
		filter: &'a UnitFilter,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ScoredUnit>>> {
		if self.fail_vectors.load(Ordering::SeqCst) {
			return Box::pin(future::ready(Err(Error::Index {
				message: "Vector index is unavailable.".to_string(),
			})));
		}

		Box::pin(future::ready(Ok(self.vector_search_now(query_vec, model, filter, limit))))
	}

	fn pending<'a>(
		&'a self,
		model: &'a str,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<PendingUnit>>> {
		Box::pin(future::ready(Ok(self.pending_now(model, limit))))
	}
}

impl RetrievalTracker for MemoryBackend {
	fn track<'a>(&'a self, record: &'a RetrievalRecord) -> BoxFuture<'a, Result<()>> {
		if self.fail_tracking.load(Ordering::SeqCst) {
			return Box::pin(future::ready(Err(Error::Storage {
				message: "Retrieval records are unavailable.".to_string(),
			})));
		}

		self.state().records.push(record.clone());

		Box::pin(future::ready(Ok(())))
	}
}

fn key_matches(key: &EpisodeKey, event: &Event) -> bool {
	if event.channel != key.channel {
		return false;
	}

	match &key.thread {
		ThreadKey::Thread(thread_id) => event.thread_id.as_deref() == Some(thread_id.as_str()),
		ThreadKey::Unthreaded => event.thread_id.is_none(),
		ThreadKey::Event(event_id) => event.thread_id.is_none() && &event.event_id == event_id,
	}
}

fn sort_hits(hits: &mut Vec<ScoredUnit>, limit: u32) {
	hits.sort_by(|left, right| {
		right
			.score
			.partial_cmp(&left.score)
			.unwrap_or(std::cmp::Ordering::Equal)
			.then_with(|| left.unit_id.cmp(&right.unit_id))
	});
	hits.truncate(limit as usize);
}
