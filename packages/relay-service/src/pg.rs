//! Postgres implementation of every backend capability.

use std::collections::{HashMap, HashSet};

use sqlx::PgPool;
use uuid::Uuid;

use relay_domain::{
	event::Event,
	segmentation::{Episode, EpisodeEvent, EpisodeKey, SegmentScope},
	unit::{UnitFilter, UnitScope},
};
use relay_storage::{
	db::Db,
	episodes, events, lexical,
	models::{self, EpisodeRow},
	segmentation_state, tracking, vectors,
};

use crate::{
	BoxFuture, EpisodeStore, EventSource, IndexedEpisode, LexicalIndex, PendingUnit, ReplaceReport,
	Result, RetrievalRecord, RetrievalTracker, ScoredUnit, VectorIndex,
};

#[derive(Clone)]
pub struct PgBackend {
	pool: PgPool,
}
impl PgBackend {
	pub fn new(db: &Db) -> Self {
		Self { pool: db.pool.clone() }
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	async fn load_episodes(&self, rows: Vec<EpisodeRow>) -> Result<Vec<Episode>> {
		let ids: Vec<Uuid> = rows.iter().map(|row| row.episode_id).collect();
		let mut members: HashMap<Uuid, Vec<EpisodeEvent>> = HashMap::new();

		for member in episodes::list_episode_members(&self.pool, &ids).await? {
			members
				.entry(member.episode_id)
				.or_default()
				.push(EpisodeEvent { event_id: member.event_id, ts: member.ts });
		}

		let mut out = Vec::with_capacity(rows.len());

		for row in rows {
			let episode_members = members.remove(&row.episode_id).unwrap_or_default();

			out.push(row.into_episode(episode_members)?);
		}

		Ok(out)
	}

	async fn replace_episodes_tx(
		&self,
		definition_name: &str,
		scope: &SegmentScope,
		indexed: &[IndexedEpisode],
	) -> Result<ReplaceReport> {
		let (channels, thread_key) = match scope.key.as_ref() {
			Some(key) => (vec![key.channel.clone()], Some(key.thread_key())),
			None => (scope.channels.clone(), None),
		};
		let mut tx = self.pool.begin().await?;
		let existing = episodes::list_episode_ids_in_scope(
			&mut *tx,
			definition_name,
			&channels,
			thread_key.as_deref(),
		)
		.await?;
		let kept: HashSet<Uuid> = indexed.iter().map(|item| item.episode.episode_id).collect();
		let removed: Vec<Uuid> = existing.iter().copied().filter(|id| !kept.contains(id)).collect();
		let mut touched: Vec<Uuid> = existing.clone();

		touched.extend(kept.iter().copied());

		// Memberships go first so an event can move between episodes without tripping the
		// claim-once key.
		episodes::clear_episode_members(&mut *tx, definition_name, &touched).await?;
		episodes::delete_episodes(&mut *tx, definition_name, &removed).await?;

		let unit_ids: Vec<String> = indexed.iter().map(IndexedEpisode::unit_id).collect();
		let previous: HashMap<String, String> =
			lexical::lexical_contents(&mut *tx, &unit_ids).await?.into_iter().collect();
		let mut stale_vectors: Vec<String> =
			removed.iter().map(|id| crate::episode_unit_id(*id)).collect();

		for (item, unit_id) in indexed.iter().zip(&unit_ids) {
			write_indexed_episode(&mut tx, item, unit_id).await?;

			if previous.get(unit_id) != Some(&item.summary) {
				stale_vectors.push(unit_id.clone());
			}
		}

		let removed_units: Vec<String> =
			removed.iter().map(|id| crate::episode_unit_id(*id)).collect();

		lexical::delete_lexical_entries(&mut *tx, &removed_units).await?;
		vectors::delete_unit_embeddings(&mut *tx, &stale_vectors, None).await?;

		tx.commit().await?;

		Ok(ReplaceReport { written: indexed.len(), removed: removed.len() })
	}

	async fn upsert_episode_tx(&self, item: &IndexedEpisode) -> Result<()> {
		let unit_id = item.unit_id();
		let mut tx = self.pool.begin().await?;
		let previous = lexical::lexical_contents(&mut *tx, std::slice::from_ref(&unit_id)).await?;

		write_indexed_episode(&mut tx, item, &unit_id).await?;

		if previous.first().map(|(_, content)| content) != Some(&item.summary) {
			vectors::delete_unit_embeddings(&mut *tx, std::slice::from_ref(&unit_id), None).await?;
		}

		tx.commit().await?;

		Ok(())
	}
}

impl EventSource for PgBackend {
	fn list_events<'a>(&'a self, scope: &'a SegmentScope) -> BoxFuture<'a, Result<Vec<Event>>> {
		Box::pin(async move {
			let rows = events::list_events(&self.pool, scope).await?;

			Ok(rows.into_iter().map(Event::from).collect())
		})
	}

	fn get_events<'a>(&'a self, event_ids: &'a [String]) -> BoxFuture<'a, Result<Vec<Event>>> {
		Box::pin(async move {
			let rows = events::get_events(&self.pool, event_ids).await?;

			Ok(rows.into_iter().map(Event::from).collect())
		})
	}
}

impl EpisodeStore for PgBackend {
	fn latest_episode<'a>(
		&'a self,
		definition_name: &'a str,
		key: &'a EpisodeKey,
	) -> BoxFuture<'a, Result<Option<Episode>>> {
		Box::pin(async move {
			let thread_key = key.thread_key();
			let Some(row) =
				episodes::latest_episode(&self.pool, definition_name, &key.channel, &thread_key)
					.await?
			else {
				return Ok(None);
			};

			Ok(self.load_episodes(vec![row]).await?.pop())
		})
	}

	fn member_episode<'a>(
		&'a self,
		definition_name: &'a str,
		event_id: &'a str,
	) -> BoxFuture<'a, Result<Option<Episode>>> {
		Box::pin(async move {
			let Some(row) = episodes::member_episode(&self.pool, definition_name, event_id).await?
			else {
				return Ok(None);
			};

			Ok(self.load_episodes(vec![row]).await?.pop())
		})
	}

	fn get_episodes<'a>(&'a self, episode_ids: &'a [Uuid]) -> BoxFuture<'a, Result<Vec<Episode>>> {
		Box::pin(async move {
			let rows = episodes::get_episodes(&self.pool, episode_ids).await?;

			self.load_episodes(rows).await
		})
	}

	fn replace_episodes<'a>(
		&'a self,
		definition_name: &'a str,
		scope: &'a SegmentScope,
		episodes: &'a [IndexedEpisode],
	) -> BoxFuture<'a, Result<ReplaceReport>> {
		Box::pin(self.replace_episodes_tx(definition_name, scope, episodes))
	}

	fn upsert_episode<'a>(&'a self, episode: &'a IndexedEpisode) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.upsert_episode_tx(episode))
	}

	fn definition_fingerprint<'a>(
		&'a self,
		definition_name: &'a str,
	) -> BoxFuture<'a, Result<Option<String>>> {
		Box::pin(async move {
			Ok(segmentation_state::get_definition_fingerprint(&self.pool, definition_name).await?)
		})
	}

	fn set_definition_fingerprint<'a>(
		&'a self,
		definition_name: &'a str,
		fingerprint: &'a str,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			Ok(segmentation_state::set_definition_fingerprint(
				&self.pool,
				definition_name,
				fingerprint,
			)
			.await?)
		})
	}
}

impl LexicalIndex for PgBackend {
	fn index<'a>(
		&'a self,
		unit_id: &'a str,
		scope: &'a UnitScope,
		text: &'a str,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			Ok(lexical::upsert_lexical_entry(&self.pool, unit_id, scope, text).await?)
		})
	}

	fn remove<'a>(&'a self, unit_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			lexical::delete_lexical_entries(&self.pool, unit_ids).await?;

			Ok(())
		})
	}

	fn search<'a>(
		&'a self,
		query: &'a str,
		filter: &'a UnitFilter,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ScoredUnit>>> {
		Box::pin(async move {
			let hits = lexical::search_lexical(&self.pool, query, filter, limit).await?;

			Ok(hits
				.into_iter()
				.map(|hit| ScoredUnit { unit_id: hit.unit_id, score: hit.score })
				.collect())
		})
	}
}

impl VectorIndex for PgBackend {
	fn upsert<'a>(
		&'a self,
		unit_id: &'a str,
		model: &'a str,
		scope: &'a UnitScope,
		vec: &'a [f32],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			Ok(vectors::upsert_unit_embedding(&self.pool, unit_id, model, scope, vec).await?)
		})
	}

	fn remove<'a>(
		&'a self,
		unit_ids: &'a [String],
		model: Option<&'a str>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			vectors::delete_unit_embeddings(&self.pool, unit_ids, model).await?;

			Ok(())
		})
	}

	fn similarity_search<'a>(
		&'a self,
		query_vec: &'a [f32],
		model: &'a str,
		filter: &'a UnitFilter,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ScoredUnit>>> {
		Box::pin(async move {
			let hits =
				vectors::search_unit_embeddings(&self.pool, query_vec, model, filter, limit).await?;

			Ok(hits
				.into_iter()
				.map(|hit| ScoredUnit { unit_id: hit.unit_id, score: hit.score })
				.collect())
		})
	}

	fn pending<'a>(
		&'a self,
		model: &'a str,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<PendingUnit>>> {
		Box::pin(async move {
			let limit = i64::try_from(limit).unwrap_or(i64::MAX);
			let rows = vectors::list_units_missing_embedding(&self.pool, model, limit).await?;
			let mut out = Vec::with_capacity(rows.len());

			for row in rows {
				let scope = row.scope()?;

				out.push(PendingUnit { unit_id: row.unit_id, scope, text: row.content });
			}

			Ok(out)
		})
	}
}

impl RetrievalTracker for PgBackend {
	fn track<'a>(&'a self, record: &'a RetrievalRecord) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let row = models::RetrievalRecord {
				record_id: Uuid::new_v4(),
				query: record.query.clone(),
				model: record.model.clone(),
				unit_kind: record.kind.as_str().to_string(),
				unit_ids: record.unit_ids.clone(),
				ts: record.ts,
			};

			Ok(tracking::insert_retrieval_record(&self.pool, &row).await?)
		})
	}
}

async fn write_indexed_episode(
	tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
	item: &IndexedEpisode,
	unit_id: &str,
) -> Result<()> {
	let row = EpisodeRow::from_episode(&item.episode)?;

	episodes::upsert_episode(&mut **tx, &row).await?;
	episodes::write_episode_members(
		&mut **tx,
		&item.episode.definition_name,
		item.episode.episode_id,
		&item.episode.events,
	)
	.await?;
	lexical::upsert_lexical_entry(&mut **tx, unit_id, &item.scope(), &item.summary).await?;

	Ok(())
}
