use std::time::Duration;

use relay_domain::{
	event::Event,
	segmentation::{self, Definition, IngestPlan},
	text,
	unit::UnitScope,
};

use crate::{Error, RelayService, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestAction {
	/// The channel is outside the definition's scope.
	Skipped,
	Refreshed,
	Extended,
	Opened,
	/// The event's key was re-segmented from its source events.
	Rescanned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestOutcome {
	pub definition_name: String,
	pub action: IngestAction,
}

impl RelayService {
	/// Writes the lexical entry of an event, then its vector for the configured model.
	///
	/// The lexical write must succeed. The vector write is best effort: on failure the unit has
	/// no vector until [`RelayService::embed_missing`] picks it up.
	pub async fn index_event(&self, event: &Event) -> Result<()> {
		let scope = UnitScope::event(event.channel.clone(), event.thread_id.clone());
		let text = text::normalize_whitespace(&event.content);
		let unit_ids = [event.event_id.clone()];

		self.backends.lexical.index(&event.event_id, &scope, &text).await?;
		// Content may have changed, so every model's vector is stale.
		self.backends.vectors.remove(&unit_ids, None).await?;

		if text.is_empty() {
			return Ok(());
		}

		let model = self.default_model();

		match self.embed_texts(model, std::slice::from_ref(&text)).await {
			Ok(mut vectors) => {
				let Some(vec) = vectors.pop() else {
					return Ok(());
				};

				if let Err(err) =
					self.backends.vectors.upsert(&event.event_id, model, &scope, &vec).await
				{
					tracing::warn!(
						error = %err,
						unit_id = %event.event_id,
						"Vector write failed. Unit left for embedding backfill."
					);
				}
			},
			Err(err) => {
				tracing::warn!(
					error = %err,
					unit_id = %event.event_id,
					"Embedding failed. Unit left for embedding backfill."
				);
			},
		}

		Ok(())
	}

	/// Drops an event from both indexes and re-segments every key that claimed it. Call after
	/// the source row is gone.
	pub async fn remove_event(&self, event_id: &str) -> Result<()> {
		let unit_ids = [event_id.to_string()];

		self.backends.lexical.remove(&unit_ids).await?;
		self.backends.vectors.remove(&unit_ids, None).await?;

		for definition in self.definitions.values() {
			let _definition_guard = self.locks.definition_shared(&definition.name).await;
			let Some(owner) = self.backends.episodes.member_episode(&definition.name, event_id).await?
			else {
				continue;
			};
			let _key_guard = self.locks.key(&definition.name, &owner.key).await;

			self.rescan_key(definition, owner.key).await?;
		}

		Ok(())
	}

	/// Indexes a new or edited event and folds it into the episodes of every definition whose
	/// scope covers its channel, touching only the event's own key.
	pub async fn ingest_event(&self, event: &Event) -> Result<Vec<IngestOutcome>> {
		self.index_event(event).await?;

		let mut outcomes = Vec::with_capacity(self.definitions.len());

		for definition in self.definitions.values() {
			let action = self.ingest_into(definition, event).await?;

			outcomes.push(IngestOutcome { definition_name: definition.name.clone(), action });
		}

		Ok(outcomes)
	}

	/// Embeds up to `batch` units that have a lexical entry but no vector for `model` (default:
	/// the configured model). Returns how many vectors were written.
	pub async fn embed_missing(&self, model: Option<&str>, batch: usize) -> Result<usize> {
		let model = model.unwrap_or_else(|| self.default_model());
		let pending = self.backends.vectors.pending(model, batch).await?;

		if pending.is_empty() {
			return Ok(0);
		}

		let texts: Vec<String> = pending.iter().map(|unit| unit.text.clone()).collect();
		let vectors = self.embed_texts(model, &texts).await?;

		for (unit, vec) in pending.iter().zip(&vectors) {
			self.backends.vectors.upsert(&unit.unit_id, model, &unit.scope, vec).await?;
		}

		tracing::info!(model, count = pending.len(), "Backfilled embeddings.");

		Ok(pending.len())
	}

	/// Calls the embedding provider under its configured timeout and checks the response shape.
	pub(crate) async fn embed_texts(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
		let cfg = &self.cfg.providers.embedding;
		let call = self.providers.embedding.embed(cfg, model, texts);
		let vectors = tokio::time::timeout(Duration::from_millis(cfg.timeout_ms), call)
			.await
			.map_err(|_| Error::Provider {
				message: format!("Embedding request exceeded {} ms.", cfg.timeout_ms),
			})??;

		if vectors.len() != texts.len() {
			return Err(Error::Provider {
				message: format!(
					"Embedding provider returned {} vectors for {} inputs.",
					vectors.len(),
					texts.len()
				),
			});
		}
		if vectors.iter().any(|vec| vec.is_empty() || vec.iter().any(|value| !value.is_finite())) {
			return Err(Error::Provider {
				message: "Embedding provider returned an empty or non-finite vector.".to_string(),
			});
		}

		Ok(vectors)
	}

	async fn ingest_into(&self, definition: &Definition, event: &Event) -> Result<IngestAction> {
		if !definition.covers_channel(&event.channel) {
			return Ok(IngestAction::Skipped);
		}

		let key = definition.policy.episode_key(event);
		let definition_guard = self.locks.definition_shared(&definition.name).await;
		let key_guard = self.locks.key(&definition.name, &key).await;
		let latest = self.backends.episodes.latest_episode(&definition.name, &key).await?;
		let owner = self.backends.episodes.member_episode(&definition.name, &event.event_id).await?;

		// The event is already claimed by an episode other than the latest of its key: either an
		// older episode of the same key or one of a key the event no longer maps to.
		if let Some(owner) = owner
			&& latest.as_ref().is_none_or(|latest| latest.episode_id != owner.episode_id)
		{
			if owner.key == key {
				self.rescan_key(definition, key).await?;

				return Ok(IngestAction::Rescanned);
			}

			drop(key_guard);
			drop(definition_guard);

			// Two keys change together, so the whole definition is held.
			let _guard = self.locks.definition_exclusive(&definition.name).await;

			self.rescan_key(definition, owner.key).await?;
			self.rescan_key(definition, key).await?;

			return Ok(IngestAction::Rescanned);
		}

		let (episode, action) = match segmentation::plan_ingest(definition, latest.as_ref(), event) {
			IngestPlan::Skip => return Ok(IngestAction::Skipped),
			IngestPlan::Rescan(key) => {
				self.rescan_key(definition, key).await?;

				return Ok(IngestAction::Rescanned);
			},
			IngestPlan::Refresh(episode) => (episode, IngestAction::Refreshed),
			IngestPlan::Extend(episode) => (episode, IngestAction::Extended),
			IngestPlan::Open(episode) => (episode, IngestAction::Opened),
		};
		let indexed = self.summarize_fetched(episode).await?;

		self.backends.episodes.upsert_episode(&indexed).await?;

		tracing::debug!(
			definition = %definition.name,
			episode_id = %indexed.episode.episode_id,
			action = ?action,
			"Applied incremental ingest."
		);

		Ok(action)
	}
}
