use std::collections::HashMap;

use relay_domain::{
	event::Event,
	segmentation::{self, Definition, Episode, EpisodeKey, SegmentScope},
};

use crate::{IndexedEpisode, RelayService, Result};

impl RelayService {
	/// Full re-segmentation of `scope` under one definition. The stored episodes of that scope
	/// are replaced by the result, which is also returned.
	pub async fn segment(&self, definition_name: &str, scope: &SegmentScope) -> Result<Vec<Episode>> {
		let definition = self.definition(definition_name)?.clone();
		let _guard = self.locks.definition_exclusive(&definition.name).await;

		self.segment_locked(&definition, scope).await
	}

	/// Re-scans every definition whose stored fingerprint is missing or differs from its current
	/// parameters. Returns the names that were re-scanned.
	pub async fn ensure_definitions_current(&self) -> Result<Vec<String>> {
		let mut rescanned = Vec::new();

		for definition in self.definitions.values() {
			let fingerprint = definition.fingerprint();
			let stored = self.backends.episodes.definition_fingerprint(&definition.name).await?;

			if stored.as_deref() == Some(fingerprint.as_str()) {
				continue;
			}

			tracing::info!(
				definition = %definition.name,
				previous = stored.as_deref().unwrap_or("none"),
				"Segmentation definition changed. Re-scanning."
			);

			let _guard = self.locks.definition_exclusive(&definition.name).await;

			self.segment_locked(definition, &SegmentScope::all()).await?;
			self.backends.episodes.set_definition_fingerprint(&definition.name, &fingerprint).await?;

			rescanned.push(definition.name.clone());
		}

		Ok(rescanned)
	}

	/// Caller holds the definition lock exclusively, or the shared lock plus the key lock of a
	/// key-scoped run.
	pub(crate) async fn segment_locked(
		&self,
		definition: &Definition,
		scope: &SegmentScope,
	) -> Result<Vec<Episode>> {
		let events = self.backends.events.list_events(scope).await?;
		let episodes = segmentation::segment(definition, &events);
		let indexed = self.summarize_all(&episodes, &events);
		let report =
			self.backends.episodes.replace_episodes(&definition.name, scope, &indexed).await?;

		tracing::info!(
			definition = %definition.name,
			events = events.len(),
			written = report.written,
			removed = report.removed,
			"Segmented scope."
		);

		Ok(episodes)
	}

	pub(crate) async fn rescan_key(&self, definition: &Definition, key: EpisodeKey) -> Result<()> {
		tracing::debug!(definition = %definition.name, key = %key, "Re-scanning episode key.");

		self.segment_locked(definition, &SegmentScope::key(key)).await?;

		Ok(())
	}

	/// Attaches a summary to an episode whose member events must be fetched.
	pub(crate) async fn summarize_fetched(&self, episode: Episode) -> Result<IndexedEpisode> {
		let ids: Vec<String> = episode.event_ids().map(str::to_string).collect();
		let events = self.backends.events.get_events(&ids).await?;

		Ok(self.summarize_with(episode, &contents_by_id(&events)))
	}

	fn summarize_all(&self, episodes: &[Episode], events: &[Event]) -> Vec<IndexedEpisode> {
		let contents = contents_by_id(events);

		episodes.iter().map(|episode| self.summarize_with(episode.clone(), &contents)).collect()
	}

	fn summarize_with(&self, episode: Episode, contents: &HashMap<&str, &str>) -> IndexedEpisode {
		let summary = segmentation::summarize(
			episode.event_ids().filter_map(|event_id| contents.get(event_id).copied()),
			self.cfg.segmentation.summary_max_chars as usize,
		);

		IndexedEpisode { episode, summary }
	}
}

fn contents_by_id(events: &[Event]) -> HashMap<&str, &str> {
	events.iter().map(|event| (event.event_id.as_str(), event.content.as_str())).collect()
}
