use time::OffsetDateTime;
use uuid::Uuid;

use relay_domain::{
	event::Event,
	segmentation::{Episode, EpisodeEvent, EpisodeKey, ThreadKey},
	unit::{UnitKind, UnitScope},
};

use crate::{Error, Result};

#[derive(Debug, sqlx::FromRow)]
pub struct EventRow {
	pub event_id: String,
	pub ingest_seq: i64,
	pub ts: i64,
	pub channel: String,
	pub content: String,
	pub thread_id: Option<String>,
	pub reply_to: Option<String>,
	pub title: Option<String>,
}
impl From<EventRow> for Event {
	fn from(row: EventRow) -> Self {
		Self {
			event_id: row.event_id,
			ts: row.ts,
			channel: row.channel,
			content: row.content,
			thread_id: row.thread_id,
			reply_to: row.reply_to,
			title: row.title,
		}
	}
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EpisodeRow {
	pub definition_name: String,
	pub episode_id: Uuid,
	pub channel: String,
	pub thread_key: String,
	pub thread_id: Option<String>,
	pub start_ts: i64,
	pub end_ts: i64,
	pub event_count: i32,
}
impl EpisodeRow {
	pub fn from_episode(episode: &Episode) -> Result<Self> {
		let event_count = i32::try_from(episode.event_count()).map_err(|_| {
			Error::InvalidArgument(format!("Episode {} has too many events.", episode.episode_id))
		})?;

		Ok(Self {
			definition_name: episode.definition_name.clone(),
			episode_id: episode.episode_id,
			channel: episode.key.channel.clone(),
			thread_key: episode.key.thread_key(),
			thread_id: episode.thread_id().map(str::to_string),
			start_ts: episode.start_ts,
			end_ts: episode.end_ts,
			event_count,
		})
	}

	/// Rebuilds the domain episode. `members` must already be in (ts, event id) order.
	pub fn into_episode(self, members: Vec<EpisodeEvent>) -> Result<Episode> {
		let thread = ThreadKey::parse(&self.thread_key).ok_or_else(|| {
			Error::CorruptRow(format!(
				"Episode {} has unknown thread key {:?}.",
				self.episode_id, self.thread_key
			))
		})?;

		if members.len() != self.event_count as usize {
			return Err(Error::CorruptRow(format!(
				"Episode {} lists {} events but has {} members.",
				self.episode_id,
				self.event_count,
				members.len()
			)));
		}

		Ok(Episode {
			episode_id: self.episode_id,
			definition_name: self.definition_name,
			key: EpisodeKey { channel: self.channel, thread },
			start_ts: self.start_ts,
			end_ts: self.end_ts,
			events: members,
		})
	}
}

#[derive(Debug, sqlx::FromRow)]
pub struct EpisodeEventRow {
	pub episode_id: Uuid,
	pub event_id: String,
	pub ts: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct LexicalHit {
	pub unit_id: String,
	pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
	pub unit_id: String,
	/// Cosine similarity mapped onto [0, 1].
	pub score: f32,
}

/// A lexical entry that has no embedding yet for some model.
#[derive(Debug, sqlx::FromRow)]
pub struct PendingUnit {
	pub unit_id: String,
	pub unit_kind: String,
	pub channel: String,
	pub definition_name: Option<String>,
	pub thread_id: Option<String>,
	pub content: String,
}
impl PendingUnit {
	pub fn scope(&self) -> Result<UnitScope> {
		let kind = UnitKind::parse(&self.unit_kind).ok_or_else(|| {
			Error::CorruptRow(format!("Unit {} has unknown kind {:?}.", self.unit_id, self.unit_kind))
		})?;

		Ok(UnitScope {
			kind,
			channel: self.channel.clone(),
			definition_name: self.definition_name.clone(),
			thread_id: self.thread_id.clone(),
		})
	}
}

#[derive(Debug)]
pub struct RetrievalRecord {
	pub record_id: Uuid,
	pub query: String,
	pub model: Option<String>,
	pub unit_kind: String,
	pub unit_ids: Vec<String>,
	pub ts: OffsetDateTime,
}
