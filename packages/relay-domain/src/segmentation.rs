use std::{
	collections::{BTreeMap, HashSet},
	fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_config::{DefinitionConfig, POLICY_THREAD_BOUNDED, POLICY_TIME_GAP_BOUNDED};

use crate::{
	event::{Event, event_order},
	text,
};

const EPISODE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f0c_2b1e_92d4_4c57_a1f3_3c5e_7d20_9b41);

/// Closed set of segmentation policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
	/// One episode per (channel, thread); unthreaded events stand alone.
	ThreadBounded,
	/// Consecutive events of a (channel, thread) stay together while the gap is at most
	/// `max_gap_seconds`.
	TimeGapBounded { max_gap_seconds: i64 },
}
impl Policy {
	pub fn parse(kind: &str, max_gap_seconds: Option<i64>) -> Option<Self> {
		match (kind, max_gap_seconds) {
			(POLICY_THREAD_BOUNDED, None) => Some(Self::ThreadBounded),
			(POLICY_TIME_GAP_BOUNDED, Some(gap)) if gap > 0 =>
				Some(Self::TimeGapBounded { max_gap_seconds: gap }),
			_ => None,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Self::ThreadBounded => POLICY_THREAD_BOUNDED,
			Self::TimeGapBounded { .. } => POLICY_TIME_GAP_BOUNDED,
		}
	}

	/// Assigns an event to the key its episode is tracked under.
	pub fn episode_key(&self, event: &Event) -> EpisodeKey {
		let thread = match (self, event.thread_id.as_deref()) {
			(_, Some(thread_id)) => ThreadKey::Thread(thread_id.to_string()),
			(Self::ThreadBounded, None) => ThreadKey::Event(event.event_id.clone()),
			(Self::TimeGapBounded { .. }, None) => ThreadKey::Unthreaded,
		};

		EpisodeKey { channel: event.channel.clone(), thread }
	}

	/// Whether an event at `ts` joins the episode under the same key that currently ends at
	/// `end_ts`.
	fn continues(&self, end_ts: i64, ts: i64) -> bool {
		match self {
			Self::ThreadBounded => true,
			Self::TimeGapBounded { max_gap_seconds } => ts.saturating_sub(end_ts) <= *max_gap_seconds,
		}
	}

	/// Time-gap episodes under one key are distinguished by their first event; a thread-bounded
	/// key holds a single episode so its identity must survive earlier arrivals.
	fn anchors_on_first_event(&self) -> bool {
		matches!(self, Self::TimeGapBounded { .. })
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreadKey {
	Thread(String),
	Unthreaded,
	/// Singleton episode of an unthreaded event under a thread-bounded policy.
	Event(String),
}
impl ThreadKey {
	/// Inverse of [`EpisodeKey::thread_key`].
	pub fn parse(raw: &str) -> Option<Self> {
		if raw == "-" {
			return Some(Self::Unthreaded);
		}
		if let Some(thread_id) = raw.strip_prefix("t:") {
			return Some(Self::Thread(thread_id.to_string()));
		}

		raw.strip_prefix("e:").map(|event_id| Self::Event(event_id.to_string()))
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpisodeKey {
	pub channel: String,
	pub thread: ThreadKey,
}
impl EpisodeKey {
	/// Stable textual form, used as the persisted `thread_key` column.
	pub fn thread_key(&self) -> String {
		match &self.thread {
			ThreadKey::Thread(thread_id) => format!("t:{thread_id}"),
			ThreadKey::Unthreaded => "-".to_string(),
			ThreadKey::Event(event_id) => format!("e:{event_id}"),
		}
	}

	pub fn thread_id(&self) -> Option<&str> {
		match &self.thread {
			ThreadKey::Thread(thread_id) => Some(thread_id.as_str()),
			_ => None,
		}
	}
}
impl Display for EpisodeKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.channel, self.thread_key())
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
	pub name: String,
	pub policy: Policy,
	/// Sorted channel scope. Empty means every channel.
	pub channels: Vec<String>,
}
impl Definition {
	pub fn new(name: impl Into<String>, policy: Policy) -> Self {
		Self { name: name.into(), policy, channels: Vec::new() }
	}

	pub fn from_config(cfg: &DefinitionConfig) -> Option<Self> {
		let policy = Policy::parse(cfg.kind.as_str(), cfg.max_gap_seconds)?;

		Some(Self::new(cfg.name.clone(), policy).with_channels(cfg.channels.iter().cloned()))
	}

	pub fn with_channels<I>(mut self, channels: I) -> Self
	where
		I: IntoIterator<Item = String>,
	{
		let mut channels: Vec<String> = channels.into_iter().collect();

		channels.sort();
		channels.dedup();

		self.channels = channels;

		self
	}

	pub fn covers_channel(&self, channel: &str) -> bool {
		self.channels.is_empty() || self.channels.iter().any(|scoped| scoped == channel)
	}

	/// Changes whenever the policy parameters or the channel scope change.
	pub fn fingerprint(&self) -> String {
		let gap = match self.policy {
			Policy::ThreadBounded => String::new(),
			Policy::TimeGapBounded { max_gap_seconds } => max_gap_seconds.to_string(),
		};
		let material = format!("{}|{}|{}", self.policy.kind(), gap, self.channels.join(","));

		blake3::hash(material.as_bytes()).to_hex().to_string()
	}

	fn episode_id(&self, key: &EpisodeKey, first_event_id: &str) -> Uuid {
		let anchor = if self.policy.anchors_on_first_event() { first_event_id } else { "" };
		let name = format!("{}\u{1f}{}\u{1f}{}\u{1f}{}", self.name, key.channel, key.thread_key(), anchor);

		Uuid::new_v5(&EPISODE_ID_NAMESPACE, name.as_bytes())
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeEvent {
	pub event_id: String,
	pub ts: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
	pub episode_id: Uuid,
	pub definition_name: String,
	pub key: EpisodeKey,
	pub start_ts: i64,
	pub end_ts: i64,
	/// Members ordered by (timestamp, event id).
	pub events: Vec<EpisodeEvent>,
}
impl Episode {
	fn open(definition: &Definition, key: EpisodeKey, event: &Event) -> Self {
		Self {
			episode_id: definition.episode_id(&key, &event.event_id),
			definition_name: definition.name.clone(),
			key,
			start_ts: event.ts,
			end_ts: event.ts,
			events: vec![EpisodeEvent { event_id: event.event_id.clone(), ts: event.ts }],
		}
	}

	pub fn channel(&self) -> &str {
		self.key.channel.as_str()
	}

	pub fn thread_id(&self) -> Option<&str> {
		self.key.thread_id()
	}

	pub fn event_count(&self) -> usize {
		self.events.len()
	}

	pub fn event_ids(&self) -> impl Iterator<Item = &str> {
		self.events.iter().map(|member| member.event_id.as_str())
	}

	pub fn contains(&self, event_id: &str) -> bool {
		self.events.iter().any(|member| member.event_id == event_id)
	}

	fn insert(&mut self, event: &Event) {
		let member = EpisodeEvent { event_id: event.event_id.clone(), ts: event.ts };
		let position = self
			.events
			.partition_point(|existing| (existing.ts, existing.event_id.as_str()) < (member.ts, member.event_id.as_str()));

		self.events.insert(position, member);

		if let (Some(first), Some(last)) = (self.events.first(), self.events.last()) {
			self.start_ts = first.ts;
			self.end_ts = last.ts;
		}
	}
}

/// Narrows a segmentation run. `None` fields are unconstrained.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentScope {
	pub channels: Vec<String>,
	pub key: Option<EpisodeKey>,
}
impl SegmentScope {
	pub fn all() -> Self {
		Self::default()
	}

	pub fn channels<I>(channels: I) -> Self
	where
		I: IntoIterator<Item = String>,
	{
		Self { channels: channels.into_iter().collect(), key: None }
	}

	pub fn key(key: EpisodeKey) -> Self {
		Self { channels: vec![key.channel.clone()], key: Some(key) }
	}

	pub fn covers_channel(&self, channel: &str) -> bool {
		self.channels.is_empty() || self.channels.iter().any(|scoped| scoped == channel)
	}
}

/// Full segmentation of `events` under `definition`.
///
/// Events outside the definition's channel scope are ignored and duplicate identifiers are
/// counted once. The output is ordered by start time, then channel, thread key, and episode id, and
/// depends only on the event set, never on the input order.
pub fn segment(definition: &Definition, events: &[Event]) -> Vec<Episode> {
	let mut ordered: Vec<&Event> =
		events.iter().filter(|event| definition.covers_channel(&event.channel)).collect();

	ordered.sort_by(|left, right| event_order(left, right));

	let mut seen = HashSet::new();
	let mut open: BTreeMap<EpisodeKey, Episode> = BTreeMap::new();
	let mut out = Vec::new();

	for event in ordered {
		if !seen.insert(event.event_id.as_str()) {
			continue;
		}

		let key = definition.policy.episode_key(event);

		match open.get_mut(&key) {
			Some(current) if definition.policy.continues(current.end_ts, event.ts) =>
				current.insert(event),
			_ => {
				let fresh = Episode::open(definition, key.clone(), event);

				if let Some(closed) = open.insert(key, fresh) {
					out.push(closed);
				}
			},
		}
	}

	out.extend(open.into_values());
	out.sort_by(|left, right| {
		left.start_ts
			.cmp(&right.start_ts)
			.then_with(|| left.key.cmp(&right.key))
			.then_with(|| left.episode_id.cmp(&right.episode_id))
	});

	out
}

/// What an incremental ingest of one event does to its key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestPlan {
	/// The channel is outside the definition's scope.
	Skip,
	/// The event is already a member at the same timestamp; only the episode's indexed text needs
	/// refreshing.
	Refresh(Episode),
	/// The latest episode grows to include the event.
	Extend(Episode),
	/// The event starts a new episode after the latest one.
	Open(Episode),
	/// The event lands inside existing history; the key must be re-segmented from scratch.
	Rescan(EpisodeKey),
}

/// Resolves an ingest against the latest episode of the event's key, without touching any other
/// episode.
pub fn plan_ingest(definition: &Definition, latest: Option<&Episode>, event: &Event) -> IngestPlan {
	if !definition.covers_channel(&event.channel) {
		return IngestPlan::Skip;
	}

	let key = definition.policy.episode_key(event);
	let Some(latest) = latest else {
		return IngestPlan::Open(Episode::open(definition, key, event));
	};

	if let Some(member) = latest.events.iter().find(|member| member.event_id == event.event_id) {
		// A moved timestamp can change boundaries anywhere under the key.
		return if member.ts == event.ts {
			IngestPlan::Refresh(latest.clone())
		} else {
			IngestPlan::Rescan(key)
		};
	}

	match definition.policy {
		Policy::ThreadBounded => {
			let mut extended = latest.clone();

			extended.insert(event);

			IngestPlan::Extend(extended)
		},
		Policy::TimeGapBounded { .. } if event.ts < latest.end_ts => IngestPlan::Rescan(key),
		Policy::TimeGapBounded { .. } =>
			if definition.policy.continues(latest.end_ts, event.ts) {
				let mut extended = latest.clone();

				extended.insert(event);

				IngestPlan::Extend(extended)
			} else {
				IngestPlan::Open(Episode::open(definition, key, event))
			},
	}
}

/// Lexical text unit of an episode: member contents in membership order, whitespace collapsed,
/// truncated to `max_chars` characters.
pub fn summarize<'a, I>(contents: I, max_chars: usize) -> String
where
	I: IntoIterator<Item = &'a str>,
{
	let mut out = String::new();

	for content in contents {
		let normalized = text::normalize_whitespace(content);

		if normalized.is_empty() {
			continue;
		}
		if !out.is_empty() {
			out.push(' ');
		}

		out.push_str(&normalized);

		if out.chars().count() >= max_chars {
			break;
		}
	}

	text::truncate_chars(&out, max_chars).trim_end().to_string()
}
