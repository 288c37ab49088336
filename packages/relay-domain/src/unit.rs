use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
	Event,
	Episode,
}
impl UnitKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Event => "event",
			Self::Episode => "episode",
		}
	}

	pub fn parse(raw: &str) -> Option<Self> {
		match raw {
			"event" => Some(Self::Event),
			"episode" => Some(Self::Episode),
			_ => None,
		}
	}
}
impl Display for UnitKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Where an indexed text unit lives. Both indexes store it next to the unit id so filters can be
/// evaluated without joining the source tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitScope {
	pub kind: UnitKind,
	pub channel: String,
	pub definition_name: Option<String>,
	pub thread_id: Option<String>,
}
impl UnitScope {
	pub fn event(channel: impl Into<String>, thread_id: Option<String>) -> Self {
		Self { kind: UnitKind::Event, channel: channel.into(), definition_name: None, thread_id }
	}

	pub fn episode(
		definition_name: impl Into<String>,
		channel: impl Into<String>,
		thread_id: Option<String>,
	) -> Self {
		Self {
			kind: UnitKind::Episode,
			channel: channel.into(),
			definition_name: Some(definition_name.into()),
			thread_id,
		}
	}
}

/// Typed search filter. Every optional field maps to exactly one predicate, so the same filter
/// always compiles to the same shape in every backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitFilter {
	pub kind: Option<UnitKind>,
	/// Empty means every channel. Kept sorted and deduplicated.
	pub channels: Vec<String>,
	pub definition_name: Option<String>,
	pub thread_id: Option<String>,
}
impl UnitFilter {
	pub fn documents<I, S>(channels: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self { kind: Some(UnitKind::Event), ..Default::default() }.with_channels(channels)
	}

	pub fn episodes<I, S>(definition_name: &str, channels: I, thread_id: Option<&str>) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			kind: Some(UnitKind::Episode),
			definition_name: Some(definition_name.to_string()),
			thread_id: thread_id.map(str::to_string),
			..Default::default()
		}
		.with_channels(channels)
	}

	pub fn with_channels<I, S>(mut self, channels: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut channels: Vec<String> = channels
			.into_iter()
			.map(|channel| {
				let channel: String = channel.into();

				channel.trim().to_string()
			})
			.filter(|channel| !channel.is_empty())
			.collect();

		channels.sort();
		channels.dedup();

		self.channels = channels;

		self
	}

	pub fn matches(&self, scope: &UnitScope) -> bool {
		if let Some(kind) = self.kind
			&& kind != scope.kind
		{
			return false;
		}
		if !self.channels.is_empty() && self.channels.binary_search(&scope.channel).is_err() {
			return false;
		}
		if let Some(definition_name) = self.definition_name.as_deref()
			&& scope.definition_name.as_deref() != Some(definition_name)
		{
			return false;
		}
		if let Some(thread_id) = self.thread_id.as_deref()
			&& scope.thread_id.as_deref() != Some(thread_id)
		{
			return false;
		}

		true
	}
}
