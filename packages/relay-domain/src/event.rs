use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// One communication unit as delivered by the event source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
	pub event_id: String,
	/// Seconds since the Unix epoch.
	pub ts: i64,
	pub channel: String,
	pub content: String,
	pub thread_id: Option<String>,
	pub reply_to: Option<String>,
	/// Subject line or thread name, when the channel has one.
	pub title: Option<String>,
}

/// Timestamp first, identifier second.
pub fn event_order(left: &Event, right: &Event) -> Ordering {
	left.ts.cmp(&right.ts).then_with(|| left.event_id.cmp(&right.event_id))
}
