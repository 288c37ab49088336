use time::OffsetDateTime;

use relay_domain::unit::UnitKind;

use crate::RelayService;

/// Which units a query surfaced, in response order.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalRecord {
	pub query: String,
	pub model: Option<String>,
	pub kind: UnitKind,
	pub unit_ids: Vec<String>,
	pub ts: OffsetDateTime,
}

impl RelayService {
	pub(crate) fn tracking_enabled(&self, requested: bool) -> bool {
		requested && self.cfg.tracking.enabled
	}

	/// Hands the record to the tracker on a detached task. Failures are logged and never reach
	/// the caller.
	pub(crate) fn track_detached(&self, record: RetrievalRecord) {
		let tracker = self.backends.tracker.clone();

		tokio::spawn(async move {
			if let Err(err) = tracker.track(&record).await {
				tracing::warn!(
					error = %err,
					kind = %record.kind,
					surfaced = record.unit_ids.len(),
					"Failed to record retrieval."
				);
			}
		});
	}
}
