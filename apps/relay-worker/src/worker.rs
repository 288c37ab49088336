use std::time::Duration;

use color_eyre::Result;

use relay_domain::event::Event;
use relay_service::RelayService;
use relay_storage::{db::Db, events, segmentation_state};

const INGEST_CURSOR: &str = "ingest";

pub struct WorkerState {
	pub db: Db,
	pub service: RelayService,
	pub worker: relay_config::Worker,
}

pub async fn run_worker(state: WorkerState) -> Result<()> {
	let poll_interval = Duration::from_millis(state.worker.poll_interval_ms);

	loop {
		match ingest_once(&state).await {
			Ok(0) => {},
			Ok(count) => tracing::info!(count, "Ingested events."),
			Err(err) => tracing::error!(error = %err, "Event ingestion failed."),
		}

		let embed_batch = state.worker.embed_batch_size as usize;

		if let Err(err) = state.service.embed_missing(None, embed_batch).await {
			tracing::error!(error = %err, "Embedding backfill failed.");
		}

		tokio::time::sleep(poll_interval).await;
	}
}

/// Ingests one batch past the cursor. The cursor advances only over events that were applied, so
/// a failing event is retried on the next poll.
pub async fn ingest_once(state: &WorkerState) -> Result<usize> {
	let cursor = segmentation_state::get_cursor(&state.db.pool, INGEST_CURSOR).await?;
	let rows =
		events::list_events_after(&state.db.pool, cursor, i64::from(state.worker.batch_size))
			.await?;
	let mut last_seq = cursor;
	let mut ingested = 0;

	for row in rows {
		let seq = row.ingest_seq;
		let event = Event::from(row);

		if let Err(err) = state.service.ingest_event(&event).await {
			tracing::error!(error = %err, event_id = %event.event_id, seq, "Failed to ingest event.");

			break;
		}

		last_seq = seq;
		ingested += 1;
	}

	if last_seq > cursor {
		segmentation_state::set_cursor(&state.db.pool, INGEST_CURSOR, last_seq).await?;
	}

	Ok(ingested)
}
