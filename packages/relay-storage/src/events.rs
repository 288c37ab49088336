//! Read access to the event table. Rows are written by the event source.

use sqlx::{PgExecutor, Postgres, QueryBuilder};

use relay_domain::segmentation::{SegmentScope, ThreadKey};

use crate::{Result, models::EventRow};

const EVENT_COLUMNS: &str = "\
SELECT
\tevent_id,
\tingest_seq,
\tts,
\tchannel,
\tcontent,
\tthread_id,
\treply_to,
\ttitle
FROM events";

/// Events inside `scope`, ordered by (ts, event id).
pub async fn list_events<'e, E>(executor: E, scope: &SegmentScope) -> Result<Vec<EventRow>>
where
	E: PgExecutor<'e>,
{
	let mut builder = QueryBuilder::<Postgres>::new(EVENT_COLUMNS);

	builder.push("\nWHERE TRUE");

	if !scope.channels.is_empty() {
		builder.push(" AND channel = ANY(");
		builder.push_bind(scope.channels.clone());
		builder.push(")");
	}
	if let Some(key) = scope.key.as_ref() {
		builder.push(" AND channel = ");
		builder.push_bind(key.channel.clone());

		match &key.thread {
			ThreadKey::Thread(thread_id) => {
				builder.push(" AND thread_id = ");
				builder.push_bind(thread_id.clone());
			},
			ThreadKey::Unthreaded => {
				builder.push(" AND thread_id IS NULL");
			},
			ThreadKey::Event(event_id) => {
				builder.push(" AND thread_id IS NULL AND event_id = ");
				builder.push_bind(event_id.clone());
			},
		}
	}

	builder.push("\nORDER BY ts ASC, event_id ASC");

	let rows = builder.build_query_as::<EventRow>().fetch_all(executor).await?;

	Ok(rows)
}

pub async fn get_events<'e, E>(executor: E, event_ids: &[String]) -> Result<Vec<EventRow>>
where
	E: PgExecutor<'e>,
{
	if event_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, EventRow>(&format!(
		"{EVENT_COLUMNS}\nWHERE event_id = ANY($1)\nORDER BY ts ASC, event_id ASC"
	))
	.bind(event_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// Events written or edited after the ingest cursor, in ingest order.
pub async fn list_events_after<'e, E>(
	executor: E,
	after_seq: i64,
	limit: i64,
) -> Result<Vec<EventRow>>
where
	E: PgExecutor<'e>,
{
	let rows = sqlx::query_as::<_, EventRow>(&format!(
		"{EVENT_COLUMNS}\nWHERE ingest_seq > $1\nORDER BY ingest_seq ASC\nLIMIT $2"
	))
	.bind(after_seq)
	.bind(limit)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}
