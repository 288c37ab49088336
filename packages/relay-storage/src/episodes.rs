use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use relay_domain::segmentation::EpisodeEvent;

use crate::{
	Result,
	models::{EpisodeEventRow, EpisodeRow},
};

const EPISODE_COLUMNS: &str = "\
SELECT
\tdefinition_name,
\tepisode_id,
\tchannel,
\tthread_key,
\tthread_id,
\tstart_ts,
\tend_ts,
\tevent_count
FROM episodes";

pub async fn latest_episode<'e, E>(
	executor: E,
	definition_name: &str,
	channel: &str,
	thread_key: &str,
) -> Result<Option<EpisodeRow>>
where
	E: PgExecutor<'e>,
{
	let row = sqlx::query_as::<_, EpisodeRow>(&format!(
		"{EPISODE_COLUMNS}
WHERE definition_name = $1 AND channel = $2 AND thread_key = $3
ORDER BY end_ts DESC, start_ts DESC, episode_id DESC
LIMIT 1"
	))
	.bind(definition_name)
	.bind(channel)
	.bind(thread_key)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn get_episodes<'e, E>(executor: E, episode_ids: &[Uuid]) -> Result<Vec<EpisodeRow>>
where
	E: PgExecutor<'e>,
{
	if episode_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, EpisodeRow>(&format!(
		"{EPISODE_COLUMNS}\nWHERE episode_id = ANY($1)"
	))
	.bind(episode_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// The episode that currently claims `event_id` under `definition_name`, if any.
pub async fn member_episode<'e, E>(
	executor: E,
	definition_name: &str,
	event_id: &str,
) -> Result<Option<EpisodeRow>>
where
	E: PgExecutor<'e>,
{
	let row = sqlx::query_as::<_, EpisodeRow>(
		"\
SELECT
\te.definition_name,
\te.episode_id,
\te.channel,
\te.thread_key,
\te.thread_id,
\te.start_ts,
\te.end_ts,
\te.event_count
FROM episode_events m
JOIN episodes e ON e.definition_name = m.definition_name AND e.episode_id = m.episode_id
WHERE m.definition_name = $1 AND m.event_id = $2",
	)
	.bind(definition_name)
	.bind(event_id)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

/// Ids of the stored episodes a re-segmentation of the given scope replaces. Empty `channels`
/// means every channel; `thread_key` narrows to a single key.
pub async fn list_episode_ids_in_scope<'e, E>(
	executor: E,
	definition_name: &str,
	channels: &[String],
	thread_key: Option<&str>,
) -> Result<Vec<Uuid>>
where
	E: PgExecutor<'e>,
{
	let ids = sqlx::query_scalar::<_, Uuid>(
		"\
SELECT episode_id
FROM episodes
WHERE definition_name = $1
\tAND (cardinality($2::text[]) = 0 OR channel = ANY($2::text[]))
\tAND ($3::text IS NULL OR thread_key = $3)",
	)
	.bind(definition_name)
	.bind(channels)
	.bind(thread_key)
	.fetch_all(executor)
	.await?;

	Ok(ids)
}

/// Members of the given episodes ordered by (episode, ts, event id).
pub async fn list_episode_members<'e, E>(
	executor: E,
	episode_ids: &[Uuid],
) -> Result<Vec<EpisodeEventRow>>
where
	E: PgExecutor<'e>,
{
	if episode_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, EpisodeEventRow>(
		"\
SELECT episode_id, event_id, ts
FROM episode_events
WHERE episode_id = ANY($1)
ORDER BY episode_id ASC, ts ASC, event_id ASC",
	)
	.bind(episode_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub async fn upsert_episode<'e, E>(executor: E, row: &EpisodeRow) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
INSERT INTO episodes (
\tdefinition_name,
\tepisode_id,
\tchannel,
\tthread_key,
\tthread_id,
\tstart_ts,
\tend_ts,
\tevent_count
)
VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
ON CONFLICT (definition_name, episode_id) DO UPDATE
SET
\tchannel = EXCLUDED.channel,
\tthread_key = EXCLUDED.thread_key,
\tthread_id = EXCLUDED.thread_id,
\tstart_ts = EXCLUDED.start_ts,
\tend_ts = EXCLUDED.end_ts,
\tevent_count = EXCLUDED.event_count,
\tupdated_at = now()",
	)
	.bind(row.definition_name.as_str())
	.bind(row.episode_id)
	.bind(row.channel.as_str())
	.bind(row.thread_key.as_str())
	.bind(row.thread_id.as_deref())
	.bind(row.start_ts)
	.bind(row.end_ts)
	.bind(row.event_count)
	.execute(executor)
	.await?;

	Ok(())
}

/// Deletes episodes; their memberships go with them.
pub async fn delete_episodes<'e, E>(
	executor: E,
	definition_name: &str,
	episode_ids: &[Uuid],
) -> Result<u64>
where
	E: PgExecutor<'e>,
{
	if episode_ids.is_empty() {
		return Ok(0);
	}

	let result = sqlx::query(
		"DELETE FROM episodes WHERE definition_name = $1 AND episode_id = ANY($2)",
	)
	.bind(definition_name)
	.bind(episode_ids)
	.execute(executor)
	.await?;

	Ok(result.rows_affected())
}

pub async fn clear_episode_members<'e, E>(
	executor: E,
	definition_name: &str,
	episode_ids: &[Uuid],
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	if episode_ids.is_empty() {
		return Ok(());
	}

	sqlx::query("DELETE FROM episode_events WHERE definition_name = $1 AND episode_id = ANY($2)")
		.bind(definition_name)
		.bind(episode_ids)
		.execute(executor)
		.await?;

	Ok(())
}

/// Rewrites the membership of one episode. Fails with a unique violation if another episode of
/// the same definition still claims one of the events.
pub async fn write_episode_members(
	conn: &mut PgConnection,
	definition_name: &str,
	episode_id: Uuid,
	members: &[EpisodeEvent],
) -> Result<()> {
	clear_episode_members(&mut *conn, definition_name, &[episode_id]).await?;

	let event_ids: Vec<&str> = members.iter().map(|member| member.event_id.as_str()).collect();
	let timestamps: Vec<i64> = members.iter().map(|member| member.ts).collect();

	sqlx::query(
		"\
INSERT INTO episode_events (definition_name, event_id, episode_id, ts)
SELECT $1, member.event_id, $2, member.ts
FROM unnest($3::text[], $4::bigint[]) AS member(event_id, ts)",
	)
	.bind(definition_name)
	.bind(episode_id)
	.bind(event_ids)
	.bind(timestamps)
	.execute(&mut *conn)
	.await?;

	Ok(())
}
