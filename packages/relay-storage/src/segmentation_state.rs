//! Bookkeeping for segmentation: the fingerprint each definition was last applied with and the
//! worker's ingest cursor.

use sqlx::PgExecutor;

use crate::Result;

pub async fn get_definition_fingerprint<'e, E>(
	executor: E,
	definition_name: &str,
) -> Result<Option<String>>
where
	E: PgExecutor<'e>,
{
	let fingerprint = sqlx::query_scalar::<_, String>(
		"SELECT fingerprint FROM segmentation_definitions WHERE definition_name = $1",
	)
	.bind(definition_name)
	.fetch_optional(executor)
	.await?;

	Ok(fingerprint)
}

pub async fn set_definition_fingerprint<'e, E>(
	executor: E,
	definition_name: &str,
	fingerprint: &str,
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
INSERT INTO segmentation_definitions (definition_name, fingerprint)
VALUES ($1, $2)
ON CONFLICT (definition_name) DO UPDATE
SET
\tfingerprint = EXCLUDED.fingerprint,
\tupdated_at = now()",
	)
	.bind(definition_name)
	.bind(fingerprint)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn get_cursor<'e, E>(executor: E, cursor_name: &str) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let last_seq = sqlx::query_scalar::<_, i64>(
		"SELECT last_seq FROM segmentation_cursors WHERE cursor_name = $1",
	)
	.bind(cursor_name)
	.fetch_optional(executor)
	.await?;

	Ok(last_seq.unwrap_or(0))
}

pub async fn set_cursor<'e, E>(executor: E, cursor_name: &str, last_seq: i64) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
INSERT INTO segmentation_cursors (cursor_name, last_seq)
VALUES ($1, $2)
ON CONFLICT (cursor_name) DO UPDATE
SET
\tlast_seq = GREATEST(segmentation_cursors.last_seq, EXCLUDED.last_seq),
\tupdated_at = now()",
	)
	.bind(cursor_name)
	.bind(last_seq)
	.execute(executor)
	.await?;

	Ok(())
}
