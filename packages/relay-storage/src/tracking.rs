use sqlx::PgExecutor;

use crate::{Result, models::RetrievalRecord};

pub async fn insert_retrieval_record<'e, E>(executor: E, record: &RetrievalRecord) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
INSERT INTO retrieval_records (record_id, query, model, unit_kind, unit_ids, ts)
VALUES ($1,$2,$3,$4,$5,$6)",
	)
	.bind(record.record_id)
	.bind(record.query.as_str())
	.bind(record.model.as_deref())
	.bind(record.unit_kind.as_str())
	.bind(&record.unit_ids)
	.bind(record.ts)
	.execute(executor)
	.await?;

	Ok(())
}
