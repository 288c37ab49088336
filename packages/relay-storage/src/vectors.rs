use sqlx::{PgExecutor, Postgres, QueryBuilder};

use relay_domain::{
	similarity,
	unit::{UnitFilter, UnitScope},
};

use crate::{
	Error, Result, filter,
	models::{PendingUnit, VectorHit},
};

pub async fn upsert_unit_embedding<'e, E>(
	executor: E,
	unit_id: &str,
	model: &str,
	scope: &UnitScope,
	vec: &[f32],
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	let embedding_dim = embedding_dim(vec)?;

	sqlx::query(
		"\
INSERT INTO unit_embeddings (
\tunit_id,
\tmodel,
\tunit_kind,
\tchannel,
\tdefinition_name,
\tthread_id,
\tembedding_dim,
\tvec
)
VALUES ($1,$2,$3,$4,$5,$6,$7,$8::text::vector)
ON CONFLICT (unit_id, model) DO UPDATE
SET
\tunit_kind = EXCLUDED.unit_kind,
\tchannel = EXCLUDED.channel,
\tdefinition_name = EXCLUDED.definition_name,
\tthread_id = EXCLUDED.thread_id,
\tembedding_dim = EXCLUDED.embedding_dim,
\tvec = EXCLUDED.vec,
\tcreated_at = now()",
	)
	.bind(unit_id)
	.bind(model)
	.bind(scope.kind.as_str())
	.bind(scope.channel.as_str())
	.bind(scope.definition_name.as_deref())
	.bind(scope.thread_id.as_deref())
	.bind(embedding_dim)
	.bind(vector_to_pg(vec))
	.execute(executor)
	.await?;

	Ok(())
}

/// Removes vectors of the given units. `model = None` removes every model's vector.
pub async fn delete_unit_embeddings<'e, E>(
	executor: E,
	unit_ids: &[String],
	model: Option<&str>,
) -> Result<u64>
where
	E: PgExecutor<'e>,
{
	if unit_ids.is_empty() {
		return Ok(0);
	}

	let result = sqlx::query(
		"DELETE FROM unit_embeddings WHERE unit_id = ANY($1) AND ($2::text IS NULL OR model = $2)",
	)
	.bind(unit_ids)
	.bind(model)
	.execute(executor)
	.await?;

	Ok(result.rows_affected())
}

/// Exact cosine scan over vectors of `model` with the query's dimension. Vectors of another
/// dimension are never compared.
pub async fn search_unit_embeddings<'e, E>(
	executor: E,
	query_vec: &[f32],
	model: &str,
	unit_filter: &UnitFilter,
	limit: u32,
) -> Result<Vec<VectorHit>>
where
	E: PgExecutor<'e>,
{
	let embedding_dim = embedding_dim(query_vec)?;
	let mut builder = QueryBuilder::<Postgres>::new(
		"\
SELECT unit_id, (vec <=> ",
	);

	builder.push_bind(vector_to_pg(query_vec));
	builder.push("::text::vector)::real AS distance\nFROM unit_embeddings\nWHERE model = ");
	builder.push_bind(model.to_string());
	builder.push(" AND embedding_dim = ");
	builder.push_bind(embedding_dim);

	filter::push_unit_filter(&mut builder, unit_filter);

	builder.push("\nORDER BY distance ASC, unit_id ASC\nLIMIT ");
	builder.push_bind(i64::from(limit));

	let rows: Vec<(String, f32)> = builder.build_query_as().fetch_all(executor).await?;

	// Zero-norm vectors yield NaN distances and have no defined similarity.
	Ok(rows
		.into_iter()
		.filter(|(_, distance)| distance.is_finite())
		.map(|(unit_id, distance)| VectorHit {
			unit_id,
			score: similarity::unit_score_from_distance(distance),
		})
		.collect())
}

/// Lexical entries without a vector for `model`, oldest first.
pub async fn list_units_missing_embedding<'e, E>(
	executor: E,
	model: &str,
	limit: i64,
) -> Result<Vec<PendingUnit>>
where
	E: PgExecutor<'e>,
{
	let rows = sqlx::query_as::<_, PendingUnit>(
		"\
SELECT
\tl.unit_id,
\tl.unit_kind,
\tl.channel,
\tl.definition_name,
\tl.thread_id,
\tl.content
FROM lexical_entries l
LEFT JOIN unit_embeddings e ON e.unit_id = l.unit_id AND e.model = $1
WHERE e.unit_id IS NULL
ORDER BY l.updated_at ASC, l.unit_id ASC
LIMIT $2",
	)
	.bind(model)
	.bind(limit)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

pub fn vector_to_pg(vec: &[f32]) -> String {
	let mut out = String::with_capacity(vec.len() * 8);

	out.push('[');

	for (i, value) in vec.iter().enumerate() {
		if i > 0 {
			out.push(',');
		}

		out.push_str(&value.to_string());
	}

	out.push(']');

	out
}

fn embedding_dim(vec: &[f32]) -> Result<i32> {
	if vec.is_empty() {
		return Err(Error::InvalidArgument("Embedding vector must be non-empty.".to_string()));
	}
	if vec.iter().any(|value| !value.is_finite()) {
		return Err(Error::InvalidArgument("Embedding vector must be finite.".to_string()));
	}

	i32::try_from(vec.len())
		.map_err(|_| Error::InvalidArgument("Embedding vector is too long.".to_string()))
}
