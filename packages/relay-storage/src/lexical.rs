use sqlx::{PgExecutor, Postgres, QueryBuilder};

use relay_domain::{
	text,
	unit::{UnitFilter, UnitScope},
};

use crate::{Result, filter, models::LexicalHit};

/// Upserts the lexical entry of a unit. Tokens are produced by the shared tokenizer, so the
/// stored vector and the query side always agree on case folding and stemming.
pub async fn upsert_lexical_entry<'e, E>(
	executor: E,
	unit_id: &str,
	scope: &UnitScope,
	content: &str,
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	let document = lexeme_document(content);

	sqlx::query(
		"\
INSERT INTO lexical_entries (
\tunit_id,
\tunit_kind,
\tchannel,
\tdefinition_name,
\tthread_id,
\tcontent,
\ttokens
)
VALUES ($1,$2,$3,$4,$5,$6,to_tsvector('simple', $7))
ON CONFLICT (unit_id) DO UPDATE
SET
\tunit_kind = EXCLUDED.unit_kind,
\tchannel = EXCLUDED.channel,
\tdefinition_name = EXCLUDED.definition_name,
\tthread_id = EXCLUDED.thread_id,
\tcontent = EXCLUDED.content,
\ttokens = EXCLUDED.tokens,
\tupdated_at = now()",
	)
	.bind(unit_id)
	.bind(scope.kind.as_str())
	.bind(scope.channel.as_str())
	.bind(scope.definition_name.as_deref())
	.bind(scope.thread_id.as_deref())
	.bind(content)
	.bind(document)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn delete_lexical_entries<'e, E>(executor: E, unit_ids: &[String]) -> Result<u64>
where
	E: PgExecutor<'e>,
{
	if unit_ids.is_empty() {
		return Ok(0);
	}

	let result = sqlx::query("DELETE FROM lexical_entries WHERE unit_id = ANY($1)")
		.bind(unit_ids)
		.execute(executor)
		.await?;

	Ok(result.rows_affected())
}

/// Stored content of the given units, used to detect which summaries changed.
pub async fn lexical_contents<'e, E>(
	executor: E,
	unit_ids: &[String],
) -> Result<Vec<(String, String)>>
where
	E: PgExecutor<'e>,
{
	if unit_ids.is_empty() {
		return Ok(Vec::new());
	}

	let rows = sqlx::query_as::<_, (String, String)>(
		"SELECT unit_id, content FROM lexical_entries WHERE unit_id = ANY($1)",
	)
	.bind(unit_ids)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

/// Any-term match ranked by `ts_rank_cd`. Scores are raw and unbounded; callers normalize them
/// within the candidate set.
pub async fn search_lexical<'e, E>(
	executor: E,
	query: &str,
	unit_filter: &UnitFilter,
	limit: u32,
) -> Result<Vec<LexicalHit>>
where
	E: PgExecutor<'e>,
{
	let Some(tsquery) = any_term_tsquery(query) else {
		return Ok(Vec::new());
	};
	let mut builder = QueryBuilder::<Postgres>::new(
		"\
SELECT unit_id, ts_rank_cd(tokens, query)::real AS score
FROM lexical_entries, to_tsquery('simple', ",
	);

	builder.push_bind(tsquery);
	builder.push(") AS query\nWHERE tokens @@ query");

	filter::push_unit_filter(&mut builder, unit_filter);

	builder.push("\nORDER BY score DESC, unit_id ASC\nLIMIT ");
	builder.push_bind(i64::from(limit));

	let rows = builder.build_query_as::<LexicalHit>().fetch_all(executor).await?;

	Ok(rows)
}

fn lexeme_document(content: &str) -> String {
	text::tokenize(content).iter().filter_map(|token| lexeme(token)).collect::<Vec<_>>().join(" ")
}

/// `a | b | c` over the distinct query terms, or `None` when the query has no usable term.
fn any_term_tsquery(query: &str) -> Option<String> {
	let lexemes: Vec<String> =
		text::query_terms(query).iter().filter_map(|term| lexeme(term)).collect();

	if lexemes.is_empty() {
		return None;
	}

	Some(lexemes.join(" | "))
}

/// Strips everything the tsquery parser would treat as an operator or separator.
fn lexeme(token: &str) -> Option<String> {
	let cleaned: String = token.chars().filter(|c| c.is_alphanumeric()).collect();

	(!cleaned.is_empty()).then_some(cleaned)
}
