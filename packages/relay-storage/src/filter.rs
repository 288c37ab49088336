use sqlx::{Postgres, QueryBuilder};

use relay_domain::unit::UnitFilter;

/// Appends one `AND` predicate per constrained field, in a fixed order: kind, channels,
/// definition, thread. Both index tables carry the same scope columns.
pub fn push_unit_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &UnitFilter) {
	if let Some(kind) = filter.kind {
		builder.push(" AND unit_kind = ");
		builder.push_bind(kind.as_str());
	}
	if !filter.channels.is_empty() {
		builder.push(" AND channel = ANY(");
		builder.push_bind(filter.channels.clone());
		builder.push(")");
	}
	if let Some(definition_name) = filter.definition_name.as_ref() {
		builder.push(" AND definition_name = ");
		builder.push_bind(definition_name.clone());
	}
	if let Some(thread_id) = filter.thread_id.as_ref() {
		builder.push(" AND thread_id = ");
		builder.push_bind(thread_id.clone());
	}
}
