pub fn render_schema() -> String {
	expand_includes(include_str!("../../../sql/init.sql"))
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"00_extensions.sql" => out.push_str(include_str!("../../../sql/00_extensions.sql")),
				"tables/001_events.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_events.sql")),
				"tables/002_episodes.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_episodes.sql")),
				"tables/003_episode_events.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_episode_events.sql")),
				"tables/004_lexical_entries.sql" =>
					out.push_str(include_str!("../../../sql/tables/004_lexical_entries.sql")),
				"tables/005_unit_embeddings.sql" =>
					out.push_str(include_str!("../../../sql/tables/005_unit_embeddings.sql")),
				"tables/006_retrieval_records.sql" =>
					out.push_str(include_str!("../../../sql/tables/006_retrieval_records.sql")),
				"tables/007_segmentation_state.sql" =>
					out.push_str(include_str!("../../../sql/tables/007_segmentation_state.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}
