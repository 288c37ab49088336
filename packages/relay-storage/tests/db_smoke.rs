use relay_config::Postgres;
use relay_domain::{
	segmentation::{EpisodeKey, SegmentScope, ThreadKey},
	unit::{UnitFilter, UnitScope},
};
use relay_storage::{db::Db, events, lexical, segmentation_state, vectors};
use relay_testkit::TestDatabase;

async fn bootstrap(test_db: &TestDatabase) -> Db {
	let cfg = Postgres { dsn: test_db.dsn().to_string(), pool_max_conns: 2 };
	let db = Db::connect(&cfg).await.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	db
}

async fn insert_event(db: &Db, event_id: &str, ts: i64, thread_id: Option<&str>, content: &str) {
	sqlx::query(
		"\
INSERT INTO events (event_id, source_adapter, source_id, ts, channel, content, thread_id)
VALUES ($1, 'test', $1, $2, 'email', $3, $4)",
	)
	.bind(event_id)
	.bind(ts)
	.bind(content)
	.bind(thread_id)
	.execute(&db.pool)
	.await
	.expect("Failed to insert event.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set RELAY_PG_DSN to run."]
async fn schema_bootstrap_is_idempotent() {
	let Some(base_dsn) = relay_testkit::env_dsn() else {
		eprintln!("Skipping schema_bootstrap_is_idempotent; set RELAY_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = bootstrap(&test_db).await;

	db.ensure_schema().await.expect("Failed to re-apply schema.");

	let count: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM information_schema.tables WHERE table_name = 'lexical_entries'",
	)
	.fetch_one(&db.pool)
	.await
	.expect("Failed to query schema tables.");

	assert_eq!(count, 1);

	db.pool.close().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set RELAY_PG_DSN to run."]
async fn events_are_listed_by_key_in_order() {
	let Some(base_dsn) = relay_testkit::env_dsn() else {
		eprintln!("Skipping events_are_listed_by_key_in_order; set RELAY_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = bootstrap(&test_db).await;

	insert_event(&db, "b", 10, Some("T1"), "second").await;
	insert_event(&db, "a", 10, Some("T1"), "first").await;
	insert_event(&db, "c", 5, None, "loose").await;

	let key = EpisodeKey { channel: "email".to_string(), thread: ThreadKey::Thread("T1".to_string()) };
	let rows = events::list_events(&db.pool, &SegmentScope::key(key)).await.expect("list events");
	let ids: Vec<&str> = rows.iter().map(|row| row.event_id.as_str()).collect();

	assert_eq!(ids, vec!["a", "b"]);

	let after = events::list_events_after(&db.pool, 0, 10).await.expect("list after");

	assert_eq!(after.len(), 3);
	assert!(after.windows(2).all(|pair| pair[0].ingest_seq < pair[1].ingest_seq));

	db.pool.close().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set RELAY_PG_DSN to run."]
async fn lexical_and_vector_search_respect_filters() {
	let Some(base_dsn) = relay_testkit::env_dsn() else {
		eprintln!(
			"Skipping lexical_and_vector_search_respect_filters; set RELAY_PG_DSN to run this test."
		);

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = bootstrap(&test_db).await;
	let email = UnitScope::event("email", None);
	let slack = UnitScope::event("slack", None);

	lexical::upsert_lexical_entry(&db.pool, "1", &email, "Hello world").await.expect("index 1");
	lexical::upsert_lexical_entry(&db.pool, "2", &slack, "hello again").await.expect("index 2");
	vectors::upsert_unit_embedding(&db.pool, "1", "m", &email, &[1.0, 0.0])
		.await
		.expect("embed 1");
	vectors::upsert_unit_embedding(&db.pool, "2", "m", &slack, &[0.0, 1.0])
		.await
		.expect("embed 2");

	let hits = lexical::search_lexical(&db.pool, "HELLO", &UnitFilter::documents(["email"]), 10)
		.await
		.expect("lexical search");

	assert_eq!(hits.len(), 1);
	assert_eq!(hits[0].unit_id, "1");
	assert!(hits[0].score > 0.0);

	let hits = vectors::search_unit_embeddings(
		&db.pool,
		&[1.0, 0.0],
		"m",
		&UnitFilter::documents(Vec::<String>::new()),
		10,
	)
	.await
	.expect("vector search");

	assert_eq!(hits.len(), 2);
	assert_eq!(hits[0].unit_id, "1");
	assert!((hits[0].score - 1.0).abs() < 1e-5);
	assert!((hits[1].score - 0.5).abs() < 1e-5);

	let pending = vectors::list_units_missing_embedding(&db.pool, "other", 10)
		.await
		.expect("missing embeddings");

	assert_eq!(pending.len(), 2);

	db.pool.close().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set RELAY_PG_DSN to run."]
async fn cursor_never_moves_backwards() {
	let Some(base_dsn) = relay_testkit::env_dsn() else {
		eprintln!("Skipping cursor_never_moves_backwards; set RELAY_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = bootstrap(&test_db).await;

	assert_eq!(segmentation_state::get_cursor(&db.pool, "ingest").await.expect("cursor"), 0);

	segmentation_state::set_cursor(&db.pool, "ingest", 7).await.expect("set cursor");
	segmentation_state::set_cursor(&db.pool, "ingest", 3).await.expect("set cursor");

	assert_eq!(segmentation_state::get_cursor(&db.pool, "ingest").await.expect("cursor"), 7);

	db.pool.close().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
