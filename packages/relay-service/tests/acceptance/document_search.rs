use std::sync::Arc;

use relay_domain::unit::UnitScope;
use relay_service::{Error, SearchRequest, VectorIndex};
use relay_testkit::{event, stubs::HashEmbedding};

use super::{MODEL, build, build_default, index_lexical, ingest, lexical_only};

#[tokio::test]
async fn lexical_only_search_returns_the_single_match() {
	let (backend, service) = build_default();

	ingest(
		&backend,
		&service,
		&[event("1", 100, "email", None, "hello world"), event("2", 200, "email", None, "goodbye")],
	)
	.await;

	let response = service.search_documents(lexical_only("hello")).await.expect("search");

	assert!(response.lexical_used);
	assert!(!response.embedding_used);
	assert_eq!(response.items.len(), 1);

	let item = &response.items[0];

	assert_eq!(item.event_id, "1");
	assert_eq!(item.score, 1.0);
	assert_eq!(item.breakdown.len(), 1);
	assert_eq!(item.breakdown.get("lexical"), Some(&1.0));
	assert_eq!(item.title, "email");
	assert_eq!(item.snippet, "hello world");
}

#[tokio::test]
async fn missing_vector_reports_zero_and_redistributes_weight() {
	let (backend, service) = build_default();

	ingest(
		&backend,
		&service,
		&[event("1", 100, "email", None, "hello world"), event("2", 200, "email", None, "hello there")],
	)
	.await;
	backend.remove(&["2".to_string()], None).await.expect("remove vector");

	let response = service.search_documents(SearchRequest::new("hello")).await.expect("search");

	assert!(response.lexical_used);
	assert!(response.embedding_used);

	let missing = response.items.iter().find(|item| item.event_id == "2").expect("item 2");

	assert_eq!(missing.breakdown.get("vector"), Some(&0.0));
	assert_eq!(missing.breakdown.get("lexical"), Some(&1.0));
	assert!((missing.score - 1.0).abs() < 1e-6);

	let present = response.items.iter().find(|item| item.event_id == "1").expect("item 1");
	let expected = (present.breakdown["lexical"] + present.breakdown["vector"]) / 2.0;

	assert!((present.score - expected).abs() < 1e-6);
}

#[tokio::test]
async fn precomputed_query_vector_ranks_by_cosine() {
	let (backend, service) = build_default();
	let scope = UnitScope::event("email", None);

	backend.insert_events([
		event("1", 100, "email", None, "north"),
		event("2", 200, "email", None, "east"),
		event("3", 300, "email", None, "south"),
	]);
	backend.upsert("1", MODEL, &scope, &[1.0, 0.0]).await.expect("upsert");
	backend.upsert("2", MODEL, &scope, &[0.0, 1.0]).await.expect("upsert");
	backend.upsert("3", MODEL, &scope, &[-1.0, 0.0]).await.expect("upsert");

	let request = SearchRequest {
		use_lexical: false,
		query_vector: Some(vec![1.0, 0.0]),
		..SearchRequest::new("")
	};
	let response = service.search_documents(request).await.expect("search");
	let scores: Vec<(&str, f32)> =
		response.items.iter().map(|item| (item.event_id.as_str(), item.score)).collect();

	assert!(!response.lexical_used);
	assert!(response.embedding_used);
	assert_eq!(scores.len(), 3);
	assert_eq!(scores[0].0, "1");
	assert!((scores[0].1 - 1.0).abs() < 1e-6);
	assert_eq!(scores[1].0, "2");
	assert!((scores[1].1 - 0.5).abs() < 1e-6);
	assert_eq!(scores[2].0, "3");
	assert!(scores[2].1.abs() < 1e-6);
}

#[tokio::test]
async fn equal_scores_break_ties_by_recency_then_id() {
	let (backend, service) = build_default();

	index_lexical(
		&backend,
		&[
			event("a", 10, "email", None, "alpha"),
			event("b", 20, "email", None, "alpha"),
			event("c", 20, "email", None, "alpha"),
		],
	)
	.await;

	let response = service.search_documents(lexical_only("alpha")).await.expect("search");
	let ids: Vec<&str> = response.items.iter().map(|item| item.event_id.as_str()).collect();

	assert_eq!(ids, vec!["b", "c", "a"]);
}

#[tokio::test]
async fn min_score_filters_before_the_limit() {
	let (backend, service) = build_default();

	index_lexical(
		&backend,
		&[
			event("1", 10, "email", None, "invoice overdue"),
			event("2", 20, "email", None, "invoice paid"),
		],
	)
	.await;

	let request = SearchRequest { min_score: 0.5, limit: 5, ..lexical_only("overdue invoice") };
	let response = service.search_documents(request).await.expect("search");
	let ids: Vec<&str> = response.items.iter().map(|item| item.event_id.as_str()).collect();

	assert_eq!(ids, vec!["1"]);
}

#[tokio::test]
async fn limits_fall_back_to_the_default_and_are_capped() {
	let (backend, service) = build_default();
	let events: Vec<_> = (0..60)
		.map(|i| event(&format!("e{i:02}"), i, "email", None, "status update"))
		.collect();

	index_lexical(&backend, &events).await;

	for (limit, expected) in [(0, 10), (-5, 10), (3, 3), (1_000, 50)] {
		let request = SearchRequest { limit, ..lexical_only("status") };
		let response = service.search_documents(request).await.expect("search");

		assert_eq!(response.items.len(), expected, "limit {limit}");
	}
}

#[tokio::test]
async fn channel_filter_restricts_candidates() {
	let (backend, service) = build_default();

	index_lexical(
		&backend,
		&[event("1", 10, "email", None, "deploy"), event("2", 20, "slack", None, "deploy")],
	)
	.await;

	let request = SearchRequest { channels: vec!["slack".to_string()], ..lexical_only("deploy") };
	let response = service.search_documents(request).await.expect("search");
	let ids: Vec<&str> = response.items.iter().map(|item| item.event_id.as_str()).collect();

	assert_eq!(ids, vec!["2"]);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
	let (_, service) = build_default();
	let both_off =
		SearchRequest { use_lexical: false, use_embeddings: false, ..SearchRequest::new("hello") };
	let vector_without_text = SearchRequest { use_lexical: false, ..SearchRequest::new("  ") };
	let bad_min_score = SearchRequest { min_score: 1.5, ..SearchRequest::new("hello") };

	for request in [both_off, vector_without_text, bad_min_score] {
		let err = service.search_documents(request).await.expect_err("must fail");

		assert!(matches!(err, Error::InvalidRequest { .. }), "{err:?}");
	}
}

#[tokio::test]
async fn stale_hits_are_skipped_and_pruned() {
	let (backend, service) = build_default();

	index_lexical(
		&backend,
		&[event("1", 10, "email", None, "hello world"), event("2", 20, "email", None, "hello there")],
	)
	.await;
	backend.delete_event_row("2");

	let response = service.search_documents(lexical_only("hello")).await.expect("search");
	let ids: Vec<&str> = response.items.iter().map(|item| item.event_id.as_str()).collect();

	assert_eq!(ids, vec!["1"]);
	assert!(
		super::eventually(|| !backend.lexical_unit_ids().contains(&"2".to_string())).await,
		"stale lexical entry was not pruned"
	);
}

#[tokio::test]
async fn stale_hits_do_not_skew_normalization() {
	let (backend, service) = build_default();

	index_lexical(
		&backend,
		&[
			event("1", 10, "email", None, "hello hello hello"),
			event("2", 20, "email", None, "hello world and more words here"),
		],
	)
	.await;
	backend.delete_event_row("1");

	let response = service
		.search_documents(SearchRequest { min_score: 0.5, ..lexical_only("hello") })
		.await
		.expect("search");
	let items: Vec<(&str, f32)> =
		response.items.iter().map(|item| (item.event_id.as_str(), item.score)).collect();

	assert_eq!(items, vec![("2", 1.0)]);
}

#[tokio::test]
async fn deleted_events_leave_their_episodes() {
	let (backend, service) = build_default();

	ingest(
		&backend,
		&service,
		&[
			event("1", 0, "email", Some("T1"), "hello team"),
			event("2", 30, "email", Some("T1"), "hello again"),
		],
	)
	.await;
	backend.delete_event_row("2");

	let response = service.search_documents(lexical_only("hello")).await.expect("search");
	let ids: Vec<&str> = response.items.iter().map(|item| item.event_id.as_str()).collect();

	assert_eq!(ids, vec!["1"]);
	assert!(
		super::eventually(|| {
			["thread", "gap_60"].iter().all(|definition| {
				let episodes = backend.episodes(definition);

				episodes.len() == 1 && episodes[0].event_ids().eq(["1"])
			})
		})
		.await,
		"deleted event is still an episode member"
	);

	let episodes = backend.episodes("thread");
	let summary = backend.lexical_content(&relay_service::episode_unit_id(episodes[0].episode_id));

	assert_eq!(episodes[0].end_ts, 0);
	assert_eq!(summary.as_deref(), Some("hello team"));
}

#[tokio::test]
async fn zero_weighted_signal_does_not_zero_the_other() {
	let mut cfg = relay_testkit::test_config();

	cfg.search.lexical_weight = 0.0;
	cfg.search.vector_weight = 1.0;

	let (backend, service) = build(cfg, Arc::new(HashEmbedding::new()));

	ingest(
		&backend,
		&service,
		&[event("1", 100, "email", None, "hello world"), event("2", 200, "email", None, "goodbye")],
	)
	.await;

	let response = service.search_documents(lexical_only("hello")).await.expect("search");
	let items: Vec<(&str, f32)> =
		response.items.iter().map(|item| (item.event_id.as_str(), item.score)).collect();

	assert_eq!(items, vec![("1", 1.0)]);
}

#[tokio::test]
async fn empty_query_with_lexical_enabled_matches_nothing() {
	let (backend, service) = build_default();

	index_lexical(&backend, &[event("1", 10, "email", None, "hello")]).await;

	let response = service.search_documents(lexical_only("")).await.expect("search");

	assert!(response.items.is_empty());
	assert!(response.lexical_used);
}
