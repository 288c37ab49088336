use std::{sync::Arc, time::Duration};

use relay_service::{Error, SearchRequest};
use relay_testkit::{
	event,
	stubs::{FailingEmbedding, HashEmbedding, SlowEmbedding},
};

use super::{build, build_default, index_lexical, ingest};

fn corpus() -> Vec<relay_domain::event::Event> {
	vec![event("1", 100, "email", None, "hello world"), event("2", 200, "email", None, "goodbye")]
}

#[tokio::test]
async fn embedding_failure_falls_back_to_lexical() {
	let (backend, service) =
		build(relay_testkit::test_config(), Arc::new(FailingEmbedding));

	index_lexical(&backend, &corpus()).await;

	let response = service.search_documents(SearchRequest::new("hello")).await.expect("search");

	assert!(response.lexical_used);
	assert!(!response.embedding_used);
	assert_eq!(response.items.len(), 1);
	assert_eq!(response.items[0].event_id, "1");
	assert!(!response.items[0].breakdown.contains_key("vector"));
}

#[tokio::test]
async fn embedding_failure_without_lexical_is_a_dependency_error() {
	let (backend, service) =
		build(relay_testkit::test_config(), Arc::new(FailingEmbedding));

	index_lexical(&backend, &corpus()).await;

	let request = SearchRequest { use_lexical: false, ..SearchRequest::new("hello") };
	let err = service.search_documents(request).await.expect_err("must fail");

	assert!(matches!(err, Error::Dependency { .. }), "{err:?}");
}

#[tokio::test]
async fn vector_lookup_failure_degrades_to_lexical() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &corpus()).await;
	backend.set_fail_vectors(true);

	let response = service.search_documents(SearchRequest::new("hello")).await.expect("search");

	assert!(response.lexical_used);
	assert!(!response.embedding_used);
	assert_eq!(response.items[0].event_id, "1");
}

#[tokio::test]
async fn lexical_lookup_failure_degrades_to_vectors() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &corpus()).await;
	backend.set_fail_lexical(true);

	let response = service.search_documents(SearchRequest::new("hello")).await.expect("search");

	assert!(!response.lexical_used);
	assert!(response.embedding_used);
	assert!(response.items.iter().all(|item| !item.breakdown.contains_key("lexical")));
	assert_eq!(response.items[0].event_id, "1");
}

#[tokio::test]
async fn both_lookups_failing_is_an_index_error() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &corpus()).await;
	backend.set_fail_lexical(true);
	backend.set_fail_vectors(true);

	let err = service.search_documents(SearchRequest::new("hello")).await.expect_err("must fail");

	assert!(matches!(err, Error::Index { .. }), "{err:?}");
}

#[tokio::test]
async fn search_deadline_is_reported_as_timeout() {
	let (backend, service) = build(
		relay_testkit::test_config(),
		Arc::new(SlowEmbedding { delay: Duration::from_millis(500) }),
	);

	index_lexical(&backend, &corpus()).await;

	let request = SearchRequest { timeout_ms: Some(50), ..SearchRequest::new("hello") };
	let err = service.search_documents(request).await.expect_err("must time out");

	match err {
		Error::Timeout { elapsed_ms } => assert!(elapsed_ms >= 50, "{elapsed_ms}"),
		other => panic!("Expected a timeout, got {other:?}."),
	}
}

#[tokio::test]
async fn slow_provider_within_the_deadline_degrades_instead_of_failing() {
	let mut cfg = relay_testkit::test_config();

	cfg.providers.embedding.timeout_ms = 20;

	let (backend, service) =
		build(cfg, Arc::new(SlowEmbedding { delay: Duration::from_millis(500) }));

	index_lexical(&backend, &corpus()).await;

	let response = service.search_documents(SearchRequest::new("hello")).await.expect("search");

	assert!(response.lexical_used);
	assert!(!response.embedding_used);
	assert_eq!(response.items.len(), 1);
}

#[tokio::test]
async fn query_vector_skips_the_provider() {
	let embedding = Arc::new(HashEmbedding::new());
	let (backend, service) = build(relay_testkit::test_config(), embedding.clone());

	index_lexical(&backend, &corpus()).await;

	let request = SearchRequest {
		query_vector: Some(HashEmbedding::vector("hello", 16)),
		..SearchRequest::new("hello")
	};
	let response = service.search_documents(request).await.expect("search");

	assert!(response.embedding_used);
	assert_eq!(embedding.calls(), 0);
}
