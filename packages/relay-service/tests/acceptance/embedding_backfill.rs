use std::sync::Arc;

use relay_service::{EpisodeSearchRequest, RelayService, SearchRequest};
use relay_testkit::{
	event,
	stubs::{FailingEmbedding, HashEmbedding},
};

use super::{MODEL, build, ingest};

#[tokio::test]
async fn units_without_vectors_are_backfilled() {
	let (backend, offline) = build(relay_testkit::test_config(), Arc::new(FailingEmbedding));

	ingest(
		&backend,
		&offline,
		&[
			event("1", 0, "email", Some("T1"), "budget review"),
			event("2", 10, "email", Some("T1"), "budget approved"),
		],
	)
	.await;

	assert!(backend.vector_unit_ids(MODEL).is_empty());
	assert!(offline.embed_missing(None, 10).await.is_err());

	let online = RelayService::with_providers(
		relay_testkit::test_config(),
		offline.backends.clone(),
		relay_service::Providers::new(Arc::new(HashEmbedding::new())),
	)
	.expect("service");
	let lexical_units = backend.lexical_unit_ids().len();
	let written = online.embed_missing(None, 100).await.expect("backfill");

	assert_eq!(written, lexical_units);
	assert_eq!(backend.vector_unit_ids(MODEL).len(), lexical_units);
	assert_eq!(online.embed_missing(None, 100).await.expect("backfill"), 0);

	let response = online
		.search_episodes(EpisodeSearchRequest::new("thread", SearchRequest::new("budget")))
		.await
		.expect("search");

	assert!(response.embedding_used);
	assert_eq!(response.items.len(), 1);
	assert!(response.items[0].breakdown.contains_key("vector"));
	assert!(response.items[0].breakdown.contains_key("lexical"));
}

#[tokio::test]
async fn backfill_respects_the_batch_size() {
	let (backend, service) = build(relay_testkit::test_config(), Arc::new(HashEmbedding::new()));

	ingest(
		&backend,
		&service,
		&[event("1", 0, "email", None, "one"), event("2", 500, "email", None, "two")],
	)
	.await;

	let pending = backend.lexical_unit_ids().len() - backend.vector_unit_ids(MODEL).len();

	assert!(pending > 1);
	assert_eq!(service.embed_missing(None, 1).await.expect("backfill"), 1);
	assert_eq!(
		backend.lexical_unit_ids().len() - backend.vector_unit_ids(MODEL).len(),
		pending - 1
	);
}

#[tokio::test]
async fn changed_episode_text_drops_its_vector() {
	let (backend, service) = build(relay_testkit::test_config(), Arc::new(HashEmbedding::new()));

	ingest(&backend, &service, &[event("1", 0, "email", Some("T1"), "budget review")]).await;
	service.embed_missing(None, 100).await.expect("backfill");

	let thread_episodes = backend.episodes("thread");
	let unit_id = relay_service::episode_unit_id(thread_episodes[0].episode_id);

	assert!(backend.vector_unit_ids(MODEL).contains(&unit_id));

	ingest(&backend, &service, &[event("2", 10, "email", Some("T1"), "budget approved")]).await;

	assert!(!backend.vector_unit_ids(MODEL).contains(&unit_id));
	assert_eq!(
		backend.lexical_content(&unit_id).as_deref(),
		Some("budget review budget approved")
	);
}

#[tokio::test]
async fn edited_event_gets_a_fresh_vector() {
	let embedding = Arc::new(HashEmbedding::new());
	let (backend, service) = build(relay_testkit::test_config(), embedding.clone());

	ingest(&backend, &service, &[event("1", 0, "email", None, "hello")]).await;

	let calls = embedding.calls();

	ingest(&backend, &service, &[event("1", 0, "email", None, "hello world")]).await;

	assert_eq!(embedding.calls(), calls + 1);
	assert!(backend.vector_unit_ids(MODEL).contains(&"1".to_string()));
}
