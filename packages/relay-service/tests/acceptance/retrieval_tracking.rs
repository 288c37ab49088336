use std::time::Duration;

use relay_domain::unit::UnitKind;
use relay_service::{EpisodeSearchRequest, SearchRequest};
use relay_testkit::event;

use super::{build, build_default, eventually, ingest, lexical_only};

fn tracked(query: &str) -> SearchRequest {
	SearchRequest { track_retrieval: true, ..lexical_only(query) }
}

#[tokio::test]
async fn surfaced_documents_are_recorded() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &[event("1", 0, "email", None, "hello world")]).await;
	service.search_documents(tracked("hello")).await.expect("search");

	assert!(eventually(|| backend.records().len() == 1).await);

	let records = backend.records();
	let record = &records[0];

	assert_eq!(record.query, "hello");
	assert_eq!(record.kind, UnitKind::Event);
	assert_eq!(record.unit_ids, vec!["1".to_string()]);
	assert_eq!(record.model, None);
}

#[tokio::test]
async fn surfaced_episodes_are_recorded_with_the_model() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &[event("1", 0, "email", Some("T1"), "hello world")]).await;
	service.embed_missing(None, 100).await.expect("backfill");

	let request = EpisodeSearchRequest::new(
		"thread",
		SearchRequest { track_retrieval: true, ..SearchRequest::new("hello") },
	);
	let response = service.search_episodes(request).await.expect("search");

	assert!(eventually(|| backend.records().len() == 1).await);

	let records = backend.records();

	assert_eq!(records[0].kind, UnitKind::Episode);
	assert_eq!(records[0].model.as_deref(), Some(super::MODEL));
	assert_eq!(
		records[0].unit_ids,
		response.items.iter().map(|item| item.unit_id.clone()).collect::<Vec<_>>()
	);
}

#[tokio::test]
async fn tracking_requires_both_the_request_flag_and_the_config_switch() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &[event("1", 0, "email", None, "hello world")]).await;
	service.search_documents(lexical_only("hello")).await.expect("search");

	let mut cfg = relay_testkit::test_config();

	cfg.tracking.enabled = false;

	let (disabled_backend, disabled) =
		build(cfg, std::sync::Arc::new(relay_testkit::stubs::HashEmbedding::new()));

	ingest(&disabled_backend, &disabled, &[event("1", 0, "email", None, "hello world")]).await;
	disabled.search_documents(tracked("hello")).await.expect("search");
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert!(backend.records().is_empty());
	assert!(disabled_backend.records().is_empty());
}

#[tokio::test]
async fn tracking_failure_never_fails_the_search() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &[event("1", 0, "email", None, "hello world")]).await;
	backend.set_fail_tracking(true);

	let response = service.search_documents(tracked("hello")).await.expect("search");

	tokio::time::sleep(Duration::from_millis(50)).await;

	assert_eq!(response.items.len(), 1);
	assert!(backend.records().is_empty());
}
