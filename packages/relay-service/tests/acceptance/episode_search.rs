use relay_domain::{event::Event, segmentation::SegmentScope};
use relay_service::{EpisodeSearchRequest, Error, SearchRequest};
use relay_testkit::event;

use super::{build_default, ingest, lexical_only};

fn titled(event: Event, title: &str) -> Event {
	Event { title: Some(title.to_string()), ..event }
}

fn budget_thread() -> Vec<Event> {
	vec![
		titled(event("A", 0, "email", Some("T1"), "budget review"), "Q3 budget"),
		event("B", 30, "email", Some("T1"), "budget numbers attached"),
		event("C", 500, "email", Some("T1"), "lunch plans"),
	]
}

#[tokio::test]
async fn time_gap_splits_a_thread_into_two_episodes() {
	let (backend, service) = build_default();

	backend.insert_events(budget_thread());

	let episodes = service.segment("gap_60", &SegmentScope::all()).await.expect("segment");
	let members: Vec<Vec<&str>> =
		episodes.iter().map(|episode| episode.event_ids().collect()).collect();

	assert_eq!(members, vec![vec!["A", "B"], vec!["C"]]);
	assert_eq!((episodes[0].start_ts, episodes[0].end_ts), (0, 30));

	let episodes = service.segment("thread", &SegmentScope::all()).await.expect("segment");

	assert_eq!(episodes.len(), 1);
	assert_eq!(episodes[0].event_count(), 3);
}

#[tokio::test]
async fn segmentation_is_deterministic() {
	let (backend, service) = build_default();

	backend.insert_events(budget_thread());

	let first = service.segment("gap_60", &SegmentScope::all()).await.expect("segment");
	let second = service.segment("gap_60", &SegmentScope::all()).await.expect("segment");

	assert_eq!(first, second);
	assert_eq!(backend.episodes("gap_60"), first);
}

#[tokio::test]
async fn episode_search_returns_the_matching_episode() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &budget_thread()).await;

	let request = EpisodeSearchRequest::new("gap_60", lexical_only("budget"));
	let response = service.search_episodes(request).await.expect("search");

	assert_eq!(response.definition, "gap_60");
	assert_eq!(response.items.len(), 1);

	let item = &response.items[0];

	assert_eq!(item.event_count, 2);
	assert_eq!((item.start_ts, item.end_ts), (0, 30));
	assert_eq!(item.thread_id.as_deref(), Some("T1"));
	assert_eq!(item.thread_name.as_deref(), Some("Q3 budget"));
	assert_eq!(item.definition_name, "gap_60");
	assert_eq!(item.unit_id, relay_service::episode_unit_id(item.episode_id));
	assert_eq!(item.score, 1.0);
}

#[tokio::test]
async fn thread_filter_narrows_episode_candidates() {
	let (backend, service) = build_default();

	ingest(
		&backend,
		&service,
		&[
			event("1", 0, "email", Some("T1"), "budget"),
			event("2", 10, "email", Some("T2"), "budget"),
		],
	)
	.await;

	let request = EpisodeSearchRequest {
		thread_id: Some("T2".to_string()),
		..EpisodeSearchRequest::new("thread", lexical_only("budget"))
	};
	let response = service.search_episodes(request).await.expect("search");
	let threads: Vec<Option<&str>> =
		response.items.iter().map(|item| item.thread_id.as_deref()).collect();

	assert_eq!(threads, vec![Some("T2")]);
}

#[tokio::test]
async fn refresh_segments_before_retrieving() {
	let (backend, service) = build_default();

	backend.insert_events(budget_thread());

	let stale = service
		.search_episodes(EpisodeSearchRequest::new("gap_60", lexical_only("budget")))
		.await
		.expect("search");

	assert!(stale.items.is_empty());

	let request = EpisodeSearchRequest {
		refresh: true,
		..EpisodeSearchRequest::new("gap_60", lexical_only("budget"))
	};
	let refreshed = service.search_episodes(request).await.expect("search");

	assert_eq!(refreshed.items.len(), 1);
	assert_eq!(refreshed.items[0].event_count, 2);
}

#[tokio::test]
async fn unknown_definition_is_rejected() {
	let (_, service) = build_default();
	let err = service
		.search_episodes(EpisodeSearchRequest::new("nope", SearchRequest::new("budget")))
		.await
		.expect_err("must fail");

	assert!(matches!(err, Error::UnknownDefinition { ref name } if name == "nope"), "{err:?}");

	let err = service.segment("nope", &SegmentScope::all()).await.expect_err("must fail");

	assert!(matches!(err, Error::UnknownDefinition { .. }), "{err:?}");
}

#[tokio::test]
async fn episode_search_ignores_other_definitions_and_documents() {
	let (backend, service) = build_default();

	ingest(&backend, &service, &budget_thread()).await;

	let response = service
		.search_episodes(EpisodeSearchRequest::new("thread", lexical_only("budget")))
		.await
		.expect("search");

	assert_eq!(response.items.len(), 1);
	assert!(response.items.iter().all(|item| item.definition_name == "thread"));
	assert_eq!(response.items[0].event_count, 3);
}
