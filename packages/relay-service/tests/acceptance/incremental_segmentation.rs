use std::{collections::BTreeMap, sync::Arc};

use relay_domain::{
	event::Event,
	segmentation::{self, Episode},
};
use relay_service::{IngestAction, RelayService};
use relay_testkit::{MemoryBackend, event};

use super::{build, build_default, ingest};

fn by_id(mut episodes: Vec<Episode>) -> Vec<Episode> {
	episodes.sort_by_key(|episode| episode.episode_id);

	episodes
}

fn assert_matches_full_segmentation(backend: &MemoryBackend, service: &RelayService, events: &[Event]) {
	for definition in service.definitions() {
		let expected = by_id(segmentation::segment(definition, events));
		let stored = by_id(backend.episodes(&definition.name));

		assert_eq!(stored, expected, "definition {}", definition.name);

		let mut members: Vec<&str> =
			stored.iter().flat_map(|episode| episode.event_ids()).collect();
		let mut ids: Vec<&str> = events.iter().map(|event| event.event_id.as_str()).collect();

		members.sort_unstable();
		ids.sort_unstable();

		assert_eq!(members, ids, "every event belongs to exactly one episode");
	}
}

fn current(events: &BTreeMap<String, Event>) -> Vec<Event> {
	events.values().cloned().collect()
}

#[tokio::test]
async fn out_of_order_arrivals_match_full_segmentation() {
	let (backend, service) = build_default();
	let arrivals = vec![
		event("e3", 500, "email", Some("T1"), "final numbers"),
		event("e1", 0, "email", Some("T1"), "kickoff"),
		event("e4", 10, "email", None, "newsletter"),
		event("e2", 30, "email", Some("T1"), "draft numbers"),
		event("e6", 45, "slack", Some("T9"), "standup"),
		event("e5", 40, "email", None, "receipt"),
		event("e7", 20, "email", Some("T1"), "agenda"),
	];
	let mut state = BTreeMap::new();

	for event in &arrivals {
		ingest(&backend, &service, std::slice::from_ref(event)).await;
		state.insert(event.event_id.clone(), event.clone());

		assert_matches_full_segmentation(&backend, &service, &current(&state));
	}

	// A moved timestamp closes the gap between the two T1 episodes.
	let moved = event("e3", 60, "email", Some("T1"), "final numbers");

	ingest(&backend, &service, std::slice::from_ref(&moved)).await;
	state.insert(moved.event_id.clone(), moved);
	assert_matches_full_segmentation(&backend, &service, &current(&state));

	// An event that joins another thread leaves its previous episode.
	let rethreaded = event("e5", 40, "email", Some("T1"), "receipt");

	ingest(&backend, &service, std::slice::from_ref(&rethreaded)).await;
	state.insert(rethreaded.event_id.clone(), rethreaded);
	assert_matches_full_segmentation(&backend, &service, &current(&state));
}

#[tokio::test]
async fn ingest_reports_the_action_per_definition() {
	let (backend, service) = build_default();
	let first = event("1", 0, "email", Some("T1"), "hello");

	backend.insert_event(first.clone());

	let outcomes = service.ingest_event(&first).await.expect("ingest");
	let actions: Vec<(&str, IngestAction)> = outcomes
		.iter()
		.map(|outcome| (outcome.definition_name.as_str(), outcome.action))
		.collect();

	assert_eq!(actions, vec![("gap_60", IngestAction::Opened), ("thread", IngestAction::Opened)]);

	let later = event("2", 600, "email", Some("T1"), "again");

	backend.insert_event(later.clone());

	let outcomes = service.ingest_event(&later).await.expect("ingest");
	let actions: Vec<IngestAction> = outcomes.iter().map(|outcome| outcome.action).collect();

	assert_eq!(actions, vec![IngestAction::Opened, IngestAction::Extended]);

	let edited = event("2", 600, "email", Some("T1"), "again, edited");

	backend.insert_event(edited.clone());

	let outcomes = service.ingest_event(&edited).await.expect("ingest");
	let actions: Vec<IngestAction> = outcomes.iter().map(|outcome| outcome.action).collect();

	assert_eq!(actions, vec![IngestAction::Refreshed, IngestAction::Refreshed]);

	let thread_episodes = backend.episodes("thread");
	let summary =
		backend.lexical_content(&relay_service::episode_unit_id(thread_episodes[0].episode_id));

	assert_eq!(summary.as_deref(), Some("hello again, edited"));
}

#[tokio::test]
async fn scoped_definitions_skip_other_channels() {
	let mut cfg = relay_testkit::test_config();

	cfg.segmentation.definitions[0].channels = vec!["slack".to_string()];

	let (backend, service) = build(cfg, std::sync::Arc::new(relay_testkit::stubs::HashEmbedding::new()));
	let email = event("1", 0, "email", None, "hello");

	backend.insert_event(email.clone());

	let outcomes = service.ingest_event(&email).await.expect("ingest");
	let skipped = outcomes
		.iter()
		.find(|outcome| outcome.definition_name == "thread")
		.map(|outcome| outcome.action);

	assert_eq!(skipped, Some(IngestAction::Skipped));
	assert!(backend.episodes("thread").is_empty());
}

#[tokio::test]
async fn removing_an_event_resegments_its_key() {
	let (backend, service) = build_default();

	ingest(
		&backend,
		&service,
		&[
			event("1", 0, "email", Some("T1"), "one"),
			event("2", 50, "email", Some("T1"), "two"),
			event("3", 100, "email", Some("T1"), "three"),
		],
	)
	.await;

	assert_eq!(backend.episodes("gap_60").len(), 1);

	backend.delete_event_row("2");
	service.remove_event("2").await.expect("remove");

	let members: Vec<Vec<String>> = backend
		.episodes("gap_60")
		.iter()
		.map(|episode| episode.event_ids().map(str::to_string).collect())
		.collect();

	assert_eq!(members, vec![vec!["1".to_string()], vec!["3".to_string()]]);
	assert!(!backend.lexical_unit_ids().contains(&"2".to_string()));
}

#[tokio::test]
async fn changed_definitions_are_rescanned_once() {
	let (backend, service) = build_default();

	backend.insert_events([
		event("1", 0, "email", None, "one"),
		event("2", 90, "email", None, "two"),
	]);

	let rescanned = service.ensure_definitions_current().await.expect("ensure");

	assert_eq!(rescanned, vec!["gap_60".to_string(), "thread".to_string()]);
	assert_eq!(backend.episodes("gap_60").len(), 2);
	assert!(service.ensure_definitions_current().await.expect("ensure").is_empty());

	let mut cfg = relay_testkit::test_config();

	cfg.segmentation.definitions[1].max_gap_seconds = Some(120);

	let widened = RelayService::with_providers(
		cfg,
		service.backends.clone(),
		service.providers.clone(),
	)
	.expect("service");
	let rescanned = widened.ensure_definitions_current().await.expect("ensure");

	assert_eq!(rescanned, vec!["gap_60".to_string()]);
	assert_eq!(backend.episodes("gap_60").len(), 1);
}

fn spread_event(i: usize, thread_id: Option<&str>) -> Event {
	let channel = if i % 3 == 0 { "slack" } else { "email" };

	event(&format!("e{i:02}"), (i * 37 % 400) as i64, channel, thread_id, &format!("note {i}"))
}

fn spread_thread(i: usize) -> Option<String> {
	(i % 4 != 0).then(|| format!("T{}", i % 5))
}

async fn ingest_concurrently(backend: &Arc<MemoryBackend>, service: &RelayService, events: Vec<Event>) {
	let mut tasks = Vec::with_capacity(events.len());

	for event in events {
		let backend = backend.clone();
		let service = service.clone();

		tasks.push(tokio::spawn(async move {
			backend.insert_event(event.clone());
			service.ingest_event(&event).await.expect("Failed to ingest event.");
		}));
	}

	for task in tasks {
		task.await.expect("ingest task panicked");
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingest_matches_full_segmentation() {
	let (backend, service) = build_default();
	let mut state = BTreeMap::new();
	let first: Vec<Event> =
		(0..40).map(|i| spread_event(i, spread_thread(i).as_deref())).collect();

	for event in &first {
		state.insert(event.event_id.clone(), event.clone());
	}

	ingest_concurrently(&backend, &service, first).await;
	assert_matches_full_segmentation(&backend, &service, &current(&state));

	let mut second: Vec<Event> =
		(40..60).map(|i| spread_event(i, spread_thread(i).as_deref())).collect();

	// Moves already-ingested events to another key while new events arrive.
	for i in (1..40).filter(|i| i % 4 != 0).take(10) {
		let thread_id = if i % 2 == 0 { None } else { Some("T7") };

		second.push(spread_event(i, thread_id));
	}
	for event in &second {
		state.insert(event.event_id.clone(), event.clone());
	}

	ingest_concurrently(&backend, &service, second).await;
	assert_matches_full_segmentation(&backend, &service, &current(&state));
}
