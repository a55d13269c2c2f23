use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use multiplayer_sessions::{
    Completion, FindSessionsComplete, JoinSessionResult, OperationKind, SessionConfig,
    SessionCoordinator, SessionSearchResult, UserId,
};
use session_loopback::{
    BackendRequest, CallbackPump, DeliveryMode, LoopbackNetwork, LoopbackSessionBackend,
};
use strum::IntoEnumIterator;
use test_log::test;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Create(bool),
    Find(usize, bool),
    Join(JoinSessionResult),
    Destroy(bool),
}

struct Player {
    backend: Arc<LoopbackSessionBackend>,
    coordinator: Arc<SessionCoordinator>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Player {
    fn new(network: &LoopbackNetwork, name: &str, port: u16, mode: DeliveryMode) -> Self {
        Self::with_config(network, name, port, mode, SessionConfig::default())
    }

    fn with_config(
        network: &LoopbackNetwork,
        name: &str,
        port: u16,
        mode: DeliveryMode,
        config: SessionConfig,
    ) -> Self {
        let backend = Arc::new(LoopbackSessionBackend::new(
            network.clone(),
            UserId::new(name),
            format!("127.0.0.1:{port}"),
            mode,
        ));
        let coordinator =
            SessionCoordinator::with_backend(UserId::new(name), config, backend.clone());
        let seen = observe(&coordinator);
        Self {
            backend,
            coordinator,
            seen,
        }
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn first_result(&self) -> SessionSearchResult {
        self.coordinator
            .last_search_results()
            .into_iter()
            .next()
            .expect("search returned no sessions")
    }
}

fn observe(coordinator: &SessionCoordinator) -> Arc<Mutex<Vec<Seen>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let events = coordinator.events();
    let log = Arc::clone(&seen);
    events
        .on_create_complete
        .add(move |ok: &bool| log.lock().unwrap().push(Seen::Create(*ok)));
    let log = Arc::clone(&seen);
    events.on_find_complete.add(move |found: &FindSessionsComplete| {
        log.lock()
            .unwrap()
            .push(Seen::Find(found.results.len(), found.successful))
    });
    let log = Arc::clone(&seen);
    events
        .on_join_complete
        .add(move |result: &JoinSessionResult| log.lock().unwrap().push(Seen::Join(*result)));
    let log = Arc::clone(&seen);
    events
        .on_destroy_complete
        .add(move |ok: &bool| log.lock().unwrap().push(Seen::Destroy(*ok)));
    seen
}

fn assert_delegates_balanced(backend: &LoopbackSessionBackend) {
    for kind in OperationKind::iter() {
        assert_eq!(
            backend.subscribe_count(kind),
            backend.unsubscribe_count(kind),
            "unbalanced {kind} delegates"
        );
        assert_eq!(backend.stale_unsubscribe_count(kind), 0, "stale {kind} clear");
        assert_eq!(backend.active_delegates(kind), 0, "leaked {kind} delegate");
    }
}

#[test]
fn create_without_existing_session_completes_once() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Immediate);

    host.coordinator.create_session(4, "FreeForAll");

    assert_eq!(host.seen(), vec![Seen::Create(true)]);
    assert_eq!(host.backend.subscribe_count(OperationKind::Create), 1);
    assert_eq!(host.backend.unsubscribe_count(OperationKind::Create), 1);
    assert_eq!(host.backend.active_delegates(OperationKind::Create), 0);
    assert!(host.coordinator.pending_kinds().is_empty());

    let session = host.coordinator.existing_session().unwrap();
    assert!(session.hosting);
    assert_eq!(session.settings.match_type(), Some("FreeForAll"));
    assert!(session.settings.is_lan_match);
    assert_eq!(network.advertised_count(), 1);
}

#[test]
fn replacing_session_destroys_before_create() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Queued);

    host.coordinator.create_session(4, "FreeForAll");
    host.backend.pump();
    assert_eq!(host.seen(), vec![Seen::Create(true)]);

    host.coordinator.create_session(8, "CaptureTheFlag");
    assert_eq!(
        host.backend.request_kinds(),
        vec![OperationKind::Create, OperationKind::Destroy]
    );
    assert!(host.coordinator.has_deferred_create());

    // Destroy completion issues the stashed create.
    assert_eq!(host.backend.pump(), 1);
    assert_eq!(
        host.backend.request_kinds(),
        vec![
            OperationKind::Create,
            OperationKind::Destroy,
            OperationKind::Create
        ]
    );
    assert!(!host.coordinator.has_deferred_create());
    assert_eq!(host.seen(), vec![Seen::Create(true), Seen::Destroy(true)]);

    host.backend.pump();
    assert_eq!(
        host.seen(),
        vec![Seen::Create(true), Seen::Destroy(true), Seen::Create(true)]
    );

    let session = host.coordinator.existing_session().unwrap();
    assert_eq!(session.settings.num_public_connections, 8);
    assert_eq!(session.settings.match_type(), Some("CaptureTheFlag"));
    assert_eq!(network.advertised_count(), 1);
    assert_delegates_balanced(&host.backend);
}

#[test]
fn latest_create_wins_while_destroy_is_pending() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Queued);
    host.coordinator.create_session(4, "FreeForAll");
    host.backend.pump();

    host.coordinator.create_session(8, "Duel");
    host.coordinator.create_session(2, "CaptureTheFlag");
    let destroys = host
        .backend
        .requests()
        .iter()
        .filter(|request| matches!(request, BackendRequest::Destroy { .. }))
        .count();
    assert_eq!(destroys, 1);

    host.backend.pump();
    host.backend.pump();

    let created: Vec<_> = host
        .backend
        .requests()
        .into_iter()
        .filter_map(|request| match request {
            BackendRequest::Create { settings, .. } => Some(settings),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 2);
    assert_eq!(created[1].num_public_connections, 2);
    assert_eq!(created[1].match_type(), Some("CaptureTheFlag"));
    assert_eq!(
        host.coordinator.last_session_settings().as_ref(),
        Some(&created[1])
    );
}

#[test]
fn failed_destroy_drops_the_replacement() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Immediate);
    host.coordinator.create_session(4, "FreeForAll");

    host.backend.script_next(Completion::Destroy {
        session_name: host.coordinator.config().session_name.clone(),
        successful: false,
    });
    host.coordinator.create_session(8, "Duel");

    assert_eq!(
        host.seen(),
        vec![Seen::Create(true), Seen::Destroy(false), Seen::Create(false)]
    );
    assert!(!host.coordinator.has_deferred_create());
    assert_eq!(
        host.backend.request_kinds(),
        vec![OperationKind::Create, OperationKind::Destroy]
    );
}

#[test]
fn rejected_destroy_fails_the_replacement() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Queued);
    host.coordinator.create_session(4, "FreeForAll");
    host.backend.pump();

    host.backend.reject_next(OperationKind::Destroy);
    host.coordinator.create_session(8, "Duel");

    assert_eq!(
        host.seen(),
        vec![Seen::Create(true), Seen::Destroy(false), Seen::Create(false)]
    );
    assert_eq!(host.backend.pending_completions(), 0);
    assert_eq!(network.advertised_count(), 1);
    assert_delegates_balanced(&host.backend);
}

#[test]
fn dropping_the_coordinator_clears_in_flight_delegates() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Queued);
    host.coordinator.create_session(4, "FreeForAll");
    host.coordinator.find_sessions(10);
    assert_eq!(host.backend.active_delegates(OperationKind::Create), 1);

    let Player {
        backend, coordinator, ..
    } = host;
    drop(coordinator);
    assert_eq!(backend.pump(), 2);

    assert_eq!(backend.subscribe_count(OperationKind::Create), 1);
    assert_eq!(backend.subscribe_count(OperationKind::Find), 1);
    assert_delegates_balanced(&backend);
}

#[test]
fn empty_search_is_reported_as_failure() {
    let network = LoopbackNetwork::new();
    let guest = Player::new(&network, "guest", 7778, DeliveryMode::Immediate);

    guest.coordinator.find_sessions(10);
    assert_eq!(guest.seen(), vec![Seen::Find(0, false)]);

    guest.backend.script_next(Completion::Find {
        successful: true,
        results: Vec::new(),
    });
    guest.coordinator.find_sessions(10);
    assert_eq!(guest.seen(), vec![Seen::Find(0, false), Seen::Find(0, false)]);
    assert_delegates_balanced(&guest.backend);
}

#[test]
fn search_uses_presence_on_the_lan() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Immediate);
    let guest = Player::new(&network, "guest", 7778, DeliveryMode::Immediate);
    host.coordinator.create_session(4, "FreeForAll");

    guest.coordinator.find_sessions(25);

    let search = guest.coordinator.last_search().unwrap();
    assert_eq!(search.max_results, 25);
    assert!(search.is_lan_query);
    assert!(search.presence_only);
    assert_eq!(guest.seen(), vec![Seen::Find(1, true)]);

    let result = guest.first_result();
    assert_eq!(result.owning_user, UserId::new("host"));
    assert_eq!(result.open_public_connections, 3);
    assert_eq!(result.match_type(), Some("FreeForAll"));
}

#[test]
fn join_result_is_passed_through() {
    let network = LoopbackNetwork::new();
    let guest = Player::new(&network, "guest", 7778, DeliveryMode::Immediate);
    let result = SessionSearchResult {
        session_id: "remote".into(),
        owning_user_name: "host".into(),
        owning_user: UserId::new("host"),
        open_public_connections: 1,
        max_public_connections: 4,
        ping_ms: Some(20),
        settings: Default::default(),
    };

    let mut expected = Vec::new();
    for code in JoinSessionResult::iter() {
        guest.backend.script_next(Completion::Join {
            session_name: guest.coordinator.config().session_name.clone(),
            result: code,
        });
        guest.coordinator.join_session(&result);
        expected.push(Seen::Join(code));
    }

    assert_eq!(guest.seen(), expected);
    assert_delegates_balanced(&guest.backend);
}

#[test]
fn simulated_joins_follow_session_rules() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Immediate);
    let first = Player::new(&network, "first", 7778, DeliveryMode::Immediate);
    let second = Player::new(&network, "second", 7779, DeliveryMode::Immediate);
    host.coordinator.create_session(2, "Duel");

    first.coordinator.find_sessions(10);
    let result = first.first_result();
    first.coordinator.join_session(&result);
    assert_eq!(
        first.seen(),
        vec![Seen::Find(1, true), Seen::Join(JoinSessionResult::Success)]
    );
    assert_eq!(first.coordinator.connect_string().as_deref(), Some("127.0.0.1:7777"));
    assert!(!first.coordinator.existing_session().unwrap().hosting);

    first.coordinator.join_session(&result);
    assert_eq!(
        first.seen().last(),
        Some(&Seen::Join(JoinSessionResult::AlreadyInSession))
    );

    second.coordinator.join_session(&result);
    assert_eq!(
        second.seen(),
        vec![Seen::Join(JoinSessionResult::SessionIsFull)]
    );

    host.coordinator.destroy_session();
    assert_eq!(network.advertised_count(), 0);
    second.coordinator.join_session(&result);
    assert_eq!(
        second.seen().last(),
        Some(&Seen::Join(JoinSessionResult::SessionDoesNotExist))
    );
    assert_eq!(second.coordinator.connect_string(), None);
}

#[test]
fn every_delegate_is_cleared_exactly_once() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Immediate);
    let guest = Player::new(&network, "guest", 7778, DeliveryMode::Immediate);

    host.coordinator.create_session(4, "FreeForAll");
    host.coordinator.create_session(4, "FreeForAll");
    host.backend.reject_next(OperationKind::Destroy);
    host.coordinator.destroy_session();

    guest.coordinator.find_sessions(10);
    guest.backend.reject_next(OperationKind::Join);
    let result = guest.first_result();
    guest.coordinator.join_session(&result);
    guest.coordinator.join_session(&result);
    guest.coordinator.destroy_session();
    host.coordinator.destroy_session();

    assert_eq!(host.backend.subscribe_count(OperationKind::Create), 2);
    assert_eq!(host.backend.subscribe_count(OperationKind::Destroy), 3);
    assert_eq!(guest.backend.subscribe_count(OperationKind::Join), 2);
    assert_eq!(host.backend.subscribe_count(OperationKind::Start), 0);
    assert_delegates_balanced(&host.backend);
    assert_delegates_balanced(&guest.backend);
    assert_eq!(
        guest.seen(),
        vec![
            Seen::Find(1, true),
            Seen::Join(JoinSessionResult::UnknownError),
            Seen::Join(JoinSessionResult::Success),
            Seen::Destroy(true),
        ]
    );
}

#[test]
fn unavailable_backend_fails_without_backend_calls() {
    let network = LoopbackNetwork::new();
    let guest = Player::new(&network, "guest", 7778, DeliveryMode::Immediate);
    guest.coordinator.set_backend(None);
    assert!(!guest.coordinator.has_backend());

    guest.coordinator.create_session(4, "FreeForAll");
    guest.coordinator.find_sessions(10);
    guest.coordinator.join_session(&SessionSearchResult {
        session_id: "remote".into(),
        owning_user_name: "host".into(),
        owning_user: UserId::new("host"),
        open_public_connections: 1,
        max_public_connections: 4,
        ping_ms: None,
        settings: Default::default(),
    });
    guest.coordinator.destroy_session();

    assert_eq!(
        guest.seen(),
        vec![
            Seen::Create(false),
            Seen::Find(0, false),
            Seen::Join(JoinSessionResult::UnknownError),
            Seen::Destroy(false),
        ]
    );
    assert!(guest.backend.requests().is_empty());
    for kind in OperationKind::iter() {
        assert_eq!(guest.backend.subscribe_count(kind), 0);
    }
}

#[test]
fn abandoned_request_ignores_late_completion() {
    let network = LoopbackNetwork::new();
    let config = SessionConfig {
        request_timeout_secs: Some(1),
        ..SessionConfig::default()
    };
    let guest = Player::with_config(&network, "guest", 7778, DeliveryMode::Queued, config);

    guest.coordinator.find_sessions(10);
    assert!(guest.coordinator.is_pending(OperationKind::Find));
    assert!(guest.coordinator.expire_stale_requests(Instant::now()).is_empty());

    let expired = guest
        .coordinator
        .expire_stale_requests(Instant::now() + Duration::from_secs(2));
    assert_eq!(expired, vec![OperationKind::Find]);
    assert_eq!(guest.seen(), vec![Seen::Find(0, false)]);

    assert_eq!(guest.backend.pump(), 1);
    assert_eq!(guest.seen(), vec![Seen::Find(0, false)]);
    assert_delegates_balanced(&guest.backend);
}

#[test(tokio::test)]
async fn completions_from_the_callback_pump_reach_handlers() {
    let network = LoopbackNetwork::new();
    let host = Player::new(&network, "host", 7777, DeliveryMode::Queued);
    let pump = CallbackPump::spawn(vec![Arc::clone(&host.backend)], Duration::from_millis(1));

    host.coordinator.create_session(4, "FreeForAll");
    tokio::time::timeout(Duration::from_secs(5), async {
        while host.seen().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("create completion was never delivered");
    pump.shutdown().await;

    assert_eq!(host.seen(), vec![Seen::Create(true)]);
    assert_delegates_balanced(&host.backend);
}
