//! Session notifications, listener registration and teardown.

mod helpers;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use fabric_bridge::native::NativeValue;
use fabric_bridge::native::sim::SimOperation;
use fabric_bridge::{
    BridgeError, HostLoop, LifecycleState, ReplayOptions, RunOutcome, SessionEvent,
    SessionEventKind, SimulatedFabric, Status, SubscriptionEventKind, SubscriptionOptions,
    Timestamp, connect, connect_blocking,
};
use helpers::fabric::{Fixture, Recorder, TIMEOUT, gd_options, options};
use helpers::polling::{run_for, run_until};

fn record_session(fixture: &Fixture, kind: SessionEventKind) -> Recorder<SessionEvent> {
    let log = Recorder::new();
    let sink = log.clone();
    fixture
        .session
        .on(kind, move |event| {
            sink.push(event.clone());
            Ok(())
        })
        .unwrap();
    log
}

fn notify_codes(events: &[SessionEvent]) -> Vec<Status> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Notify { code, .. } => Some(*code),
            _ => None,
        })
        .collect()
}

#[test]
fn fault_tolerant_login_reports_both_brokers() {
    let mut fixture = Fixture::with_options(options().with_secondary_tmx("10.0.0.2"));
    let info = record_session(&fixture, SessionEventKind::ConnectionInfo);
    assert!(fixture.run_until(|| info.len() == 1));

    let active: IpAddr = "10.0.0.1".parse().unwrap();
    let standby: IpAddr = "10.0.0.2".parse().unwrap();
    assert_eq!(
        info.snapshot(),
        [SessionEvent::ConnectionInfo {
            active,
            standby: Some(standby)
        }]
    );
    fixture.close();
}

#[test]
fn events_without_listeners_fall_back_to_notify() {
    let mut fixture = Fixture::connect();
    let notifies = record_session(&fixture, SessionEventKind::Notify);

    // Nobody listens for connection-info either.
    assert!(fixture.run_until(|| notify_codes(&notifies.snapshot()) == [Status::TMX_CONNECTED]));

    fixture.sim.simulate_connection_lost();
    assert!(fixture.run_until(|| notifies.len() == 2));
    assert_eq!(
        notify_codes(&notifies.snapshot()),
        [Status::TMX_CONNECTED, Status::TMX_CONNECTION_FAILED]
    );

    let restored = record_session(&fixture, SessionEventKind::ConnectionRestored);
    fixture.sim.simulate_reconnect();
    assert!(fixture.run_until(|| restored.len() == 1));
    run_for(&mut fixture.host, Duration::from_millis(20));
    assert_eq!(restored.snapshot(), [SessionEvent::ConnectionRestored]);
    assert_eq!(notifies.len(), 2);

    fixture.sim.notify_sessions(
        Status::from_code(999),
        fabric_bridge::native::NotificationData::None,
    );
    assert!(fixture.run_until(|| notifies.len() == 3));
    assert_eq!(
        notify_codes(&notifies.snapshot())[2],
        Status::from_code(999)
    );
    fixture.close();
}

fn notified(events: &[SessionEvent], status: Status) -> usize {
    events
        .iter()
        .filter(|event| {
            **event
                == SessionEvent::Notify {
                    code: status,
                    message: status.description().to_string(),
                }
        })
        .count()
}

#[test]
fn dedicated_events_reach_notify_only_while_unhandled() {
    let mut fixture = Fixture::with_options(gd_options(4, Default::default()));
    let notifies = record_session(&fixture, SessionEventKind::Notify);

    fixture.sim.simulate_connection_lost();
    fixture.sim.simulate_gds_lost();
    assert!(fixture.run_until(|| {
        let events = notifies.snapshot();
        notified(&events, Status::TMX_CONNECTION_FAILED) == 1
            && notified(&events, Status::GDS_COMM_LOST) == 1
    }));

    let lost = record_session(&fixture, SessionEventKind::ConnectionLost);
    let id = fixture
        .session
        .on(SessionEventKind::ConnectionLost, |_| Ok(()))
        .unwrap();
    fixture.sim.simulate_connection_lost();
    assert!(fixture.run_until(|| lost.len() == 1));
    run_for(&mut fixture.host, Duration::from_millis(20));
    assert_eq!(
        notified(&notifies.snapshot(), Status::TMX_CONNECTION_FAILED),
        1
    );

    // Back to the fallback once the last listener is gone.
    assert!(
        fixture
            .session
            .remove_listener(SessionEventKind::ConnectionLost, id)
    );
    assert!(!fixture.session.remove_listener(SessionEventKind::ConnectionLost, id));
    assert_eq!(
        fixture
            .session
            .remove_listeners(SessionEventKind::ConnectionLost),
        1
    );
    fixture.sim.simulate_connection_lost();
    assert!(fixture.run_until(|| {
        notified(&notifies.snapshot(), Status::TMX_CONNECTION_FAILED) == 2
    }));
    assert_eq!(lost.len(), 1);
    fixture.close();
}

#[test]
fn gds_connectivity_events_reach_gd_sessions() {
    let mut fixture = Fixture::with_options(gd_options(4, Default::default()));
    assert!(fixture.session.is_gd_enabled());
    let lost = record_session(&fixture, SessionEventKind::GdsLost);
    let restored = record_session(&fixture, SessionEventKind::GdsRestored);

    fixture.sim.simulate_gds_lost();
    fixture.sim.simulate_gds_restored();
    assert!(fixture.run_until(|| lost.len() == 1 && restored.len() == 1));
    assert_eq!(lost.snapshot(), [SessionEvent::GdsLost]);
    assert_eq!(restored.snapshot(), [SessionEvent::GdsRestored]);
    fixture.close();
}

#[test]
fn once_listeners_fire_a_single_time() {
    let mut fixture = Fixture::connect();
    let every = record_session(&fixture, SessionEventKind::ConnectionLost);
    let first = Recorder::new();
    let sink = first.clone();
    fixture
        .session
        .once(SessionEventKind::ConnectionLost, move |event| {
            sink.push(event.clone());
            Ok(())
        })
        .unwrap();

    fixture.sim.simulate_connection_lost();
    fixture.sim.simulate_connection_lost();
    assert!(fixture.run_until(|| every.len() == 2));
    assert_eq!(first.len(), 1);

    assert_eq!(
        fixture
            .session
            .remove_listeners(SessionEventKind::ConnectionLost),
        1
    );
    fixture.close();
}

#[test]
fn unknown_event_names_are_rejected_at_registration() {
    let mut fixture = Fixture::connect();
    fixture.sim.record_history(
        "NAMES.R",
        vec![("seq", NativeValue::Int(0))],
        Timestamp::from_millis(5),
    );
    let subscription = fixture
        .session
        .create_subscription_blocking("NAMES.S", SubscriptionOptions::best_effort())
        .unwrap();
    let publication = fixture
        .session
        .create_publication_blocking("NAMES.P")
        .unwrap();
    let replay = fixture
        .session
        .create_replay_blocking(
            "NAMES.R",
            ReplayOptions::new(Timestamp::from_millis(0), Timestamp::from_millis(10)),
        )
        .unwrap();

    assert!(fixture.session.on_named("connection-lost", |_| Ok(())).is_ok());
    assert!(matches!(
        fixture.session.on_named("bogus", |_| Ok(())),
        Err(BridgeError::InvalidArgument { .. })
    ));
    assert!(subscription.on_named("ack", |_| Ok(())).is_ok());
    assert!(subscription.on_named("finish", |_| Ok(())).is_err());
    assert!(publication.on_named("message", |_| Ok(())).is_ok());
    assert!(publication.on_named("stop", |_| Ok(())).is_err());
    assert!(replay.on_named("pause", |_| Ok(())).is_ok());
    assert!(replay.on_named("ack", |_| Ok(())).is_err());
    fixture.run_until(|| replay.state() == LifecycleState::Closed);
    fixture.close();
}

#[test]
fn a_failing_listener_is_reported_and_dispatch_continues() {
    let mut fixture = Fixture::connect();
    let fatal = Recorder::new();
    let sink = fatal.clone();
    fixture.host.handle().set_fatal_hook(move |error| {
        sink.push((error.entity, error.event, error.to_string()));
    });

    let subscription = fixture
        .session
        .create_subscription_blocking("FAIL.T", SubscriptionOptions::best_effort())
        .unwrap();
    subscription
        .on_message(|message| match message.get("seq") {
            Some(fabric_bridge::HostValue::Int32(1)) => Err("listener rejected seq 1".into()),
            _ => Ok(()),
        })
        .unwrap();
    let seen = Recorder::new();
    let sink = seen.clone();
    subscription
        .on(SubscriptionEventKind::Message, move |_| {
            sink.push(());
            Ok(())
        })
        .unwrap();

    for n in 0..3 {
        fixture
            .sim
            .inject("FAIL.T", vec![("seq", NativeValue::Int(n))]);
    }
    assert!(fixture.run_until(|| seen.len() == 3));
    assert!(fixture.wait_released());

    let fatal = fatal.snapshot();
    assert_eq!(fatal.len(), 1);
    assert_eq!((fatal[0].0, fatal[0].1), ("subscription", "message"));
    assert!(fatal[0].2.contains("listener rejected seq 1"), "{}", fatal[0].2);
    fixture.close();
}

#[test]
fn remote_termination_stops_children_and_closes_once() {
    let mut fixture = Fixture::connect();
    let closes = record_session(&fixture, SessionEventKind::Close);
    let subscription = fixture
        .session
        .create_subscription_blocking("TERM.T", SubscriptionOptions::best_effort())
        .unwrap();
    let stops = Recorder::new();
    let sink = stops.clone();
    subscription
        .on_stop(move || {
            sink.push(());
            Ok(())
        })
        .unwrap();

    fixture.sim.terminate_sessions_remotely();
    assert!(fixture.run_until(|| closes.len() == 1 && stops.len() == 1));
    assert_eq!(fixture.host.run_for(Duration::from_secs(2)), RunOutcome::Idle);

    assert_eq!(fixture.session.state(), LifecycleState::Closed);
    assert_eq!(subscription.state(), LifecycleState::Closed);
    assert!(matches!(
        fixture.session.close_blocking(),
        Err(BridgeError::Closed { .. })
    ));
    assert!(
        fixture
            .session
            .create_subscription_blocking("TERM.T", SubscriptionOptions::best_effort())
            .is_err()
    );
    let stats = fixture.sim.stats();
    assert_eq!((stats.sessions, stats.subscriptions), (0, 0));
    assert_eq!(closes.len(), 1);
}

#[test]
fn async_close_reports_and_releases_everything() {
    let mut fixture = Fixture::with_options(gd_options(4, Default::default()));
    let closes = record_session(&fixture, SessionEventKind::Close);
    let subscription = fixture
        .session
        .create_subscription_blocking("CLOSE.T", SubscriptionOptions::best_effort())
        .unwrap();
    let stops = Recorder::new();
    let sink = stops.clone();
    subscription
        .on_stop(move || {
            sink.push(());
            Ok(())
        })
        .unwrap();

    let closed = Recorder::new();
    let sink = closed.clone();
    fixture
        .session
        .close(move |result| {
            sink.push(result);
            Ok(())
        })
        .unwrap();
    // A second close is refused while the first is in flight.
    assert!(fixture.session.close(|_| Ok(())).is_err());

    assert!(fixture.run_until(|| closed.len() == 1 && closes.len() == 1 && stops.len() == 1));
    assert_eq!(closed.snapshot(), [Ok::<(), BridgeError>(())]);
    assert_eq!(fixture.host.run_for(Duration::from_secs(2)), RunOutcome::Idle);
    assert_eq!(fixture.session.state(), LifecycleState::Closed);
    let stats = fixture.sim.stats();
    assert_eq!((stats.sessions, stats.subscriptions), (0, 0));
}

#[test]
fn async_and_blocking_connect_agree() {
    let mut host = HostLoop::new().unwrap();
    let sim = SimulatedFabric::new();
    let api: Arc<SimulatedFabric> = Arc::new(sim.clone());

    let connected = Recorder::new();
    let sink = connected.clone();
    connect(&host.handle(), api.clone(), options(), move |result| {
        sink.push(result.map(|session| session.state()));
        Ok(())
    })
    .unwrap();
    assert!(run_until(&mut host, TIMEOUT, || connected.len() == 1));
    assert_eq!(
        connected.snapshot(),
        [Ok::<_, BridgeError>(LifecycleState::Active)]
    );

    let blocking = connect_blocking(&host.handle(), api.clone(), options()).unwrap();
    assert_eq!(blocking.state(), LifecycleState::Active);
    assert_eq!(sim.stats().sessions, 2);

    sim.fail_next(SimOperation::SessionLogin, Status::LOGIN_FAILED);
    let failed = Recorder::new();
    let sink = failed.clone();
    connect(&host.handle(), api.clone(), options(), move |result| {
        sink.push(result.err());
        Ok(())
    })
    .unwrap();
    assert!(run_until(&mut host, TIMEOUT, || failed.len() == 1));
    let expected = BridgeError::native("session_login", Status::LOGIN_FAILED);
    assert_eq!(failed.snapshot(), [Some(expected.clone())]);

    sim.fail_next(SimOperation::SessionLogin, Status::LOGIN_FAILED);
    assert_eq!(
        connect_blocking(&host.handle(), api, options()).unwrap_err(),
        expected
    );
    blocking.close_blocking().unwrap();
}
