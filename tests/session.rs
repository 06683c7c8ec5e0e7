mod common;

use common::*;
use futures::StreamExt;
use offboard_lib::command::{CommandId, CommandResult};
use offboard_lib::subsystems::offboard::{SessionState, StateChange};
use offboard_lib::subsystems::setpoint::Setpoint;
use offboard_lib::subsystems::telemetry::{TelemetryCategory, TelemetryData, TelemetrySample};
use offboard_lib::{loopback, Error, SessionConfig, Vehicle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

async fn connect() -> (Vehicle, SimVehicle) {
    connect_with(test_config()).await
}

async fn connect_with(config: SessionConfig) -> (Vehicle, SimVehicle) {
    init_logger();
    let (link, remote) = loopback();
    let vehicle = Vehicle::connect_from_link(link, config).await.unwrap();
    (vehicle, SimVehicle::spawn(remote))
}

async fn engage(vehicle: &Vehicle) {
    vehicle.update_setpoint(Setpoint::hold()).unwrap();
    vehicle.start_session().await.unwrap();
    assert_eq!(vehicle.offboard.state(), SessionState::Active);
}

/// Asserts that no setpoint reaches the vehicle anymore
async fn assert_silent(sim: &SimVehicle) {
    sleep(Duration::from_millis(20)).await;
    let count = sim.setpoint_count();
    sleep(Duration::from_millis(60)).await;
    assert_eq!(sim.setpoint_count(), count, "setpoints still streamed");
}

#[tokio::test(flavor = "multi_thread")]
async fn start_requires_a_primed_setpoint() {
    let (vehicle, sim) = connect().await;

    assert!(matches!(vehicle.start_session().await, Err(Error::NoSetpointPrimed)));
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(sim.commands().is_empty());

    vehicle.update_setpoint(Setpoint::hold()).unwrap();
    vehicle.start_session().await.unwrap();

    assert_eq!(vehicle.offboard.state(), SessionState::Active);
    assert!(vehicle.offboard.is_streaming());
    assert_eq!(sim.commands(), vec![CommandId::OffboardStart]);
    // The link is ordered: the vehicle saw a setpoint before the mode request
    assert!(sim.setpoint_count() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_twice_is_refused() {
    let (vehicle, _sim) = connect().await;
    engage(&vehicle).await;

    assert!(matches!(vehicle.start_session().await, Err(Error::AlreadyStreaming)));
    assert_eq!(vehicle.offboard.state(), SessionState::Active);
}

#[tokio::test(flavor = "multi_thread")]
async fn latest_setpoint_is_resent_every_tick() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;

    let target = Setpoint::velocity_ned(1.0, -0.5, 0.0, 90.0).unwrap();
    let mark = sim.setpoint_count();
    vehicle.offboard.update(target).unwrap();
    sleep(Duration::from_millis(150)).await;

    let sent: Vec<Setpoint> = sim.setpoints()[mark..].iter().map(|(_, s)| *s).collect();
    let first = sent.iter().position(|s| *s == target).unwrap();
    // Ticks already queued when update() was called may carry the previous setpoint
    assert!(first <= 2, "target first sent at tick {}", first);
    assert!(sent[first..].iter().all(|s| *s == target));
    assert!(sent.len() - first >= 5, "only {} repetitions", sent.len() - first);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_period_is_kept() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;
    sleep(Duration::from_millis(200)).await;

    let times: Vec<Instant> = sim.setpoints().iter().map(|(t, _)| *t).collect();
    let longest = times
        .windows(2)
        .map(|w| w[1] - w[0])
        .max()
        .unwrap();
    // Half of the remote timeout, the vehicle would disengage beyond that
    assert!(longest < Duration::from_millis(50), "gap of {:?}", longest);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_requires_an_engaged_session() {
    let (vehicle, _sim) = connect().await;

    assert!(matches!(vehicle.offboard.update(Setpoint::hold()), Err(Error::NotActive)));
    // set() primes instead
    vehicle.offboard.set(Setpoint::hold()).unwrap();
    assert_eq!(vehicle.offboard.current_setpoint(), Some(Setpoint::hold()));
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_start_stops_the_stream() {
    let (vehicle, sim) = connect().await;
    sim.reply(CommandId::OffboardStart, Reply::Ack(CommandResult::Denied));

    vehicle.update_setpoint(Setpoint::hold()).unwrap();
    let result = vehicle.start_session().await;

    assert!(matches!(result, Err(Error::Rejected(CommandResult::Denied))));
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());
    assert_silent(&sim).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unacknowledged_start_is_rejected() {
    let (vehicle, sim) = connect().await;
    sim.reply(CommandId::OffboardStart, Reply::Silent);

    vehicle.update_setpoint(Setpoint::hold()).unwrap();
    let begin = Instant::now();
    let result = vehicle.start_session().await;

    assert!(matches!(result, Err(Error::Rejected(_))));
    assert!(begin.elapsed() >= Duration::from_millis(200));
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_stop_stops_the_stream() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;

    vehicle.stop_session().await.unwrap();

    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());
    assert_eq!(
        sim.commands(),
        vec![CommandId::OffboardStart, CommandId::OffboardStop]
    );
    assert_silent(&sim).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_timeout_still_stops_the_stream() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;
    sim.reply(CommandId::OffboardStop, Reply::Silent);

    let before = sim.setpoint_count();
    let result = vehicle.stop_session().await;

    assert!(matches!(result, Err(Error::Timeout)));
    // Setpoints kept flowing while waiting for the vehicle
    assert!(sim.setpoint_count() > before + 5);
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());
    assert_silent(&sim).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_stop_still_stops_the_stream() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;
    sim.reply(CommandId::OffboardStop, Reply::Ack(CommandResult::Denied));

    let result = vehicle.stop_session().await;

    assert!(matches!(result, Err(Error::Rejected(CommandResult::Denied))));
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_when_idle_does_nothing() {
    let (vehicle, sim) = connect().await;

    vehicle.stop_session().await.unwrap();
    assert!(sim.commands().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_skips_the_handshake() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;

    vehicle.offboard.abort().await;

    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());
    assert_eq!(sim.commands(), vec![CommandId::OffboardStart]);
    assert_silent(&sim).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_of_send_failures_degrades_the_session() {
    init_logger();
    let (link, remote, failures) = flaky_loopback();
    let vehicle = Vehicle::connect_from_link(link, test_config()).await.unwrap();
    let sim = SimVehicle::spawn(remote);
    engage(&vehicle).await;

    failures.fail_next(test_config().send_failure_threshold);

    let mut state = vehicle.offboard.watch_state();
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == SessionState::Degraded),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!vehicle.offboard.is_streaming());
    assert_silent(&sim).await;
    assert!(matches!(vehicle.offboard.update(Setpoint::hold()), Err(Error::NotActive)));
}

#[tokio::test(flavor = "multi_thread")]
async fn failures_below_threshold_are_absorbed() {
    init_logger();
    let (link, remote, failures) = flaky_loopback();
    let vehicle = Vehicle::connect_from_link(link, test_config()).await.unwrap();
    let sim = SimVehicle::spawn(remote);
    engage(&vehicle).await;

    failures.fail_next(test_config().send_failure_threshold - 1);
    sleep(Duration::from_millis(100)).await;
    let count = sim.setpoint_count();
    // Again after a success in between
    failures.fail_next(test_config().send_failure_threshold - 1);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(vehicle.offboard.state(), SessionState::Active);
    assert!(vehicle.offboard.is_streaming());
    assert!(sim.setpoint_count() > count);
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_link_error_degrades_the_session() {
    init_logger();
    let (link, remote, failures) = flaky_loopback();
    let vehicle = Vehicle::connect_from_link(link, test_config()).await.unwrap();
    let _sim = SimVehicle::spawn(remote);
    engage(&vehicle).await;

    failures.fail_fatally();

    assert!(eventually(Duration::from_secs(1), || vehicle.offboard.state() == SessionState::Degraded).await);
    assert!(!vehicle.offboard.is_streaming());
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_session_can_be_restarted() {
    init_logger();
    let (link, remote, failures) = flaky_loopback();
    let vehicle = Vehicle::connect_from_link(link, test_config()).await.unwrap();
    let sim = SimVehicle::spawn(remote);
    engage(&vehicle).await;

    failures.fail_next(test_config().send_failure_threshold);
    assert!(eventually(Duration::from_secs(1), || vehicle.offboard.state() == SessionState::Degraded).await);

    vehicle.start_session().await.unwrap();
    assert_eq!(vehicle.offboard.state(), SessionState::Active);
    assert_eq!(
        sim.commands(),
        vec![CommandId::OffboardStart, CommandId::OffboardStart]
    );

    vehicle.stop_session().await.unwrap();
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_leaves_degraded_without_handshake() {
    init_logger();
    let (link, remote, failures) = flaky_loopback();
    let vehicle = Vehicle::connect_from_link(link, test_config()).await.unwrap();
    let sim = SimVehicle::spawn(remote);
    engage(&vehicle).await;

    failures.fail_fatally();
    assert!(eventually(Duration::from_secs(1), || vehicle.offboard.state() == SessionState::Degraded).await);

    vehicle.stop_session().await.unwrap();
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert_eq!(sim.commands(), vec![CommandId::OffboardStart]);
}

#[tokio::test(flavor = "multi_thread")]
async fn link_loss_degrades_an_engaged_session() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;

    sim.disconnect();

    assert!(eventually(Duration::from_secs(1), || vehicle.offboard.state() == SessionState::Degraded).await);
    assert!(!vehicle.offboard.is_streaming());
    assert!(!vehicle.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn transitions_are_published_in_order() {
    let (vehicle, _sim) = connect().await;

    let seen: Arc<Mutex<Vec<StateChange>>> = Arc::default();
    let log = seen.clone();
    vehicle.subscribe_session_state(move |change| log.lock().unwrap().push(*change));
    let mut events = Box::pin(vehicle.offboard.state_events());

    engage(&vehicle).await;
    vehicle.stop_session().await.unwrap();

    let expected = vec![
        (SessionState::Idle, SessionState::Starting),
        (SessionState::Starting, SessionState::Active),
        (SessionState::Active, SessionState::Stopping),
        (SessionState::Stopping, SessionState::Idle),
    ];

    let mut streamed = Vec::new();
    for _ in 0..expected.len() {
        let change = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        streamed.push((change.previous, change.current));
    }
    assert_eq!(streamed, expected);

    assert!(eventually(Duration::from_secs(1), || seen.lock().unwrap().len() == expected.len()).await);
    let called: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|c| (c.previous, c.current))
        .collect();
    assert_eq!(called, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribed_state_callback_is_not_called() {
    let (vehicle, _sim) = connect().await;

    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let subscription = vehicle.subscribe_session_state(move |_| *counter.lock().unwrap() += 1);
    assert!(vehicle.offboard.unsubscribe_state(subscription));
    assert!(!vehicle.offboard.unsubscribe_state(subscription));

    engage(&vehicle).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_an_engaged_session() {
    let (vehicle, sim) = connect().await;
    engage(&vehicle).await;

    vehicle.shutdown().await;

    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());
    assert_eq!(
        sim.commands(),
        vec![CommandId::OffboardStart, CommandId::OffboardStop]
    );
    assert!(!vehicle.is_connected());
    assert_silent(&sim).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_gives_up_on_a_silent_vehicle() {
    let config = SessionConfig {
        ack_timeout_ms: 2_000,
        shutdown_timeout_ms: 50,
        ..test_config()
    };
    let (vehicle, sim) = connect_with(config).await;
    engage(&vehicle).await;
    sim.reply(CommandId::OffboardStop, Reply::Silent);

    let begin = Instant::now();
    vehicle.shutdown().await;

    // Bounded by the shutdown timeout, not the ack timeout
    assert!(begin.elapsed() >= Duration::from_millis(50));
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert_silent(&sim).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_a_pending_start() {
    let config = SessionConfig {
        ack_timeout_ms: 5_000,
        ..test_config()
    };
    let (vehicle, sim) = connect_with(config).await;
    sim.reply(CommandId::OffboardStart, Reply::Silent);
    let vehicle = Arc::new(vehicle);

    vehicle.update_setpoint(Setpoint::hold()).unwrap();
    let starting = tokio::spawn({
        let vehicle = vehicle.clone();
        async move { vehicle.start_session().await }
    });
    assert!(eventually(Duration::from_secs(1), || vehicle.offboard.state() == SessionState::Starting).await);
    assert!(eventually(Duration::from_secs(1), || sim.commands() == vec![CommandId::OffboardStart]).await);

    let begin = Instant::now();
    vehicle.shutdown().await;

    assert!(matches!(starting.await.unwrap(), Err(Error::Cancelled)));
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert_eq!(vehicle.offboard.state(), SessionState::Idle);
    assert!(!vehicle.offboard.is_streaming());

    // The vehicle may have entered offboard mode, it is told to leave it
    assert_eq!(
        sim.commands(),
        vec![CommandId::OffboardStart, CommandId::OffboardStop]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_during_start_keeps_streaming_until_the_stop_request() {
    let config = SessionConfig {
        ack_timeout_ms: 5_000,
        ..test_config()
    };
    let (vehicle, sim) = connect_with(config).await;
    sim.reply(CommandId::OffboardStart, Reply::Silent);
    let vehicle = Arc::new(vehicle);

    let transitions = Arc::new(Mutex::new(Vec::new()));
    vehicle.subscribe_session_state({
        let transitions = transitions.clone();
        move |change| transitions.lock().unwrap().push(change.current)
    });

    vehicle.update_setpoint(Setpoint::hold()).unwrap();
    let starting = tokio::spawn({
        let vehicle = vehicle.clone();
        async move { vehicle.start_session().await }
    });
    assert!(eventually(Duration::from_secs(1), || !sim.commands().is_empty()).await);

    vehicle.shutdown().await;
    assert!(matches!(starting.await.unwrap(), Err(Error::Cancelled)));

    assert_eq!(sim.last_command().unwrap().id, CommandId::OffboardStop);
    assert!(
        eventually(Duration::from_secs(1), || {
            *transitions.lock().unwrap()
                == vec![SessionState::Starting, SessionState::Stopping, SessionState::Idle]
        })
        .await,
        "transitions {:?}",
        transitions.lock().unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn telemetry_frames_reach_the_hub() {
    let (vehicle, sim) = connect().await;

    let sample = TelemetrySample::new(
        1,
        TelemetryData::Battery {
            voltage_v: 15.9,
            remaining: 0.87,
        },
    );
    sim.send(&sample.to_frame()).await;

    let received = vehicle
        .telemetry
        .wait_for(TelemetryCategory::Battery, Duration::from_secs(1), |_| true)
        .await
        .unwrap();
    assert_eq!(received, sample);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_config_is_refused() {
    let (link, _remote) = loopback();
    let config = SessionConfig {
        setpoint_period_ms: 400,
        ..SessionConfig::default()
    };

    assert!(matches!(
        Vehicle::connect_from_link(link, config).await,
        Err(Error::Config(_))
    ));
}
