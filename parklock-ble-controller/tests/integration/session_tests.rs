//! Lock session: configuration, the command/response exchange, status
//! verification and the disconnect-retry policy.

use std::time::Duration;

use parklock_ble_controller::{
    Dispatch, RadioState, SessionError, SessionEvent, SessionState, TransportEvent,
};
use parklock_proto::ble::{GEN1_NOTIFY_UUID, GEN2_WRITE_UUID, gatt_profile};
use parklock_proto::{AnomalyKind, Generation, LockAction, ProtoError, encode};

use crate::mock_transport::{
    Harness, LOCK_KEY, LOCK_MAC, MockTransport, TransportCall, lock_advertisement,
    lock_peripheral, notification, stranger_advertisement,
};

fn anomaly_kind(event: &SessionEvent) -> Option<AnomalyKind> {
    match event {
        SessionEvent::ProtocolAnomaly(anomaly) => Some(anomaly.kind),
        _ => None,
    }
}

#[tokio::test]
async fn gen1_lock_is_found_by_manufacturer_data() {
    let mut h = Harness::new(MockTransport::new(Generation::Gen1));

    h.session.configure(LOCK_MAC, "V1", None).await.unwrap();
    assert_eq!(h.session.identity().unwrap().fingerprint().len(), 12);
    assert_eq!(h.transport.calls(), vec![TransportCall::StartScan]);
    assert_eq!(
        h.drain_events(),
        vec![SessionEvent::RadioStateChanged { powered_on: true }]
    );
    assert_eq!(h.session.state(), SessionState::Scanning);

    h.session
        .handle_transport_event(TransportEvent::Discovered(stranger_advertisement()))
        .await;
    assert_eq!(h.transport.calls().len(), 1);

    h.session
        .handle_transport_event(TransportEvent::Discovered(lock_advertisement(Generation::Gen1)))
        .await;
    assert_eq!(
        h.transport.calls()[1..],
        [
            TransportCall::Connect(lock_peripheral()),
            TransportCall::StopScan,
            TransportCall::DiscoverServices(lock_peripheral()),
            TransportCall::SetNotify {
                characteristic: GEN1_NOTIFY_UUID,
                enabled: true
            },
        ]
    );
    assert_eq!(h.drain_events(), vec![SessionEvent::Connected]);
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn invalid_device_id_never_scans() {
    let mut h = Harness::new(MockTransport::new(Generation::Gen1));

    assert_eq!(
        h.session.configure("AB:CD", "V1", None).await,
        Err(SessionError::Protocol(ProtoError::InvalidDeviceId(
            "AB:CD".to_string()
        )))
    );
    assert_eq!(
        h.session.configure(LOCK_MAC, "V2", None).await,
        Err(SessionError::Protocol(ProtoError::MissingSecretKey))
    );
    assert_eq!(
        h.session.configure(LOCK_MAC, "V3", None).await,
        Err(SessionError::Protocol(ProtoError::InvalidGeneration(
            "V3".to_string()
        )))
    );

    assert!(h.transport.calls().is_empty());
    assert!(h.drain_events().is_empty());
    assert_eq!(h.session.state(), SessionState::Unconfigured);
    assert_eq!(
        h.session.request_action(LockAction::TurnDown).await,
        Err(SessionError::NotConfigured)
    );
}

#[tokio::test]
async fn unauthorized_radio_is_reported_without_scanning() {
    let mut h = Harness::new(
        MockTransport::new(Generation::Gen2).with_radio(RadioState::Unauthorized),
    );
    h.session
        .configure(LOCK_MAC, "V2", Some(LOCK_KEY))
        .await
        .unwrap();

    assert_eq!(
        h.drain_events(),
        vec![
            SessionEvent::RadioUnauthorized,
            SessionEvent::RadioStateChanged { powered_on: false },
        ]
    );
    assert!(h.transport.calls().is_empty());
    assert_eq!(h.session.state(), SessionState::Ready);
}

#[tokio::test]
async fn radio_power_on_resumes_scanning() {
    let mut h =
        Harness::new(MockTransport::new(Generation::Gen1).with_radio(RadioState::PoweredOff));
    h.session.configure(LOCK_MAC, "V1", None).await.unwrap();
    assert_eq!(
        h.drain_events(),
        vec![SessionEvent::RadioStateChanged { powered_on: false }]
    );
    assert!(h.transport.calls().is_empty());

    h.session
        .handle_transport_event(TransportEvent::RadioStateChanged(RadioState::PoweredOn))
        .await;
    assert_eq!(
        h.drain_events(),
        vec![SessionEvent::RadioStateChanged { powered_on: true }]
    );
    assert_eq!(h.transport.calls(), vec![TransportCall::StartScan]);
}

#[tokio::test]
async fn request_while_scanning_is_not_queued() {
    let mut h = Harness::new(MockTransport::new(Generation::Gen1));
    h.session.configure(LOCK_MAC, "V1", None).await.unwrap();

    assert_eq!(
        h.session.request_action(LockAction::TurnUp).await,
        Ok(Dispatch::Scanning)
    );
    assert_eq!(h.transport.count(&TransportCall::StartScan), 1);

    h.session
        .handle_transport_event(TransportEvent::Discovered(lock_advertisement(Generation::Gen1)))
        .await;
    assert!(h.transport.writes().is_empty());
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn gen2_turn_down_is_verified_after_five_seconds() {
    let mut h = Harness::connected(Generation::Gen2).await;

    assert_eq!(
        h.session.request_action(LockAction::TurnDown).await,
        Ok(Dispatch::Written)
    );
    let turn = encode(LockAction::TurnDown, Generation::Gen2, LOCK_KEY).unwrap();
    assert_eq!(
        h.transport.writes(),
        vec![(GEN2_WRITE_UUID, turn.into_bytes())]
    );
    assert_eq!(h.session.state(), SessionState::AwaitingTurnAck);

    h.session
        .handle_transport_event(notification(Generation::Gen2, "140101"))
        .await;
    assert_eq!(h.drain_events(), vec![SessionEvent::LockTurnedDown]);
    assert_eq!(h.session.expected_status(), Some("UNLOCKED"));

    assert!(
        tokio::time::timeout(Duration::from_millis(4_900), h.session.process_next())
            .await
            .is_err()
    );
    assert_eq!(h.transport.writes().len(), 1);

    assert!(h.session.process_next().await);
    let check = encode(LockAction::CheckStatus, Generation::Gen2, LOCK_KEY).unwrap();
    assert_eq!(
        h.transport.writes().last(),
        Some(&(GEN2_WRITE_UUID, check.into_bytes()))
    );
    assert_eq!(h.session.state(), SessionState::AwaitingCheckAck);

    h.session
        .handle_transport_event(notification(Generation::Gen2, "140101"))
        .await;
    assert_eq!(h.drain_events(), vec![SessionEvent::LockTurnedDown]);
    assert_eq!(h.session.state(), SessionState::Connected);
    assert_eq!(h.session.expected_status(), None);
}

#[tokio::test(start_paused = true)]
async fn gen1_verification_reports_by_parity() {
    let mut h = Harness::connected(Generation::Gen1).await;

    h.session.request_action(LockAction::TurnUp).await.unwrap();
    h.session
        .handle_transport_event(notification(Generation::Gen1, "01ae"))
        .await;
    assert_eq!(h.drain_events(), vec![SessionEvent::LockTurnedUp]);

    assert!(h.session.process_next().await);
    assert_eq!(h.session.state(), SessionState::AwaitingCheckAck);

    // Even means down, which is not what was asked for
    h.session
        .handle_transport_event(notification(Generation::Gen1, "0002"))
        .await;
    assert!(h.drain_events().is_empty());
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn notification_with_nothing_pending_is_ignored() {
    let mut h = Harness::connected(Generation::Gen2).await;

    h.session
        .handle_transport_event(notification(Generation::Gen2, "140101"))
        .await;
    assert!(h.drain_events().is_empty());
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn disconnect_during_turn_is_swallowed_and_retried_locally() {
    let mut h = Harness::connected(Generation::Gen1).await;

    h.session.request_action(LockAction::TurnUp).await.unwrap();
    h.session
        .handle_transport_event(TransportEvent::Disconnected(lock_peripheral()))
        .await;
    assert!(h.drain_events().is_empty());
    assert_eq!(h.transport.count(&TransportCall::StartScan), 1);

    assert_eq!(
        h.session.request_action(LockAction::TurnUp).await,
        Ok(Dispatch::ResolvedLocally)
    );
    assert_eq!(h.drain_events(), vec![SessionEvent::LockTurnedUp]);
    assert_eq!(h.transport.writes().len(), 1);

    assert_eq!(
        h.session.request_action(LockAction::TurnUp).await,
        Ok(Dispatch::Scanning)
    );
}

#[tokio::test]
async fn idle_disconnect_is_reported_with_radio_state() {
    let mut h = Harness::connected(Generation::Gen1).await;

    h.session
        .handle_transport_event(TransportEvent::Disconnected(lock_peripheral()))
        .await;
    assert_eq!(
        h.drain_events(),
        vec![
            SessionEvent::Disconnected,
            SessionEvent::RadioStateChanged { powered_on: true },
        ]
    );
    assert_eq!(h.transport.calls(), vec![TransportCall::StartScan]);
    assert_eq!(h.session.state(), SessionState::Scanning);
}

#[tokio::test]
async fn second_request_does_not_disturb_the_first() {
    let mut h = Harness::connected(Generation::Gen1).await;

    h.session.request_action(LockAction::TurnDown).await.unwrap();
    assert_eq!(
        h.session.request_action(LockAction::TurnUp).await,
        Err(SessionError::ActionInFlight(LockAction::TurnDown))
    );
    assert_eq!(
        h.session.request_action(LockAction::CheckStatus).await,
        Err(SessionError::ActionInFlight(LockAction::TurnDown))
    );
    assert_eq!(h.transport.writes().len(), 1);

    h.session
        .handle_transport_event(notification(Generation::Gen1, "019e"))
        .await;
    assert_eq!(h.drain_events(), vec![SessionEvent::LockTurnedDown]);
}

#[tokio::test]
async fn unknown_ack_is_surfaced_and_keeps_waiting() {
    let mut h = Harness::connected(Generation::Gen1).await;

    h.session.request_action(LockAction::TurnDown).await.unwrap();
    h.session
        .handle_transport_event(notification(Generation::Gen1, "abcd"))
        .await;
    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(anomaly_kind(&events[0]), Some(AnomalyKind::UnknownStatus));
    assert_eq!(h.session.state(), SessionState::AwaitingTurnAck);
}

#[tokio::test]
async fn status_check_without_a_turn_concludes_as_anomaly() {
    let mut h = Harness::connected(Generation::Gen1).await;

    h.session
        .request_action(LockAction::CheckStatus)
        .await
        .unwrap();
    assert_eq!(h.session.state(), SessionState::AwaitingCheckAck);

    h.session
        .handle_transport_event(notification(Generation::Gen1, "0002"))
        .await;
    let events = h.drain_events();
    assert_eq!(anomaly_kind(&events[0]), Some(AnomalyKind::NotVerifying));
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn reset_is_gen1_only() {
    let mut h = Harness::connected(Generation::Gen2).await;
    assert_eq!(
        h.session.request_action(LockAction::Reset).await,
        Err(SessionError::Protocol(ProtoError::UnsupportedAction {
            action: LockAction::Reset,
            generation: Generation::Gen2,
        }))
    );
    assert!(h.transport.writes().is_empty());
    assert_eq!(h.session.state(), SessionState::Connected);

    let mut h = Harness::connected(Generation::Gen1).await;
    assert_eq!(
        h.session.request_action(LockAction::Reset).await,
        Ok(Dispatch::Written)
    );
    h.session
        .handle_transport_event(notification(Generation::Gen1, "0000"))
        .await;
    let events = h.drain_events();
    assert_eq!(anomaly_kind(&events[0]), Some(AnomalyKind::NoResponseRule));
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn detected_generation_overrides_the_hint() {
    // Advertises like a V1 lock but exposes the V2 service
    let mut h = Harness::new(MockTransport::new(Generation::Gen2));
    h.session
        .configure(LOCK_MAC, "V1", Some(LOCK_KEY))
        .await
        .unwrap();
    h.session
        .handle_transport_event(TransportEvent::Discovered(lock_advertisement(Generation::Gen1)))
        .await;
    assert_eq!(h.session.generation(), Some(Generation::Gen2));

    h.session.request_action(LockAction::TurnUp).await.unwrap();
    let frame = encode(LockAction::TurnUp, Generation::Gen2, LOCK_KEY).unwrap();
    assert_eq!(
        h.transport.writes(),
        vec![(GEN2_WRITE_UUID, frame.into_bytes())]
    );

    h.session
        .handle_transport_event(notification(Generation::Gen2, "140102"))
        .await;
    assert!(h.drain_events().contains(&SessionEvent::LockTurnedUp));
}

#[tokio::test(start_paused = true)]
async fn tear_down_cancels_verification() {
    let mut h = Harness::connected(Generation::Gen2).await;

    h.session.request_action(LockAction::TurnUp).await.unwrap();
    h.session
        .handle_transport_event(notification(Generation::Gen2, "140102"))
        .await;
    h.session.tear_down().await;

    assert!(h.transport.calls().contains(&TransportCall::Disconnect(lock_peripheral())));
    assert!(h.transport.calls().contains(&TransportCall::SetNotify {
        characteristic: gatt_profile(Generation::Gen2).notify,
        enabled: false,
    }));
    assert_eq!(h.session.state(), SessionState::Ready);

    assert!(
        tokio::time::timeout(Duration::from_secs(10), h.session.process_next())
            .await
            .is_err()
    );
    assert_eq!(h.transport.writes().len(), 1);

    // Identity survives, the link comes back on demand
    h.transport.clear();
    assert_eq!(
        h.session.request_action(LockAction::TurnUp).await,
        Ok(Dispatch::Scanning)
    );
    assert_eq!(h.transport.calls(), vec![TransportCall::StartScan]);
}

#[tokio::test]
async fn reconfigure_replaces_the_lock() {
    let mut h = Harness::connected(Generation::Gen1).await;

    h.session
        .configure("11:22:33:44:55:66", "V1", None)
        .await
        .unwrap();
    assert_eq!(h.session.identity().unwrap().fingerprint(), "665544332211");
    assert!(h.transport.calls().contains(&TransportCall::Disconnect(lock_peripheral())));
    assert_eq!(h.transport.calls().last(), Some(&TransportCall::StartScan));

    // The old lock no longer matches
    h.transport.clear();
    h.session
        .handle_transport_event(TransportEvent::Discovered(lock_advertisement(Generation::Gen1)))
        .await;
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn connect_failure_returns_to_scanning() {
    let mut h = Harness::new(MockTransport::new(Generation::Gen1));
    h.session.configure(LOCK_MAC, "V1", None).await.unwrap();
    h.drain_events();

    h.transport.fail_connect(true);
    h.session
        .handle_transport_event(TransportEvent::Discovered(lock_advertisement(Generation::Gen1)))
        .await;
    assert!(h.drain_events().is_empty());
    assert_eq!(h.session.state(), SessionState::Scanning);

    h.transport.fail_connect(false);
    h.session
        .handle_transport_event(TransportEvent::Discovered(lock_advertisement(Generation::Gen1)))
        .await;
    assert_eq!(h.drain_events(), vec![SessionEvent::Connected]);
    assert_eq!(h.transport.count(&TransportCall::Connect(lock_peripheral())), 2);
}

#[tokio::test]
async fn session_runs_as_a_task() {
    let h = Harness::new(MockTransport::new(Generation::Gen2));
    let Harness {
        transport,
        session,
        mut events,
        sink,
    } = h;
    let lock = session.handle();
    let task = tokio::spawn(session.run());

    lock.configure(LOCK_MAC, "V2", Some(LOCK_KEY)).await.unwrap();
    assert_eq!(lock.state().await, Ok(SessionState::Scanning));

    assert!(sink.push(TransportEvent::Discovered(lock_advertisement(Generation::Gen2))));
    loop {
        if events.recv().await == Some(SessionEvent::Connected) {
            break;
        }
    }

    assert_eq!(
        lock.request_action(LockAction::TurnDown).await,
        Ok(Dispatch::Written)
    );
    assert_eq!(lock.state().await, Ok(SessionState::AwaitingTurnAck));
    assert_eq!(transport.writes().len(), 1);

    lock.shutdown();
    task.await.unwrap();
    assert_eq!(lock.state().await, Err(SessionError::Closed));
    assert!(!sink.push(TransportEvent::RadioStateChanged(RadioState::PoweredOff)));
}

#[tokio::test(start_paused = true)]
async fn background_replays_unanswered_gen2_turn() {
    let Harness {
        transport,
        session,
        mut events,
        sink,
    } = Harness::new(MockTransport::new(Generation::Gen2));
    let lock = session.handle();
    let task = tokio::spawn(session.run());

    lock.configure(LOCK_MAC, "V2", Some(LOCK_KEY)).await.unwrap();
    assert!(sink.push(TransportEvent::Discovered(lock_advertisement(Generation::Gen2))));
    while events.recv().await != Some(SessionEvent::Connected) {}

    assert_eq!(
        lock.request_action(LockAction::TurnUp).await,
        Ok(Dispatch::Written)
    );
    lock.enter_background().unwrap();
    assert_eq!(lock.state().await, Ok(SessionState::AwaitingTurnAck));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(transport.writes().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lock.state().await, Ok(SessionState::AwaitingTurnAck));
    let turn = encode(LockAction::TurnUp, Generation::Gen2, LOCK_KEY).unwrap();
    assert_eq!(
        transport.writes(),
        vec![
            (GEN2_WRITE_UUID, turn.as_bytes().to_vec()),
            (GEN2_WRITE_UUID, turn.into_bytes()),
        ]
    );

    lock.shutdown();
    task.await.unwrap();
}
