//! Session lifecycle scenarios against the in-memory connector
//!
//! Tests focus on observable behavior: transport operations the session
//! issues, the status it reports and the messages handlers receive.


use iotcore_device::auth::{CredentialIssuer, KeySource, SigningAlgorithm};
use iotcore_device::protocol::{ChannelKind, DeliveryTier, InboundMessage};
use iotcore_device::routing::LoggingHandler;
use iotcore_device::session::{PublishError, SessionError, SessionState, TransportEvent};
use iotcore_device::testing::{MockConnector, RecordingHandler, TransportOp};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

const WAIT: Duration = Duration::from_secs(5);

fn default_issuer() -> CredentialIssuer {
    rsa_issuer(Duration::from_secs(20 * 60))
}

#[tokio::test]
async fn test_subscriptions_precede_first_publish() {
    let connector = MockConnector::with_auto_ack();
    let session = spawn_session(
        &connector,
        default_issuer(),
        fast_settings(),
        Arc::new(LoggingHandler),
    );

    assert!(session.handle.connect().await);
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);
    assert!(eventually(WAIT, || !connector.published().is_empty()).await);

    let ops = connector.ops();
    let first_publish = ops
        .iter()
        .position(|op| matches!(op, TransportOp::Publish { .. }))
        .unwrap();
    let subscribes: Vec<_> = ops[..first_publish]
        .iter()
        .filter_map(|op| match op {
            TransportOp::Subscribe { topic, tier, .. } => Some((topic.as_str(), *tier)),
            _ => None,
        })
        .collect();
    assert_eq!(
        subscribes,
        vec![
            ("/devices/dev1/config", DeliveryTier::AtLeastOnce),
            ("/devices/dev1/commands/#", DeliveryTier::AtMostOnce),
        ]
    );

    let (topic, _, tier) = &connector.published()[0];
    assert_eq!(topic, "/devices/dev1/state");
    assert_eq!(*tier, DeliveryTier::AtLeastOnce);

    let params = connector.last_params().unwrap();
    assert_eq!(
        params.client_id,
        "projects/demo-project/locations/us-central1/registries/my-registry/devices/dev1"
    );
    assert_eq!(params.username, "unused");
    assert!(!params.password.is_empty());

    session.handle.shutdown();
    assert!(session.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_publish_while_disconnected_is_not_connected() {
    let connector = MockConnector::new();
    let session = spawn_session(
        &connector,
        default_issuer(),
        fast_settings(),
        Arc::new(LoggingHandler),
    );

    let result = session
        .handle
        .publish("/devices/dev1/state", b"{}".to_vec(), DeliveryTier::AtLeastOnce)
        .await;
    assert!(matches!(
        result,
        Err(PublishError::NotConnected {
            state: SessionState::Disconnected
        })
    ));
    assert_eq!(connector.connect_count(), 0);
    assert!(connector.published().is_empty());

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transport_error_disconnects_and_reconnects_once() {
    let connector = MockConnector::with_auto_ack();
    let mut settings = fast_settings();
    settings.reconnect.backoff_pattern = vec![300];
    let session = spawn_session(&connector, default_issuer(), settings, Arc::new(LoggingHandler));

    session.handle.connect().await;
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);
    assert!(session.handle.status().scheduler_running);

    // Two errors back to back; the second belongs to a discarded connection
    assert!(connector.emit_latest(TransportEvent::Error("boom".to_string())).await);
    assert!(connector.emit_latest(TransportEvent::Error("boom again".to_string())).await);

    assert!(
        session
            .handle
            .wait_for_status(WAIT, |status| {
                status.state == SessionState::Disconnected
                    && !status.scheduler_running
                    && !status.has_connection
            })
            .await
    );
    assert_eq!(connector.close_count(), 1);

    // An explicit request replaces the pending reconnect timer instead of adding a second attempt
    session.handle.connect().await;

    assert!(
        session
            .handle
            .wait_for_status(WAIT, |status| {
                status.state == SessionState::Connected && status.generation == 2
            })
            .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connector.connect_count(), 2);
    assert!(session.handle.status().scheduler_running);

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_events_from_discarded_connection_are_ignored() {
    let connector = MockConnector::with_auto_ack();
    let session = spawn_session(
        &connector,
        default_issuer(),
        fast_settings(),
        Arc::new(LoggingHandler),
    );

    session.handle.connect().await;
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);
    let first = connector.sink(1).unwrap();

    first.emit(TransportEvent::Closed("broker closed".to_string())).await;
    assert!(
        session
            .handle
            .wait_for_status(WAIT, |s| s.state == SessionState::Connected && s.generation == 2)
            .await
    );

    // Late events from generation 1 must not disturb generation 2
    first.emit(TransportEvent::Error("late".to_string())).await;
    first.emit(TransportEvent::Connected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = session.handle.status();
    assert_eq!(status.state, SessionState::Connected);
    assert_eq!(status.generation, 2);
    assert!(status.has_connection);

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inbound_messages_reach_handler() {
    let connector = MockConnector::with_auto_ack();
    let handler = Arc::new(RecordingHandler::default());
    let session = spawn_session(&connector, default_issuer(), fast_settings(), handler.clone());

    session.handle.connect().await;
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);

    connector
        .emit_latest(TransportEvent::Message(InboundMessage::new(
            "/devices/dev1/config",
            "aGVsbG8=",
        )))
        .await;
    connector
        .emit_latest(TransportEvent::Message(InboundMessage::new(
            "/devices/dev1/commands/reboot",
            "bm93",
        )))
        .await;
    connector
        .emit_latest(TransportEvent::Message(InboundMessage::new(
            "/devices/dev1/config",
            "not base64!",
        )))
        .await;

    assert!(eventually(WAIT, || handler.messages().len() >= 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages = handler.messages();
    assert_eq!(messages.len(), 2, "undecodable payload is discarded");
    assert_eq!(messages[0].kind, ChannelKind::ConfigUpdate);
    assert_eq!(messages[0].text, "hello");
    assert_eq!(messages[1].kind, ChannelKind::Command);
    assert_eq!(messages[1].subfolder.as_deref(), Some("reboot"));
    assert_eq!(messages[1].text, "now");

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_credential_is_reissued() {
    let connector = MockConnector::new();
    connector.set_reject_credentials(true);

    let mut settings = fast_settings();
    // Long enough for the next credential to carry a later issue time
    settings.reconnect.backoff_pattern = vec![1100];
    settings.reconnect.sustained_delay = 1100;

    let session = spawn_session(&connector, default_issuer(), settings, Arc::new(LoggingHandler));

    session.handle.connect().await;
    assert!(eventually(WAIT, || connector.connect_count() == 1).await);
    connector.set_reject_credentials(false);
    connector.set_auto_ack(true);

    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);

    let params = connector.connect_params();
    assert_eq!(params.len(), 2);
    assert_ne!(params[0].password, params[1].password);

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_plain_connect_failure_reuses_credential() {
    let connector = MockConnector::new();
    connector.set_fail_connect(true);

    let mut settings = fast_settings();
    settings.reconnect.backoff_pattern = vec![1100];
    settings.reconnect.sustained_delay = 1100;

    let session = spawn_session(&connector, default_issuer(), settings, Arc::new(LoggingHandler));

    session.handle.connect().await;
    assert!(eventually(WAIT, || connector.connect_count() == 1).await);
    connector.set_fail_connect(false);
    connector.set_auto_ack(true);

    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);

    let params = connector.connect_params();
    assert_eq!(params.len(), 2);
    assert_eq!(params[0].password, params[1].password);

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_credential_rotates_before_expiry() {
    let connector = MockConnector::with_auto_ack();
    let mut settings = fast_settings();
    settings.refresh_margin = Duration::from_secs(1);

    let session = spawn_session(
        &connector,
        rsa_issuer(Duration::from_secs(3)),
        settings,
        Arc::new(LoggingHandler),
    );

    session.handle.connect().await;
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);

    assert!(
        session
            .handle
            .wait_for_status(WAIT, |s| s.state == SessionState::Connected && s.generation == 2)
            .await
    );

    let params = connector.connect_params();
    assert_ne!(params[0].password, params[1].password);
    assert!(connector
        .ops()
        .contains(&TransportOp::Close { generation: 1 }));

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_key_during_rotation_retries_until_key_returns() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("device.pem");
    std::fs::copy(fixture_path("rsa_private.pem"), &key_path).unwrap();

    let connector = MockConnector::with_auto_ack();
    let mut settings = fast_settings();
    settings.refresh_margin = Duration::from_secs(1);
    let issuer = CredentialIssuer::new(
        KeySource::File(key_path.clone()),
        SigningAlgorithm::Rs256,
        Duration::from_secs(3),
    );

    let session = spawn_session(&connector, issuer, settings, Arc::new(LoggingHandler));
    session.handle.connect().await;
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);

    // Rotation finds no key: the attempt fails but the session keeps retrying
    std::fs::remove_file(&key_path).unwrap();
    assert!(
        session
            .handle
            .wait_for_status(WAIT, |s| s.state == SessionState::Disconnected
                && !s.scheduler_running
                && s.reconnect_attempts >= 1)
            .await
    );
    assert_eq!(connector.connect_count(), 1);
    assert!(!session.task.is_finished());

    std::fs::copy(fixture_path("rsa_private.pem"), &key_path).unwrap();
    assert!(
        session
            .handle
            .wait_for_status(WAIT, |s| s.state == SessionState::Connected && s.generation == 2)
            .await
    );
    let params = connector.connect_params();
    assert_eq!(params.len(), 2);
    assert_ne!(params[0].password, params[1].password);

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rotation_respects_minimum_delay() {
    let connector = MockConnector::with_auto_ack();
    let mut settings = fast_settings();
    // Every fresh credential is immediately due for rotation
    settings.refresh_margin = Duration::from_millis(1999);
    settings.reconnect.min_delay = 250;

    let session = spawn_session(
        &connector,
        rsa_issuer(Duration::from_secs(2)),
        settings,
        Arc::new(LoggingHandler),
    );
    session.handle.connect().await;
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let connects = connector.connect_count();
    assert!(
        (2..=6).contains(&connects),
        "unexpected connect count {connects}"
    );

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscription_failure_drops_connection_before_telemetry() {
    let connector = MockConnector::with_auto_ack();
    connector.set_fail_subscribe(true);
    let mut settings = fast_settings();
    settings.reconnect.backoff_pattern = vec![300];

    let session = spawn_session(&connector, default_issuer(), settings, Arc::new(LoggingHandler));
    session.handle.connect().await;

    assert!(
        session
            .handle
            .wait_for_status(WAIT, |s| s.state == SessionState::Disconnected
                && s.generation == 1
                && s.reconnect_attempts == 1)
            .await
    );
    let status = session.handle.status();
    assert!(!status.scheduler_running);
    assert!(!status.has_connection);
    assert!(connector.published().is_empty());
    assert_eq!(connector.close_count(), 1);

    // Exactly one reconnect follows
    connector.set_fail_subscribe(false);
    assert!(
        session
            .handle
            .wait_for_status(WAIT, |s| s.state == SessionState::Connected && s.generation == 2)
            .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connector.connect_count(), 2);
    assert!(session.handle.status().scheduler_running);

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_timeout_counts_as_failure() {
    // No acknowledgment ever arrives
    let connector = MockConnector::new();
    let mut settings = fast_settings();
    settings.connect_timeout = Duration::from_millis(100);
    settings.reconnect.backoff_pattern = vec![5000];

    let session = spawn_session(&connector, default_issuer(), settings, Arc::new(LoggingHandler));

    session.handle.connect().await;
    assert!(
        session
            .handle
            .wait_for_status(WAIT, |s| s.state == SessionState::Disconnected
                && s.generation == 1
                && s.reconnect_attempts == 1)
            .await
    );
    assert_eq!(connector.close_count(), 1);

    session.handle.shutdown();
    session.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let connector = MockConnector::new();
    connector.set_fail_connect(true);

    let mut settings = fast_settings();
    settings.reconnect.max_attempts = Some(2);

    let session = spawn_session(&connector, default_issuer(), settings, Arc::new(LoggingHandler));
    session.handle.connect().await;

    let result = tokio::time::timeout(WAIT, session.task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SessionError::ReconnectExhausted { attempts: 2 })
    ));
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(session.handle.state(), SessionState::Closing);
}

#[tokio::test]
async fn test_unreadable_key_stops_session() {
    let connector = MockConnector::with_auto_ack();
    let issuer = CredentialIssuer::new(
        KeySource::File(fixture_path("missing.pem")),
        SigningAlgorithm::Rs256,
        Duration::from_secs(60),
    );

    let session = spawn_session(&connector, issuer, fast_settings(), Arc::new(LoggingHandler));
    session.handle.connect().await;

    let result = tokio::time::timeout(WAIT, session.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::Credential(_))));
    assert_eq!(connector.connect_count(), 0);
    assert_eq!(session.handle.state(), SessionState::Closing);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let connector = MockConnector::with_auto_ack();
    let session = spawn_session(
        &connector,
        default_issuer(),
        fast_settings(),
        Arc::new(LoggingHandler),
    );

    session.handle.connect().await;
    assert!(session.handle.wait_for_state(SessionState::Connected, WAIT).await);

    session.shutdown.cancel();
    tokio::time::timeout(WAIT, session.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let status = session.handle.status();
    assert_eq!(status.state, SessionState::Closing);
    assert!(!status.scheduler_running);
    assert!(!status.has_connection);
    assert_eq!(connector.close_count(), 1);

    // Nothing is published or reconnected afterwards
    let published = connector.published().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connector.published().len(), published);
    assert_eq!(connector.connect_count(), 1);
    assert!(!session.handle.connect().await);
}
