//! Transfer integration tests
//!
//! Drives a full session against the loopback peripheral: connect, read the
//! password, send the framed payload, and check what the peripheral
//! reassembled.
//!
//! Run with: cargo test --test integration_transfer

use credlink_core::{
    LoopbackDevice, LoopbackFaults, Payload, SessionConfig, SessionError, TransferSession,
    TransferState,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn session_with(device: &LoopbackDevice, config: SessionConfig, payload: Payload) -> TransferSession {
    init_tracing();
    TransferSession::spawn(config, Arc::new(device.clone()), payload).expect("spawn session")
}

async fn connect_ready(session: &TransferSession) {
    session.connect().expect("connect");
    session.wait_ready(WAIT).await.expect("link ready");
}

#[tokio::test]
async fn test_three_hundred_chars_in_two_frames() {
    let device = LoopbackDevice::new("123456");
    let payload = Payload::new("A".repeat(300));
    let session = session_with(&device, SessionConfig::default(), payload.clone());

    connect_ready(&session).await;
    assert_eq!(
        session.wait_for_password(WAIT).await.expect("password"),
        "123456"
    );

    session.start_transfer().expect("start");
    let progress = session.wait_for_transfer(WAIT).await.expect("transfer");

    assert_eq!(progress.state, TransferState::Completed);
    assert_eq!(progress.cursor, 2);
    assert_eq!(progress.total_frames, 2);
    assert_eq!(session.snapshot().successful_write_count, 2);

    let written = device.written_frames();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0], format!("0/{}", "A".repeat(256)));
    assert_eq!(written[1], format!("1/{}/EOM", "A".repeat(44)));
    assert_eq!(device.received_payloads(), vec![payload.to_string()]);
}

#[tokio::test]
async fn test_empty_payload_sends_single_terminal_frame() {
    let device = LoopbackDevice::new("pw");
    let session = session_with(&device, SessionConfig::default(), Payload::new(""));

    connect_ready(&session).await;
    session.start_transfer().expect("start");
    let progress = session.wait_for_transfer(WAIT).await.expect("transfer");

    assert_eq!(progress.state, TransferState::Completed);
    assert_eq!(device.written_frames(), vec!["0//EOM".to_string()]);
    assert_eq!(device.received_payloads(), vec![String::new()]);
}

#[tokio::test]
async fn test_json_credential_round_trip() {
    let text = r#"{
        "issuer": {"name": "한양대학교", "id": "did:waff:TCSw+75WvYTptwNP8q5GxSjQ"},
        "credentialSubject": {"name": "전효진", "studentId": "2019000000"},
        "issuanceDate": "1705900000"
    }"#;
    let payload = Payload::from_json_str(text).expect("json");
    let device = LoopbackDevice::new("pw");
    let config = SessionConfig::default().with_max_body_size(16);
    let session = session_with(&device, config, payload.clone());

    connect_ready(&session).await;
    session.start_transfer().expect("start");
    let progress = session.wait_for_transfer(WAIT).await.expect("transfer");

    assert_eq!(progress.total_frames, payload.char_len().div_ceil(16));
    assert_eq!(device.received_payloads(), vec![payload.to_string()]);
}

#[tokio::test]
async fn test_duplicate_acknowledgements_are_ignored() {
    let device = LoopbackDevice::new("pw").with_faults(LoopbackFaults {
        duplicate_acks: true,
        ..Default::default()
    });
    let session = session_with(&device, SessionConfig::default(), Payload::new("A".repeat(600)));

    connect_ready(&session).await;
    session.start_transfer().expect("start");
    let progress = session.wait_for_transfer(WAIT).await.expect("transfer");

    assert_eq!(progress.state, TransferState::Completed);
    assert_eq!(session.snapshot().successful_write_count, 3);
    assert_eq!(device.written_frames().len(), 3);
}

#[tokio::test]
async fn test_lost_acknowledgement_stalls_transfer() {
    let device = LoopbackDevice::new("pw").with_faults(LoopbackFaults {
        drop_ack_for: Some(1),
        ..Default::default()
    });
    let session = session_with(&device, SessionConfig::default(), Payload::new("A".repeat(600)));

    connect_ready(&session).await;
    session.start_transfer().expect("start");

    let err = session
        .wait_for_transfer(Duration::from_millis(200))
        .await
        .expect_err("stalled");
    assert!(matches!(err, SessionError::Timeout("transfer")));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.transfer.state, TransferState::Sending { cursor: 1 });
    assert_eq!(snapshot.successful_write_count, 1);
    assert_eq!(device.written_frames().len(), 2);
}

#[tokio::test]
async fn test_write_permission_denied_aborts() {
    let device = LoopbackDevice::new("pw").with_faults(LoopbackFaults {
        deny_writes: true,
        ..Default::default()
    });
    let session = session_with(&device, SessionConfig::default(), Payload::new("hello"));

    connect_ready(&session).await;
    session.start_transfer().expect("start");

    let err = session.wait_for_transfer(WAIT).await.expect_err("aborted");
    assert!(matches!(err, SessionError::TransferAborted(0)));
    assert!(device.written_frames().is_empty());
}

#[tokio::test]
async fn test_transfer_can_be_sent_again_after_reset() {
    let device = LoopbackDevice::new("pw");
    let session = session_with(&device, SessionConfig::default(), Payload::new("again"));

    connect_ready(&session).await;
    session.start_transfer().expect("start");
    session.wait_for_transfer(WAIT).await.expect("first");

    session.reset_transfer().expect("reset");
    session.start_transfer().expect("restart");
    session.wait_for_transfer(WAIT).await.expect("second");

    assert_eq!(
        device.received_payloads(),
        vec!["again".to_string(), "again".to_string()]
    );
    assert_eq!(session.snapshot().successful_write_count, 2);
}

#[tokio::test]
async fn test_with_response_writes() {
    let device = LoopbackDevice::new("pw");
    let config = SessionConfig::default()
        .with_write_type(credlink_core::WriteType::WithResponse)
        .with_max_body_size(4);
    let session = session_with(&device, config, Payload::new("abcdefghij"));

    connect_ready(&session).await;
    session.start_transfer().expect("start");
    session.wait_for_transfer(WAIT).await.expect("transfer");

    assert_eq!(
        device.written_frames(),
        vec!["0/abcd", "1/efgh", "2/ij/EOM"]
    );
}
