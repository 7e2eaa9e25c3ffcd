mod common;

use common::*;
use dispenser_link::protocol::MAX_INBOUND_SIZE;
use dispenser_link::router::CommandReply;
use dispenser_link::session::SessionSettings;
use serde_json::json;

const DISCOVERY: &str = "fido/dispensers/discovery";

#[test]
fn test_dispense_with_nested_data() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    session.transport_mut().deliver(
        &topic("commands"),
        br#"{"command":"dispense","data":{"amount":50}}"#,
    );
    session.tick(1_000, true);

    assert_eq!(
        calls.borrow().as_slice(),
        &[("dispense".to_string(), json!({"amount": 50}))]
    );

    let responses = session.transport().published_on(&topic("response"));
    assert_eq!(responses.len(), 1);
    let response = responses[0].json();
    assert_eq!(response["deviceId"], DEVICE_ID);
    assert_eq!(response["command"], "dispense");
    assert_eq!(response["result"], "received");
    assert_eq!(response["message"], "");
    assert_eq!(response["timestamp"], 1_000);
    assert!(response.get("type").is_none());
    assert!(!responses[0].retained);

    assert_eq!(session.stats().commands_dispatched, 1);
    assert_eq!(session.stats().acks_sent, 1);
}

#[test]
fn test_action_field_with_flat_payload() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    session
        .transport_mut()
        .deliver(&topic("commands"), br#"{"action":"dispense","amount":150}"#);
    session.tick(500, true);

    assert_eq!(
        calls.borrow().as_slice(),
        &[(
            "dispense".to_string(),
            json!({"action": "dispense", "amount": 150})
        )]
    );
    assert_eq!(session.transport().published_on(&topic("response")).len(), 1);
}

#[test]
fn test_connect_answered_by_handler_only() {
    let (handler, calls) = RecordingHandler::new();
    let handler = handler.replying("connect", CommandReply::new("success", "Dispenser paired"));
    let mut session = connected_session(Box::new(handler));

    session.transport_mut().deliver(
        &topic("commands"),
        br#"{"action":"connect","password":"FIDO2025"}"#,
    );
    session.tick(700, true);

    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(calls.borrow()[0].1["password"], "FIDO2025");

    let responses = session.transport().published_on(&topic("response"));
    assert_eq!(responses.len(), 1, "connect is never acknowledged");
    let reply = responses[0].json();
    assert_eq!(reply["command"], "connect");
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["message"], "Dispenser paired");
    assert_eq!(session.stats().acks_sent, 0);
}

#[test]
fn test_reply_precedes_acknowledgment() {
    let (handler, _calls) = RecordingHandler::new();
    let handler = handler.replying(
        "sync_schedules",
        CommandReply::new("success", "3 schedules").with_kind("schedules"),
    );
    let mut session = connected_session(Box::new(handler));

    session
        .transport_mut()
        .deliver(&topic("commands"), br#"{"action":"sync_schedules","schedules":[1,2,3]}"#);
    session.tick(100, true);

    let responses = session.transport().published_on(&topic("response"));
    assert_eq!(responses.len(), 2);
    let reply = responses[0].json();
    assert_eq!(reply["result"], "success");
    assert_eq!(reply["type"], "schedules");
    assert_eq!(responses[1].json()["result"], "received");
}

#[test]
fn test_malformed_json_is_discarded() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    session
        .transport_mut()
        .deliver(&topic("commands"), br#"{"command":"dispense","data":"#);
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    assert!(session.transport().published.is_empty());
    assert_eq!(session.stats().decode_errors, 1);
    assert!(session.is_connected());
}

#[test]
fn test_oversized_frame_is_discarded() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    let padding = "x".repeat(MAX_INBOUND_SIZE);
    let frame = format!(r#"{{"command":"dispense","note":"{}"}}"#, padding);
    session
        .transport_mut()
        .deliver(&topic("commands"), frame.as_bytes());
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    assert!(session.transport().published.is_empty());
    assert_eq!(session.stats().decode_errors, 1);
}

#[test]
fn test_non_object_frame_is_discarded() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    session
        .transport_mut()
        .deliver(&topic("commands"), b"[\"dispense\"]");
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    assert!(session.transport().published.is_empty());
}

#[test]
fn test_missing_name_acknowledged_by_default() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    session
        .transport_mut()
        .deliver(&topic("commands"), br#"{"amount":50}"#);
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    let responses = session.transport().published_on(&topic("response"));
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].json()["command"], "");
    assert_eq!(responses[0].json()["result"], "received");
}

#[test]
fn test_missing_name_ack_suppressed_when_configured() {
    let settings = SessionSettings {
        ack_empty_commands: false,
        ..SessionSettings::default()
    };
    let (handler, calls) = RecordingHandler::new();
    let mut session = session_with(RecordingTransport::auto_ack(), settings)
        .with_command_handler(Box::new(handler));
    session.tick(0, true);
    session.transport_mut().published.clear();

    session
        .transport_mut()
        .deliver(&topic("commands"), br#"{"amount":50}"#);
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    assert!(session.transport().published.is_empty());
}

#[test]
fn test_discover_request_republishes_discovery() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    session
        .transport_mut()
        .deliver(DISCOVERY, br#"{"action":"discover"}"#);
    session.tick(2_500, true);

    assert!(calls.borrow().is_empty());
    let published = &session.transport().published;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, DISCOVERY);
    assert!(published[0].retained);
    let discovery = published[0].json();
    assert_eq!(discovery["isAvailable"], true);
    assert_eq!(discovery["timestamp"], 2_500);
}

#[test]
fn test_own_discovery_echo_ignored() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    let echo = json!({
        "deviceId": DEVICE_ID,
        "name": "FIDO_Dispenser",
        "type": "smart_dispenser",
        "isAvailable": true
    })
    .to_string();
    session.transport_mut().deliver(DISCOVERY, echo.as_bytes());
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    assert!(session.transport().published.is_empty());
}

#[test]
fn test_commands_for_other_devices_ignored() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    session.transport_mut().deliver(
        "fido/dispensers/FIDO_AAAAAAAAAAAA/commands",
        br#"{"command":"dispense"}"#,
    );
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    assert!(session.transport().published.is_empty());
}

#[test]
fn test_message_before_connack_dropped() {
    let (handler, calls) = RecordingHandler::new();
    let mut session =
        session(RecordingTransport::default()).with_command_handler(Box::new(handler));
    session.tick(0, true);

    session
        .transport_mut()
        .deliver(&topic("commands"), br#"{"command":"dispense"}"#);
    session.tick(100, true);

    assert!(calls.borrow().is_empty());
    assert_eq!(session.stats().messages_received, 1);
}

#[test]
fn test_burst_processed_over_ticks() {
    let (handler, calls) = RecordingHandler::new();
    let mut session = connected_session(Box::new(handler));

    for amount in 0..40 {
        let frame = json!({"command": "dispense", "data": {"amount": amount}}).to_string();
        session
            .transport_mut()
            .deliver(&topic("commands"), frame.as_bytes());
    }

    session.tick(100, true);
    assert!(calls.borrow().len() < 40);
    session.tick(200, true);
    session.tick(300, true);

    assert_eq!(calls.borrow().len(), 40);
    let amounts: Vec<i64> = calls
        .borrow()
        .iter()
        .filter_map(|(_, payload)| payload["amount"].as_i64())
        .collect();
    assert_eq!(amounts, (0..40).collect::<Vec<_>>());
}
