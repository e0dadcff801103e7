//! Host and presenter control over real WebSocket connections.

mod common;

use std::time::Duration;

use collab_core::{Diagram, Role};
use serde_json::json;

use common::{
    alice, bob, carol, connect, expect_silence, recv_close, recv_json, recv_until_type,
    send_json, TestServer, WsStream,
};

/// WebSocket policy-violation close code.
const POLICY_CLOSE: u16 = 1008;

async fn server() -> TestServer {
    let server = TestServer::start().await;
    server.seed(Diagram::new("d1", "Data flows").in_threat_model("tm1"));
    server.authz().grant("tm1", "alice-id", Role::Owner);
    server.authz().grant("tm1", "bob-id", Role::Writer);
    server.authz().grant("tm1", "carol-id", Role::Reader);
    server
}

async fn join(server: &TestServer, user: &collab_core::User) -> WsStream {
    let mut ws = connect(&server.ws_url("tm1", "d1"), user).await;
    recv_until_type(&mut ws, "participants_update", 3).await;
    ws
}

#[tokio::test]
async fn test_presenter_handoff_and_cursor_relay() {
    let server = server().await;
    let mut host = join(&server, &alice()).await;
    let mut b = join(&server, &bob()).await;
    let mut c = join(&server, &carol()).await;
    recv_until_type(&mut host, "participants_update", 3).await;
    recv_until_type(&mut host, "participants_update", 3).await;
    recv_until_type(&mut b, "participants_update", 3).await;

    send_json(&mut b, &json!({"message_type": "presenter_request"})).await;
    let request = recv_until_type(&mut host, "presenter_request_event", 5).await;
    assert_eq!(request["requesting_user"]["provider_id"], "bob-id");

    send_json(
        &mut host,
        &json!({
            "message_type": "change_presenter_request",
            "new_presenter": {"provider_id": "bob-id", "email": "BOB@example.com"}
        }),
    )
    .await;
    let update = recv_until_type(&mut c, "participants_update", 5).await;
    assert_eq!(update["current_presenter"]["provider_id"], "bob-id");
    assert_eq!(update["host"]["provider_id"], "alice-id");

    send_json(
        &mut b,
        &json!({"message_type": "presenter_cursor", "cursor_position": {"x": 10.5, "y": 20.0}}),
    )
    .await;
    let cursor = recv_until_type(&mut c, "presenter_cursor", 5).await;
    assert_eq!(cursor["cursor_position"]["x"], 10.5);

    // The host no longer presents, so its cursor is dropped.
    send_json(
        &mut host,
        &json!({"message_type": "presenter_cursor", "cursor_position": {"x": 1.0, "y": 1.0}}),
    )
    .await;
    expect_silence(&mut c, Duration::from_millis(200)).await;

    send_json(
        &mut b,
        &json!({"message_type": "presenter_selection", "selected_cells": ["n1", "n2"]}),
    )
    .await;
    let selection = recv_until_type(&mut host, "presenter_selection", 5).await;
    assert_eq!(selection["selected_cells"], json!(["n1", "n2"]));

    server.shutdown().await;
}

#[tokio::test]
async fn test_presenter_reverts_to_host_when_presenter_leaves() {
    let server = server().await;
    let mut host = join(&server, &alice()).await;
    let mut b = join(&server, &bob()).await;
    recv_until_type(&mut host, "participants_update", 3).await;

    send_json(
        &mut host,
        &json!({"message_type": "change_presenter_request", "new_presenter": {"provider_id": "bob-id"}}),
    )
    .await;
    let update = recv_until_type(&mut host, "participants_update", 5).await;
    assert_eq!(update["current_presenter"]["provider_id"], "bob-id");

    b.close(None).await.expect("close");
    let update = recv_until_type(&mut host, "participants_update", 5).await;
    assert_eq!(update["current_presenter"]["provider_id"], "alice-id");
    assert_eq!(update["participants"].as_array().map(Vec::len), Some(1));

    server.shutdown().await;
}

#[tokio::test]
async fn test_host_only_commands_refused_for_participants() {
    let server = server().await;
    let _host = join(&server, &alice()).await;
    let mut b = join(&server, &bob()).await;

    send_json(
        &mut b,
        &json!({"message_type": "change_presenter_request", "new_presenter": {"provider_id": "bob-id"}}),
    )
    .await;
    let error = recv_until_type(&mut b, "error", 5).await;
    assert_eq!(error["error"], "unauthorized");
    assert_eq!(error["message"], "Only the host can change the presenter");

    send_json(
        &mut b,
        &json!({"message_type": "remove_participant_request", "removed_user": {"provider_id": "alice-id"}}),
    )
    .await;
    let error = recv_until_type(&mut b, "error", 5).await;
    assert_eq!(error["error"], "unauthorized");

    server.shutdown().await;
}

#[tokio::test]
async fn test_presenter_denied_reaches_requester() {
    let server = server().await;
    let mut host = join(&server, &alice()).await;
    let mut b = join(&server, &bob()).await;

    send_json(
        &mut host,
        &json!({"message_type": "presenter_denied_request", "denied_user": {"provider_id": "bob-id"}}),
    )
    .await;
    let denied = recv_until_type(&mut b, "presenter_denied_event", 5).await;
    assert_eq!(denied["denied_user"]["provider_id"], "bob-id");

    send_json(
        &mut host,
        &json!({
            "message_type": "presenter_denied_request",
            "denied_user": {"provider_id": "bob-id", "email": "someone-else@example.com"}
        }),
    )
    .await;
    let error = recv_until_type(&mut host, "error", 5).await;
    assert_eq!(error["error"], "invalid_request");

    server.shutdown().await;
}

#[tokio::test]
async fn test_removed_participant_cannot_rejoin() {
    let server = server().await;
    let mut host = join(&server, &alice()).await;
    let mut b = join(&server, &bob()).await;
    recv_until_type(&mut host, "participants_update", 3).await;

    send_json(
        &mut host,
        &json!({"message_type": "remove_participant_request", "removed_user": {"email": "bob@example.com"}}),
    )
    .await;
    assert_eq!(recv_close(&mut b).await, Some(POLICY_CLOSE));

    let update = recv_until_type(&mut host, "participants_update", 5).await;
    assert_eq!(update["participants"].as_array().map(Vec::len), Some(1));

    let mut again = connect(&server.ws_url("tm1", "d1"), &bob()).await;
    let refusal = recv_json(&mut again).await;
    assert_eq!(refusal["message_type"], "error");
    assert_eq!(refusal["error"], "access_denied");
    assert_eq!(recv_close(&mut again).await, Some(POLICY_CLOSE));

    send_json(
        &mut host,
        &json!({"message_type": "remove_participant_request", "removed_user": {"provider_id": "alice-id"}}),
    )
    .await;
    let error = recv_until_type(&mut host, "error", 5).await;
    assert_eq!(error["error"], "invalid_request");

    server.shutdown().await;
}
