use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::time::timeout;

use courier_api::{
    Delivery, ErrorKind, INVALID_ENCODING_ATTR, Subscription, SubscriptionProbe,
};
use courier_broker_pubsub::{CONSUME_PERMISSION, PubSubClient, PubSubConfig};

// ═══════════════════════════════════════════════════════════════
//  Mock Pub/Sub server
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct MockState {
    pulls: VecDeque<Value>,
    pull_status: Option<u16>,
    acks: Vec<String>,
    nacks: Vec<String>,
    extensions: Vec<(String, u64)>,
    granted: Vec<String>,
    auth_headers: Vec<String>,
    token_status: Option<u16>,
    token_fetches: usize,
    calls: Vec<String>,
}

type Shared = Arc<Mutex<MockState>>;

fn ack_ids(body: &Value) -> Vec<String> {
    body["ackIds"]
        .as_array()
        .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

async fn subscription_action(
    State(state): State<Shared>,
    Path((project, sub_action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let mut s = state.lock().unwrap();
    if let Some(v) = headers.get("authorization") {
        s.auth_headers.push(v.to_str().unwrap().to_string());
    }
    let Some((subscription, action)) = sub_action.split_once(':') else {
        return (StatusCode::NOT_FOUND, "{}".into());
    };
    s.calls.push(format!("{project}/{subscription}:{action}"));
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    match action {
        "pull" => {
            if let Some(code) = s.pull_status {
                let status = StatusCode::from_u16(code).unwrap();
                return (status, r#"{"error":{"message":"denied"}}"#.into());
            }
            let resp = s.pulls.pop_front().unwrap_or_else(|| json!({}));
            (StatusCode::OK, resp.to_string())
        }
        "acknowledge" => {
            s.acks.extend(ack_ids(&body));
            (StatusCode::OK, "{}".into())
        }
        "modifyAckDeadline" => {
            match body["ackDeadlineSeconds"].as_u64().unwrap_or(0) {
                0 => s.nacks.extend(ack_ids(&body)),
                secs => s.extensions.extend(ack_ids(&body).into_iter().map(|id| (id, secs))),
            }
            (StatusCode::OK, "{}".into())
        }
        "testIamPermissions" => {
            let granted: Vec<&String> = body["permissions"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|p| p.as_str())
                .filter_map(|p| s.granted.iter().find(|g| *g == p))
                .collect();
            (StatusCode::OK, json!({ "permissions": granted }).to_string())
        }
        _ => (StatusCode::NOT_FOUND, "{}".into()),
    }
}

async fn metadata_token(State(state): State<Shared>) -> (StatusCode, String) {
    let mut s = state.lock().unwrap();
    s.token_fetches += 1;
    if let Some(code) = s.token_status {
        return (StatusCode::from_u16(code).unwrap(), "busy".into());
    }
    let body = json!({"access_token": "meta-token", "expires_in": 3600, "token_type": "Bearer"});
    (StatusCode::OK, body.to_string())
}

async fn start(state: Shared) -> String {
    let app = Router::new()
        .route(
            "/v1/projects/{project}/subscriptions/{sub_action}",
            post(subscription_action),
        )
        .route("/token", get(metadata_token))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

fn config(base: &str) -> PubSubConfig {
    PubSubConfig {
        project: "acme".into(),
        subscription: "orders".into(),
        endpoint: Some(base.into()),
        access_token: Some("test-token".into()),
        empty_pull_pause_ms: 10,
        ..Default::default()
    }
}

fn received(ack_id: &str, id: &str, data: &str) -> Value {
    json!({"ackId": ack_id, "message": {"data": data, "messageId": id}})
}

fn extended(state: &Shared) -> Vec<String> {
    let s = state.lock().unwrap();
    let mut ids: Vec<String> = s.extensions.iter().map(|(id, _)| id.clone()).collect();
    ids.sort();
    ids.dedup();
    ids
}

async fn wait_for_extensions(state: &Shared, expected: &[&str]) {
    timeout(Duration::from_secs(5), async {
        while extended(state) != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout");
}

async fn next(sub: &mut impl Subscription) -> Result<Delivery, courier_api::CourierError> {
    timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timeout")
        .map(|d| d.expect("pub/sub feed never ends"))
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn pulls_decodes_and_acks() {
    let state = Shared::default();
    state.lock().unwrap().pulls.push_back(json!({
        "receivedMessages": [{
            "ackId": "ack-1",
            "message": {
                "data": "aGVsbG8=",
                "messageId": "m-1",
                "attributes": {"origin": "billing"},
                "publishTime": "2024-05-01T10:00:00Z"
            },
            "deliveryAttempt": 2
        }]
    }));
    let base = start(state.clone()).await;

    let client = PubSubClient::new(&config(&base)).unwrap();
    let mut sub = client.subscribe();
    assert_eq!(sub.name(), "projects/acme/subscriptions/orders");

    let d = next(&mut sub).await.unwrap();
    assert_eq!(d.message.id, "m-1");
    assert_eq!(d.message.payload, b"hello");
    assert_eq!(d.message.delivery_attempt, 2);
    assert_eq!(d.message.attributes["origin"], "billing");
    assert_eq!(d.message.publish_time.as_deref(), Some("2024-05-01T10:00:00Z"));

    d.acker.ack().await.unwrap();

    let s = state.lock().unwrap();
    assert_eq!(s.acks, vec!["ack-1"]);
    assert_eq!(s.calls, vec!["acme/orders:pull", "acme/orders:acknowledge"]);
    assert!(s.auth_headers.iter().all(|h| h == "Bearer test-token"));
}

#[tokio::test]
async fn undecodable_data_is_flagged_not_dropped() {
    let state = Shared::default();
    state.lock().unwrap().pulls.push_back(json!({
        "receivedMessages": [received("ack-1", "bad-1", "%%% not base64")]
    }));
    let base = start(state.clone()).await;

    let mut sub = PubSubClient::new(&config(&base)).unwrap().subscribe();
    let d = next(&mut sub).await.unwrap();
    assert_eq!(d.message.id, "bad-1");
    assert_eq!(d.message.payload, b"%%% not base64");
    assert_eq!(d.message.attributes[INVALID_ENCODING_ATTR], "base64");
}

#[tokio::test]
async fn empty_pulls_are_retried() {
    let state = Shared::default();
    {
        let mut s = state.lock().unwrap();
        s.pulls.push_back(json!({}));
        s.pulls.push_back(json!({"receivedMessages": []}));
        s.pulls.push_back(json!({"receivedMessages": [received("ack-1", "m-1", "eA==")]}));
    }
    let base = start(state.clone()).await;

    let mut sub = PubSubClient::new(&config(&base)).unwrap().subscribe();
    let d = next(&mut sub).await.unwrap();
    assert_eq!(d.message.id, "m-1");
    assert_eq!(state.lock().unwrap().calls.len(), 3);
}

#[tokio::test]
async fn http_errors_are_classified() {
    for (status, kind) in [(403, ErrorKind::Auth), (404, ErrorKind::Config), (503, ErrorKind::Io)] {
        let state = Shared::default();
        state.lock().unwrap().pull_status = Some(status);
        let base = start(state).await;

        let mut sub = PubSubClient::new(&config(&base)).unwrap().subscribe();
        let err = next(&mut sub).await.unwrap_err();
        assert_eq!(err.kind, kind, "status {status}");
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_transient() {
    let mut sub = PubSubClient::new(&config("http://127.0.0.1:1"))
        .unwrap()
        .subscribe();
    let err = next(&mut sub).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn close_returns_buffered_deliveries() {
    let state = Shared::default();
    state.lock().unwrap().pulls.push_back(json!({
        "receivedMessages": [
            received("ack-1", "m-1", "YQ=="),
            received("ack-2", "m-2", "Yg=="),
            received("ack-3", "m-3", "Yw==")
        ]
    }));
    let base = start(state.clone()).await;

    let mut sub = PubSubClient::new(&config(&base)).unwrap().subscribe();
    let first = next(&mut sub).await.unwrap();
    assert_eq!(first.message.id, "m-1");

    sub.close().await.unwrap();

    let s = state.lock().unwrap();
    assert_eq!(s.nacks, vec!["ack-2", "ack-3"]);
    assert!(s.acks.is_empty());
}

#[tokio::test]
async fn permissions_probe_reports_granted_subset() {
    let state = Shared::default();
    state.lock().unwrap().granted = vec![CONSUME_PERMISSION.to_string()];
    let base = start(state).await;

    let client = PubSubClient::new(&config(&base)).unwrap();
    let granted = client
        .test_permissions(&[CONSUME_PERMISSION, "pubsub.subscriptions.delete"])
        .await
        .unwrap();
    assert_eq!(granted, vec![CONSUME_PERMISSION]);
}

#[tokio::test]
async fn metadata_token_is_fetched_once_and_reused() {
    let state = Shared::default();
    state.lock().unwrap().granted = vec![CONSUME_PERMISSION.to_string()];
    let base = start(state.clone()).await;

    let client = PubSubClient::new(&PubSubConfig {
        access_token: None,
        metadata_url: format!("{base}/token"),
        ..config(&base)
    })
    .unwrap();

    for _ in 0..3 {
        client.test_permissions(&[CONSUME_PERMISSION]).await.unwrap();
    }

    let s = state.lock().unwrap();
    assert_eq!(s.token_fetches, 1);
    assert_eq!(s.auth_headers.len(), 3);
    assert!(s.auth_headers.iter().all(|h| h == "Bearer meta-token"));
}

#[tokio::test]
async fn emulator_sends_no_credentials() {
    let state = Shared::default();
    state.lock().unwrap().pulls.push_back(json!({
        "receivedMessages": [received("ack-1", "m-1", "eA==")]
    }));
    let base = start(state.clone()).await;

    let client = PubSubClient::new(&PubSubConfig {
        project: "acme".into(),
        subscription: "orders".into(),
        emulator_host: Some(base.trim_start_matches("http://").to_string()),
        ..Default::default()
    })
    .unwrap();
    let mut sub = client.subscribe();
    next(&mut sub).await.unwrap();

    assert!(state.lock().unwrap().auth_headers.is_empty());
}

#[tokio::test]
async fn metadata_server_outage_is_transient() {
    let state = Shared::default();
    state.lock().unwrap().token_status = Some(503);
    let base = start(state.clone()).await;

    let client = PubSubClient::new(&PubSubConfig {
        access_token: None,
        metadata_url: format!("{base}/token"),
        ..config(&base)
    })
    .unwrap();
    let mut sub = client.subscribe();

    let err = next(&mut sub).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Io);
    assert!(err.is_transient());
    assert!(state.lock().unwrap().calls.is_empty(), "pulled without a token");

    // a rejected credential is still fatal
    state.lock().unwrap().token_status = Some(403);
    let err = next(&mut sub).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Auth);
    assert!(err.is_infrastructure());

    // and the next pull recovers once the server answers again
    {
        let mut s = state.lock().unwrap();
        s.token_status = None;
        s.pulls.push_back(json!({"receivedMessages": [received("ack-1", "m-1", "eA==")]}));
    }
    assert_eq!(next(&mut sub).await.unwrap().message.id, "m-1");
}

#[tokio::test]
async fn leases_are_extended_until_settled() {
    let state = Shared::default();
    state.lock().unwrap().pulls.push_back(json!({
        "receivedMessages": [
            received("ack-1", "m-1", "YQ=="),
            received("ack-2", "m-2", "Yg=="),
            received("ack-3", "m-3", "Yw==")
        ]
    }));
    let base = start(state.clone()).await;

    let mut sub = PubSubClient::new(&PubSubConfig {
        ack_deadline_secs: 30,
        lease_renew_interval_ms: 20,
        ..config(&base)
    })
    .unwrap()
    .subscribe();

    // two with a handler, one still buffered: all three stay leased
    let acked = next(&mut sub).await.unwrap();
    let dropped = next(&mut sub).await.unwrap();
    wait_for_extensions(&state, &["ack-1", "ack-2", "ack-3"]).await;
    assert!(state.lock().unwrap().extensions.iter().all(|(_, secs)| *secs == 30));

    acked.acker.ack().await.unwrap();
    drop(dropped);
    tokio::time::sleep(Duration::from_millis(60)).await;
    state.lock().unwrap().extensions.clear();
    wait_for_extensions(&state, &["ack-3"]).await;

    // returned to the subscription: no longer ours to extend
    sub.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    state.lock().unwrap().extensions.clear();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(extended(&state).is_empty());

    let s = state.lock().unwrap();
    assert_eq!(s.acks, vec!["ack-1"]);
    assert_eq!(s.nacks, vec!["ack-3"]);
}
