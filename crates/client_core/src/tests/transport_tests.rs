use super::*;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Path, Query, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::oneshot};

#[test]
fn websocket_url_swaps_scheme_and_appends_identity() {
    let url = websocket_url("http://localhost:8443", UserId(7), "abc").expect("url");
    assert_eq!(url.as_str(), "ws://localhost:8443/ws/7?token=abc");

    let url = websocket_url("https://chat.example.com/api/", UserId(7), "a b").expect("url");
    assert_eq!(url.as_str(), "wss://chat.example.com/api/ws/7?token=a+b");
}

#[test]
fn websocket_url_rejects_other_schemes() {
    let err = websocket_url("ftp://localhost", UserId(1), "t").expect_err("bad scheme");
    assert!(matches!(err, TransportError::InvalidUrl(_)));
    let err = websocket_url("not a url", UserId(1), "t").expect_err("bad url");
    assert!(matches!(err, TransportError::InvalidUrl(_)));
}

#[tokio::test]
async fn gate_rejects_sends_while_disconnected() {
    let gate = OutboundGate::new();
    assert!(!gate.is_connected().await);
    let err = gate
        .send(ClientEnvelope::Typing { to: UserId(2) })
        .await
        .expect_err("no link");
    assert!(matches!(err, TransportError::NotConnected));

    let (tx, mut rx) = mpsc::channel(1);
    gate.install(tx).await;
    assert!(gate.is_connected().await);
    gate.send(ClientEnvelope::Typing { to: UserId(2) })
        .await
        .expect("send");
    let err = gate
        .send(ClientEnvelope::Typing { to: UserId(3) })
        .await
        .expect_err("queue full");
    assert!(matches!(err, TransportError::QueueFull));
    assert_eq!(rx.recv().await, Some(ClientEnvelope::Typing { to: UserId(2) }));

    drop(rx);
    let err = gate
        .send(ClientEnvelope::Typing { to: UserId(2) })
        .await
        .expect_err("link closed");
    assert!(matches!(err, TransportError::NotConnected));

    gate.clear().await;
    assert!(!gate.is_connected().await);
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

#[derive(Clone)]
struct FakeServer {
    received: Arc<tokio::sync::Mutex<Option<oneshot::Sender<(i64, String, String)>>>>,
}

async fn fake_ws(
    ws: WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<FakeServer>,
    Path(user_id): Path<i64>,
    Query(query): Query<TokenQuery>,
) -> Response {
    ws.on_upgrade(move |socket| fake_session(socket, state, user_id, query.token))
}

async fn fake_session(mut socket: WebSocket, state: FakeServer, user_id: i64, token: String) {
    let _ = socket
        .send(AxumMessage::Text(format!(
            r#"{{"type":"connected","user_id":{user_id}}}"#
        )))
        .await;
    let _ = socket
        .send(AxumMessage::Text("{not json".to_string()))
        .await;
    let _ = socket
        .send(AxumMessage::Text(r#"{"type":"typing","from":2}"#.to_string()))
        .await;
    while let Some(Ok(frame)) = socket.recv().await {
        if let AxumMessage::Text(text) = frame {
            if let Some(tx) = state.received.lock().await.take() {
                let _ = tx.send((user_id, token.clone(), text));
            }
        }
    }
}

#[tokio::test]
async fn ws_connector_exchanges_envelopes_and_skips_malformed_frames() {
    let (tx, rx) = oneshot::channel();
    let state = FakeServer {
        received: Arc::new(tokio::sync::Mutex::new(Some(tx))),
    };
    let app = Router::new()
        .route("/ws/:user_id", get(fake_ws))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let connector = WsConnector::new(format!("http://{addr}"));
    let mut link = connector.connect(UserId(1), "secret").await.expect("connect");

    assert_eq!(
        link.inbound.recv().await,
        Some(ServerEnvelope::Connected { user_id: UserId(1) })
    );
    assert_eq!(
        link.inbound.recv().await,
        Some(ServerEnvelope::Typing { from: UserId(2) })
    );

    link.outbound
        .send(ClientEnvelope::Typing { to: UserId(2) })
        .await
        .expect("queue");
    let (user_id, token, text) = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
        .await
        .expect("in time")
        .expect("frame");
    assert_eq!(user_id, 1);
    assert_eq!(token, "secret");
    assert_eq!(
        serde_json::from_str::<ClientEnvelope>(&text).expect("envelope"),
        ClientEnvelope::Typing { to: UserId(2) }
    );

    drop(link.outbound);
    let closed = tokio::time::timeout(std::time::Duration::from_secs(5), link.inbound.recv())
        .await
        .expect("closed in time");
    assert_eq!(closed, None);
}

#[tokio::test]
async fn ws_connector_reports_refused_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let connector = WsConnector::new(format!("http://{addr}"));
    let err = connector
        .connect(UserId(1), "secret")
        .await
        .err()
        .expect("refused");
    assert!(matches!(err, TransportError::Connect(_)));
}
