use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{domain::UserId, error::ProtocolError, protocol::ServerEnvelope};
use tracing::{debug, error, info, warn};

use crate::{app_state::AppState, auth::require_identity, registry::Outbound};

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    #[serde(default)]
    token: String,
}

/// `GET /ws/{user_id}?token=..`: the credential is checked before the upgrade.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Query(q): Query<WsQuery>,
) -> Response {
    let user = match require_identity(&state, &q.token, UserId(user_id)).await {
        Ok(user) => user,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, user.id))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (handle, mut outbound_rx) = state.registry.open(user_id, state.outbound_queue);
    let handle = state.registry.bind(handle).await;
    let _ = handle.send(ServerEnvelope::Connected { user_id });

    let (mut sink, mut stream) = socket.split();
    let connection_id = handle.id();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                Outbound::Envelope(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(err) => {
                            error!(kind = envelope.kind(), %err, "failed to encode envelope");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = handle.closed() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                state.router.route_frame(user_id, &text).await;
            }
            Some(Ok(Message::Binary(_))) => {
                let error = ProtocolError::UnsupportedFrame("binary");
                warn!(user_id = user_id.0, %error, "dropping frame");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(user_id = user_id.0, %err, "websocket receive failed");
                break;
            }
        }
    }

    handle.close();
    state.registry.unbind(user_id, connection_id).await;
    drop(handle);
    let _ = writer.await;
    info!(user_id = user_id.0, connection_id, "connection closed");
}
