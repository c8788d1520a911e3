use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientEnvelope, ServerEnvelope},
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};
use url::Url;

use crate::error::TransportError;

/// One established connection: envelopes in, envelopes out.
///
/// Dropping `outbound` closes the socket; `inbound` yields `None` once the
/// server side is gone.
pub struct Link {
    pub outbound: mpsc::Sender<ClientEnvelope>,
    pub inbound: mpsc::Receiver<ServerEnvelope>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, user_id: UserId, token: &str) -> Result<Link, TransportError>;
}

pub struct WsConnector {
    server_url: String,
    queue: usize,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            queue: 256,
        }
    }
}

pub fn websocket_url(
    server_url: &str,
    user_id: UserId,
    token: &str,
) -> Result<Url, TransportError> {
    let invalid = || TransportError::InvalidUrl(server_url.to_string());
    let mut url = Url::parse(server_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|()| invalid())?;
    url.path_segments_mut()
        .map_err(|()| invalid())?
        .pop_if_empty()
        .push("ws")
        .push(&user_id.to_string());
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, user_id: UserId, token: &str) -> Result<Link, TransportError> {
        let url = websocket_url(&self.server_url, user_id, token)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEnvelope>(self.queue);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerEnvelope>(self.queue);

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        error!(kind = envelope.kind(), %err, "failed to encode envelope");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    debug!(%err, "websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEnvelope>(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "dropping malformed server envelope"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// The single place outbound envelopes go through.
///
/// Holds the sender of the live link, if any. While disconnected every send
/// fails with [`TransportError::NotConnected`]; nothing is queued.
#[derive(Clone, Default)]
pub struct OutboundGate {
    slot: Arc<RwLock<Option<mpsc::Sender<ClientEnvelope>>>>,
}

impl OutboundGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_connected(&self) -> bool {
        self.slot
            .read()
            .await
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    pub async fn send(&self, envelope: ClientEnvelope) -> Result<(), TransportError> {
        let guard = self.slot.read().await;
        let sender = guard.as_ref().ok_or(TransportError::NotConnected)?;
        sender.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    pub(crate) async fn install(&self, sender: mpsc::Sender<ClientEnvelope>) {
        *self.slot.write().await = Some(sender);
    }

    pub(crate) async fn clear(&self) {
        self.slot.write().await.take();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
