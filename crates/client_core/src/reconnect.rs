use std::{sync::Arc, time::Duration};

use shared::{domain::UserId, protocol::ServerEnvelope};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::transport::{Connector, Link, OutboundGate};

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Envelope(ServerEnvelope),
    Disconnected,
}

/// Keeps one identity connected until logout.
///
/// Each established link is installed into the [`OutboundGate`] for as long as
/// it lives. After a drop (or a failed connect) the supervisor waits
/// `delay` and dials again; logout is signalled through the watch channel.
pub struct ReconnectSupervisor {
    connector: Arc<dyn Connector>,
    gate: OutboundGate,
    delay: Duration,
}

impl ReconnectSupervisor {
    pub fn new(connector: Arc<dyn Connector>, gate: OutboundGate, delay: Duration) -> Self {
        Self {
            connector,
            gate,
            delay,
        }
    }

    pub async fn run(
        self,
        user_id: UserId,
        token: String,
        events: mpsc::Sender<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let connected = tokio::select! {
                result = self.connector.connect(user_id, &token) => result,
                _ = shutdown_requested(&mut shutdown) => return,
            };

            match connected {
                Ok(link) => {
                    info!(user_id = user_id.0, attempt, "connected");
                    attempt = 0;
                    if self.pump(link, &events, &mut shutdown).await {
                        return;
                    }
                    warn!(user_id = user_id.0, "connection lost");
                }
                Err(err) => warn!(user_id = user_id.0, attempt, %err, "connect failed"),
            }

            info!(
                user_id = user_id.0,
                delay_ms = self.delay.as_millis() as u64,
                "reconnecting after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = shutdown_requested(&mut shutdown) => return,
            }
        }
    }

    /// Forwards one link's envelopes. Returns true when the session is over.
    async fn pump(
        &self,
        link: Link,
        events: &mpsc::Sender<LinkEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let Link {
            outbound,
            mut inbound,
        } = link;
        self.gate.install(outbound).await;

        let mut stopped = events.send(LinkEvent::Connected).await.is_err();
        while !stopped {
            tokio::select! {
                next = inbound.recv() => match next {
                    Some(envelope) => {
                        stopped = events.send(LinkEvent::Envelope(envelope)).await.is_err();
                    }
                    None => break,
                },
                _ = shutdown_requested(shutdown) => stopped = true,
            }
        }

        self.gate.clear().await;
        let _ = events.send(LinkEvent::Disconnected).await;
        stopped
    }
}

/// Resolves once logout was requested or the session owner went away.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
