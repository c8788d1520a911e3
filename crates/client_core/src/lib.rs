use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use media::{MediaDevices, MissingMediaDevices, MissingPeerConnector, PeerConnector};
use shared::{
    domain::{MessageId, MessageKind, ReactionSummary, UserId},
    protocol::{
        ClientEnvelope, ConversationSummary, MessagePayload, OutgoingMessage, ServerEnvelope,
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub mod call;
pub mod controller;
pub mod error;
pub mod http;
pub mod reconciler;
pub mod reconnect;
pub mod transport;

use call::{CallNotice, CallTimings};
use controller::CallController;
use error::ClientError;
use http::HttpClient;
use reconciler::{Confirmation, OptimisticReconciler, ReconcilerConfig, TimelineEntry};
use reconnect::{shutdown_requested, LinkEvent, ReconnectSupervisor};
use transport::{Connector, OutboundGate, WsConnector};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub reconnect_delay: Duration,
    pub reconciler: ReconcilerConfig,
    pub call: CallTimings,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnect_delay: Duration::from_secs(5),
            reconciler: ReconcilerConfig::default(),
            call: CallTimings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A speculative record was replaced by the server's copy.
    MessageConfirmed {
        temp_id: String,
        message: MessagePayload,
    },
    MessageReceived(MessagePayload),
    /// A speculative record was dropped because its message is already shown.
    PendingDiscarded {
        temp_id: String,
    },
    /// The transport refused the send; the speculative record was withdrawn.
    SendFailed {
        temp_id: String,
        to: UserId,
        reason: String,
    },
    SendExpired {
        temp_id: String,
        to: UserId,
    },
    MessageEdited {
        message_id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    ReactionsUpdated {
        message_id: MessageId,
        reactions: Vec<ReactionSummary>,
    },
    Typing {
        from: UserId,
    },
    Call(CallNotice),
}

pub struct RealtimeClient {
    config: ClientConfig,
    http: HttpClient,
    connector: Arc<dyn Connector>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnector>,
    gate: OutboundGate,
    inner: Mutex<Option<ActiveSession>>,
    events: broadcast::Sender<ClientEvent>,
}

struct ActiveSession {
    user_id: UserId,
    token: String,
    reconciler: Arc<Mutex<OptimisticReconciler>>,
    calls: CallController,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl RealtimeClient {
    /// A client with no media stack: chat works, calls fail with `UnsupportedTransport`.
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let connector = Arc::new(WsConnector::new(config.server_url.clone()));
        Self::new_with_dependencies(
            config,
            connector,
            Arc::new(MissingMediaDevices),
            Arc::new(MissingPeerConnector),
        )
    }

    pub fn new_with_dependencies(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: HttpClient::new(config.server_url.clone()),
            config,
            connector,
            devices,
            peers,
            gate: OutboundGate::new(),
            inner: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Starts the connection supervisor for `user_id`. A previous session is logged out first.
    pub async fn login(
        &self,
        user_id: UserId,
        token: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.logout().await;
        let token = token.into();

        let reconciler = Arc::new(Mutex::new(OptimisticReconciler::new(
            user_id,
            self.config.reconciler,
        )));
        let calls = CallController::spawn(
            user_id,
            self.config.call,
            Arc::clone(&self.devices),
            Arc::clone(&self.peers),
            self.gate.clone(),
            self.events.clone(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (link_tx, link_rx) = mpsc::channel(256);

        let supervisor = ReconnectSupervisor::new(
            Arc::clone(&self.connector),
            self.gate.clone(),
            self.config.reconnect_delay,
        );
        let supervisor = tokio::spawn(supervisor.run(
            user_id,
            token.clone(),
            link_tx,
            shutdown_rx.clone(),
        ));
        let dispatcher = tokio::spawn(dispatch_link_events(
            link_rx,
            Arc::clone(&reconciler),
            calls.clone(),
            self.events.clone(),
        ));
        let sweeper = tokio::spawn(sweep_pending(
            Arc::clone(&reconciler),
            self.config.reconciler.sweep_interval,
            self.events.clone(),
            shutdown_rx,
        ));

        info!(user_id = user_id.0, "session started");
        *self.inner.lock().await = Some(ActiveSession {
            user_id,
            token,
            reconciler,
            calls,
            shutdown,
            supervisor,
            background: vec![dispatcher, sweeper],
        });
        Ok(())
    }

    /// Ends the session. The supervisor does not reconnect after this.
    pub async fn logout(&self) {
        let Some(session) = self.inner.lock().await.take() else {
            return;
        };
        let _ = session.shutdown.send(true);
        session.calls.shutdown();
        let _ = session.supervisor.await;
        for task in session.background {
            task.abort();
        }
        self.gate.clear().await;
        info!(user_id = session.user_id.0, "session ended");
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.as_ref().map(|s| s.user_id)
    }

    pub async fn is_connected(&self) -> bool {
        self.gate.is_connected().await
    }

    pub async fn calls(&self) -> Result<CallController, ClientError> {
        Ok(self.session().await?.calls)
    }

    /// Renders `message` speculatively and submits it. Returns the correlation id.
    ///
    /// A send rejected by the transport is rolled back at once and reported as
    /// [`ClientEvent::SendFailed`]; the caller may retry.
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<String, ClientError> {
        let session = self.session().await?;
        let message = session
            .reconciler
            .lock()
            .await
            .begin_send(message, Instant::now());
        let temp_id = message.temp_id.clone().unwrap_or_default();
        let to = message.to;
        if let Err(err) = self.gate.send(ClientEnvelope::Message(message)).await {
            session.reconciler.lock().await.rollback(&temp_id);
            warn!(%temp_id, to = to.0, %err, "message send rejected");
            let _ = self.events.send(ClientEvent::SendFailed {
                temp_id,
                to,
                reason: err.to_string(),
            });
            return Err(err.into());
        }
        Ok(temp_id)
    }

    pub async fn send_text(&self, to: UserId, content: &str) -> Result<String, ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::Invalid("message content is empty".to_string()));
        }
        self.send_message(OutgoingMessage::text(to, content)).await
    }

    /// Uploads `bytes` and sends a message pointing at the stored file.
    pub async fn send_attachment(
        &self,
        to: UserId,
        kind: MessageKind,
        filename: &str,
        mime_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String, ClientError> {
        let session = self.session().await?;
        let uploaded = self
            .http
            .upload(&session.token, kind, filename, mime_type, bytes)
            .await?;
        self.send_message(OutgoingMessage {
            to,
            content: None,
            attachment: Some(uploaded.filename),
            message_type: kind,
            location_lat: None,
            location_lng: None,
            temp_id: None,
        })
        .await
    }

    /// Requests an edit of one of the viewer's own messages. The timeline
    /// changes when the server fans out `message_edited`.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::Invalid("edited content is empty".to_string()));
        }
        let session = self.session().await?;
        ensure_owned(&session, message_id).await?;
        self.gate
            .send(ClientEnvelope::EditMessage {
                message_id,
                content: content.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Requests deletion of one of the viewer's own messages. The record is
    /// dropped when the server fans out `message_deleted`.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), ClientError> {
        let session = self.session().await?;
        ensure_owned(&session, message_id).await?;
        self.gate
            .send(ClientEnvelope::DeleteMessage { message_id })
            .await?;
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        reaction_type: &str,
    ) -> Result<(), ClientError> {
        self.session().await?;
        self.gate
            .send(ClientEnvelope::AddReaction {
                message_id,
                reaction_type: reaction_type.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn remove_reaction(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.session().await?;
        self.gate
            .send(ClientEnvelope::RemoveReaction { message_id })
            .await?;
        Ok(())
    }

    pub async fn send_typing(&self, to: UserId) -> Result<(), ClientError> {
        self.session().await?;
        self.gate.send(ClientEnvelope::Typing { to }).await?;
        Ok(())
    }

    pub async fn timeline(&self, peer: UserId) -> Result<Vec<TimelineEntry>, ClientError> {
        let session = self.session().await?;
        let reconciler = session.reconciler.lock().await;
        Ok(reconciler.timeline(peer).to_vec())
    }

    /// Fetches a history page and merges it into the local timeline.
    pub async fn load_history(
        &self,
        peer: UserId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let session = self.session().await?;
        let messages = self
            .http
            .history(&session.token, peer, limit, offset)
            .await?;
        let added = session
            .reconciler
            .lock()
            .await
            .load_history(peer, messages.clone());
        debug!(peer = peer.0, added, "history merged");
        Ok(messages)
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let session = self.session().await?;
        self.http.conversations(&session.token).await
    }

    pub async fn download(&self, filename: &str) -> Result<Vec<u8>, ClientError> {
        let session = self.session().await?;
        self.http.download(&session.token, filename).await
    }

    async fn session(&self) -> Result<SessionHandle, ClientError> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|s| SessionHandle {
                token: s.token.clone(),
                reconciler: Arc::clone(&s.reconciler),
                calls: s.calls.clone(),
            })
            .ok_or(ClientError::NotLoggedIn)
    }
}

struct SessionHandle {
    token: String,
    reconciler: Arc<Mutex<OptimisticReconciler>>,
    calls: CallController,
}

async fn ensure_owned(session: &SessionHandle, message_id: MessageId) -> Result<(), ClientError> {
    if session.reconciler.lock().await.owns(message_id) {
        Ok(())
    } else {
        Err(ClientError::Invalid(format!(
            "message {message_id} is not one of yours"
        )))
    }
}

async fn dispatch_link_events(
    mut link_events: mpsc::Receiver<LinkEvent>,
    reconciler: Arc<Mutex<OptimisticReconciler>>,
    calls: CallController,
    events: broadcast::Sender<ClientEvent>,
) {
    while let Some(event) = link_events.recv().await {
        match event {
            LinkEvent::Connected => {
                let _ = events.send(ClientEvent::Connected);
            }
            LinkEvent::Disconnected => {
                let _ = events.send(ClientEvent::Disconnected);
            }
            LinkEvent::Envelope(envelope) => {
                if calls.deliver(&envelope) {
                    continue;
                }
                if let Some(event) = apply_envelope(&reconciler, envelope).await {
                    let _ = events.send(event);
                }
            }
        }
    }
}

async fn apply_envelope(
    reconciler: &Mutex<OptimisticReconciler>,
    envelope: ServerEnvelope,
) -> Option<ClientEvent> {
    let event = match envelope {
        ServerEnvelope::Connected { user_id } => {
            debug!(user_id = user_id.0, "server acknowledged connection");
            return None;
        }
        ServerEnvelope::Message(message) => {
            match reconciler.lock().await.apply_confirmed(message, Instant::now()) {
                Confirmation::Reconciled { temp_id, message } => {
                    ClientEvent::MessageConfirmed { temp_id, message }
                }
                Confirmation::Inserted(message) => ClientEvent::MessageReceived(message),
                Confirmation::Duplicate {
                    message_id,
                    released,
                } => {
                    debug!(message_id = message_id.0, "duplicate message ignored");
                    ClientEvent::PendingDiscarded {
                        temp_id: released?,
                    }
                }
            }
        }
        ServerEnvelope::MessageEdited {
            message_id,
            content,
            edited_at,
            ..
        } => {
            reconciler
                .lock()
                .await
                .apply_edit(message_id, &content, edited_at);
            ClientEvent::MessageEdited {
                message_id,
                content,
                edited_at,
            }
        }
        ServerEnvelope::MessageDeleted { message_id, .. } => {
            reconciler.lock().await.apply_delete(message_id);
            ClientEvent::MessageDeleted { message_id }
        }
        ServerEnvelope::ReactionUpdate {
            message_id,
            reactions,
            ..
        } => {
            reconciler
                .lock()
                .await
                .apply_reactions(message_id, reactions.clone());
            ClientEvent::ReactionsUpdated {
                message_id,
                reactions,
            }
        }
        ServerEnvelope::Typing { from } => ClientEvent::Typing { from },
        other => {
            debug!(kind = other.kind(), "envelope not handled by chat dispatch");
            return None;
        }
    };
    Some(event)
}

async fn sweep_pending(
    reconciler: Arc<Mutex<OptimisticReconciler>>,
    every: Duration,
    events: broadcast::Sender<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_requested(&mut shutdown) => return,
        }
        let expired = reconciler.lock().await.sweep(Instant::now());
        for pending in expired {
            warn!(temp_id = %pending.temp_id, to = pending.message.to.0, "message send expired");
            let _ = events.send(ClientEvent::SendExpired {
                temp_id: pending.temp_id,
                to: pending.message.to,
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
