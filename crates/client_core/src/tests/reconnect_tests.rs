use super::*;
use async_trait::async_trait;
use shared::protocol::ClientEnvelope;
use std::sync::Mutex;

use crate::error::TransportError;

/// Server ends of the links handed out by [`ScriptedConnector`].
struct ServerSide {
    to_client: mpsc::Sender<ServerEnvelope>,
    from_client: mpsc::Receiver<ClientEnvelope>,
}

struct ScriptedConnector {
    script: Mutex<Vec<bool>>,
    attempts: Mutex<Vec<tokio::time::Instant>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _user_id: UserId, _token: &str) -> Result<Link, TransportError> {
        self.attempts
            .lock()
            .expect("attempts")
            .push(tokio::time::Instant::now());
        let succeed = {
            let mut script = self.script.lock().expect("script");
            if script.is_empty() {
                true
            } else {
                script.remove(0)
            }
        };
        if !succeed {
            return Err(TransportError::NotConnected);
        }
        let (outbound, from_client) = mpsc::channel(8);
        let (to_client, inbound) = mpsc::channel(8);
        let _ = self.servers.send(ServerSide {
            to_client,
            from_client,
        });
        Ok(Link { outbound, inbound })
    }
}

fn scripted(script: Vec<bool>) -> (Arc<ScriptedConnector>, mpsc::UnboundedReceiver<ServerSide>) {
    let (servers, server_rx) = mpsc::unbounded_channel();
    (
        Arc::new(ScriptedConnector {
            script: Mutex::new(script),
            attempts: Mutex::new(Vec::new()),
            servers,
        }),
        server_rx,
    )
}

#[tokio::test(start_paused = true)]
async fn supervisor_retries_after_delay_and_forwards_envelopes() {
    let (connector, mut servers) = scripted(vec![false, true]);
    let gate = OutboundGate::new();
    let (events_tx, mut events) = mpsc::channel(16);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let supervisor = ReconnectSupervisor::new(
        connector.clone(),
        gate.clone(),
        Duration::from_secs(5),
    );
    let task = tokio::spawn(supervisor.run(UserId(1), "token".to_string(), events_tx, shutdown_rx));

    assert_eq!(events.recv().await, Some(LinkEvent::Connected));
    {
        let attempts = connector.attempts.lock().expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].duration_since(attempts[0]) >= Duration::from_secs(5));
    }

    let mut server = servers.recv().await.expect("server side");
    server
        .to_client
        .send(ServerEnvelope::Typing { from: UserId(2) })
        .await
        .expect("deliver");
    assert_eq!(
        events.recv().await,
        Some(LinkEvent::Envelope(ServerEnvelope::Typing { from: UserId(2) }))
    );

    gate.send(ClientEnvelope::Typing { to: UserId(2) })
        .await
        .expect("gate open");
    assert_eq!(
        server.from_client.recv().await,
        Some(ClientEnvelope::Typing { to: UserId(2) })
    );

    shutdown.send(true).expect("shutdown");
    assert_eq!(events.recv().await, Some(LinkEvent::Disconnected));
    task.await.expect("supervisor exits");
    assert!(!gate.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn dropped_link_closes_gate_then_reconnects() {
    let (connector, mut servers) = scripted(Vec::new());
    let gate = OutboundGate::new();
    let (events_tx, mut events) = mpsc::channel(16);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let supervisor = ReconnectSupervisor::new(
        connector.clone(),
        gate.clone(),
        Duration::from_secs(5),
    );
    let task = tokio::spawn(supervisor.run(UserId(1), "token".to_string(), events_tx, shutdown_rx));

    assert_eq!(events.recv().await, Some(LinkEvent::Connected));
    let first = servers.recv().await.expect("first link");
    drop(first);

    assert_eq!(events.recv().await, Some(LinkEvent::Disconnected));
    let err = gate
        .send(ClientEnvelope::Typing { to: UserId(2) })
        .await
        .expect_err("rejected while disconnected");
    assert!(matches!(err, TransportError::NotConnected));

    assert_eq!(events.recv().await, Some(LinkEvent::Connected));
    let _second = servers.recv().await.expect("second link");
    assert_eq!(connector.attempts.lock().expect("attempts").len(), 2);
    assert!(gate.is_connected().await);

    shutdown.send(true).expect("shutdown");
    task.await.expect("supervisor exits");
}

#[tokio::test(start_paused = true)]
async fn logout_during_backoff_stops_reconnecting() {
    let (connector, _servers) = scripted(vec![false, false, false]);
    let gate = OutboundGate::new();
    let (events_tx, _events) = mpsc::channel(16);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let supervisor = ReconnectSupervisor::new(
        connector.clone(),
        gate,
        Duration::from_secs(5),
    );
    let task = tokio::spawn(supervisor.run(UserId(1), "token".to_string(), events_tx, shutdown_rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.send(true).expect("shutdown");
    task.await.expect("supervisor exits");
    assert_eq!(connector.attempts.lock().expect("attempts").len(), 1);
}
