use anyhow::Result;
use clap::Parser;
use client_core::{ClientConfig, ClientEvent, RealtimeClient};
use shared::domain::UserId;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    token: String,
    /// Peer to message once connected.
    #[arg(long)]
    to: Option<i64>,
    #[arg(long, requires = "to")]
    text: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let client = RealtimeClient::new(ClientConfig::new(args.server_url));
    let mut events = client.subscribe_events();
    client.login(UserId(args.user_id), args.token).await?;

    let mut outgoing = args.to.map(UserId).zip(args.text);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::Connected) => {
                    info!("connected");
                    match client.conversations().await {
                        Ok(conversations) => {
                            for c in conversations {
                                println!(
                                    "{} ({}): {} [{} unread]",
                                    c.username, c.user_id.0, c.last_message, c.unread_count
                                );
                            }
                        }
                        Err(err) => warn!(%err, "could not list conversations"),
                    }
                    flush_outgoing(&client, &mut outgoing).await;
                }
                Ok(ClientEvent::MessageReceived(message)) => {
                    println!(
                        "{}: {}",
                        message.sender.username,
                        message.content.as_deref().unwrap_or("<attachment>")
                    );
                }
                Ok(event) => println!("{event:?}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.logout().await;
    Ok(())
}

/// Sends the queued message. A failed send stays queued for the next connect.
async fn flush_outgoing(client: &RealtimeClient, outgoing: &mut Option<(UserId, String)>) {
    let Some((to, text)) = outgoing.take() else {
        return;
    };
    match client.send_text(to, &text).await {
        Ok(temp_id) => info!(%temp_id, to = to.0, "message sent"),
        Err(err) => {
            warn!(%err, to = to.0, "message not sent; retrying after reconnect");
            *outgoing = Some((to, text));
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
