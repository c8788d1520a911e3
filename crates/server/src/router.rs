use server_api::{handle_envelope, ApiContext};
use shared::{domain::UserId, protocol::ClientEnvelope};
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;

/// Applies client envelopes through the API layer and relays the results to
/// whichever recipients are currently bound.
#[derive(Clone)]
pub struct MessageRouter {
    api: ApiContext,
    registry: ConnectionRegistry,
}

impl MessageRouter {
    pub fn new(api: ApiContext, registry: ConnectionRegistry) -> Self {
        Self { api, registry }
    }

    /// Decodes one text frame and routes it. Malformed frames are logged and dropped.
    pub async fn route_frame(&self, sender: UserId, text: &str) -> usize {
        match ClientEnvelope::decode(text) {
            Ok(envelope) => self.route(sender, envelope).await,
            Err(error) => {
                warn!(user_id = sender.0, %error, "dropping malformed envelope");
                0
            }
        }
    }

    /// Returns how many deliveries reached a live connection.
    pub async fn route(&self, sender: UserId, envelope: ClientEnvelope) -> usize {
        let kind = envelope.kind();
        let deliveries = match handle_envelope(&self.api, sender, envelope).await {
            Ok(deliveries) => deliveries,
            Err(error) => {
                warn!(
                    user_id = sender.0,
                    kind,
                    code = ?error.code,
                    message = %error.message,
                    "envelope rejected"
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for delivery in deliveries {
            let Some(connection) = self.registry.lookup(delivery.to).await else {
                debug!(
                    user_id = sender.0,
                    recipient = delivery.to.0,
                    kind = delivery.envelope.kind(),
                    "recipient offline; relay skipped"
                );
                continue;
            };
            match connection.send(delivery.envelope) {
                Ok(()) => delivered += 1,
                Err(error) => debug!(
                    recipient = delivery.to.0,
                    ?error,
                    "relay to closing connection failed"
                ),
            }
        }
        delivered
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
