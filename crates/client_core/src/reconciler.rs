//! Speculative local records for outgoing messages.
//!
//! A message is rendered as [`TimelineEntry::Pending`] as soon as it is
//! submitted and swapped in place for the server's confirmed record once the
//! echo arrives. Confirmed ids are tracked so a record is never rendered twice.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, ReactionSummary, UserId},
    protocol::{MessagePayload, OutgoingMessage},
};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub expiry: Duration,
    pub sweep_interval: Duration,
    /// Content match for echoes without a correlation id. `None` disables it.
    pub fallback_window: Option<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            fallback_window: Some(Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub temp_id: String,
    pub message: OutgoingMessage,
    pub created_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Pending(PendingMessage),
    Confirmed(MessagePayload),
}

impl TimelineEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self, TimelineEntry::Pending(_))
    }

    fn temp_id(&self) -> Option<&str> {
        match self {
            TimelineEntry::Pending(pending) => Some(&pending.temp_id),
            TimelineEntry::Confirmed(_) => None,
        }
    }

    fn confirmed_mut(&mut self, id: MessageId) -> Option<&mut MessagePayload> {
        match self {
            TimelineEntry::Confirmed(message) if message.id == id => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// The echo replaced the speculative record `temp_id`.
    Reconciled {
        temp_id: String,
        message: MessagePayload,
    },
    /// A message not sent from this session (relayed, or sent elsewhere).
    Inserted(MessagePayload),
    /// Already rendered. `released` names a speculative record that was
    /// dropped because it matched the duplicate.
    Duplicate {
        message_id: MessageId,
        released: Option<String>,
    },
}

pub struct OptimisticReconciler {
    viewer: UserId,
    config: ReconcilerConfig,
    timelines: HashMap<UserId, Vec<TimelineEntry>>,
    pending_peers: HashMap<String, UserId>,
    confirmed: HashSet<MessageId>,
}

impl OptimisticReconciler {
    pub fn new(viewer: UserId, config: ReconcilerConfig) -> Self {
        Self {
            viewer,
            config,
            timelines: HashMap::new(),
            pending_peers: HashMap::new(),
            confirmed: HashSet::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn timeline(&self, peer: UserId) -> &[TimelineEntry] {
        self.timelines.get(&peer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pending_count(&self) -> usize {
        self.pending_peers.len()
    }

    /// Whether `message_id` is a rendered message sent by the viewer.
    pub fn owns(&self, message_id: MessageId) -> bool {
        self.timelines
            .values()
            .flatten()
            .any(|entry| match entry {
                TimelineEntry::Confirmed(message) => {
                    message.id == message_id && message.sender_id == self.viewer
                }
                TimelineEntry::Pending(_) => false,
            })
    }

    /// Tags `message` with a fresh correlation id and renders it speculatively.
    pub fn begin_send(&mut self, mut message: OutgoingMessage, now: Instant) -> OutgoingMessage {
        let temp_id = format!("temp_{}", Uuid::new_v4().simple());
        message.temp_id = Some(temp_id.clone());
        self.pending_peers.insert(temp_id.clone(), message.to);
        self.timelines
            .entry(message.to)
            .or_default()
            .push(TimelineEntry::Pending(PendingMessage {
                temp_id,
                message: message.clone(),
                created_at: now,
            }));
        message
    }

    pub fn apply_confirmed(&mut self, message: MessagePayload, now: Instant) -> Confirmation {
        let released = self.match_pending(&message, now);

        if self.confirmed.contains(&message.id) {
            if let Some(temp_id) = &released {
                self.remove_pending(temp_id);
            }
            return Confirmation::Duplicate {
                message_id: message.id,
                released,
            };
        }
        self.confirmed.insert(message.id);

        if let Some(temp_id) = released {
            if let Some(peer) = self.pending_peers.remove(&temp_id) {
                let entries = self.timelines.entry(peer).or_default();
                if let Some(slot) = entries
                    .iter_mut()
                    .find(|entry| entry.temp_id() == Some(temp_id.as_str()))
                {
                    *slot = TimelineEntry::Confirmed(message.clone());
                    return Confirmation::Reconciled { temp_id, message };
                }
            }
        }

        let peer = message.peer_of(self.viewer);
        self.timelines
            .entry(peer)
            .or_default()
            .push(TimelineEntry::Confirmed(message.clone()));
        Confirmation::Inserted(message)
    }

    /// Merges a history page; already rendered ids are skipped.
    pub fn load_history(&mut self, peer: UserId, messages: Vec<MessagePayload>) -> usize {
        let entries = self.timelines.entry(peer).or_default();
        let (mut confirmed, pending): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|entry| !entry.is_pending());

        let mut added = 0;
        for message in messages {
            if self.confirmed.insert(message.id) {
                confirmed.push(TimelineEntry::Confirmed(message));
                added += 1;
            }
        }
        confirmed.sort_by_key(|entry| match entry {
            TimelineEntry::Confirmed(message) => message.id,
            TimelineEntry::Pending(_) => MessageId(i64::MAX),
        });
        entries.extend(confirmed);
        entries.extend(pending);
        added
    }

    pub fn apply_edit(
        &mut self,
        message_id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> bool {
        match self.find_confirmed_mut(message_id) {
            Some(message) => {
                message.content = Some(content.to_string());
                message.edited_at = Some(edited_at);
                true
            }
            None => false,
        }
    }

    pub fn apply_reactions(
        &mut self,
        message_id: MessageId,
        reactions: Vec<ReactionSummary>,
    ) -> bool {
        match self.find_confirmed_mut(message_id) {
            Some(message) => {
                message.reactions = reactions;
                true
            }
            None => false,
        }
    }

    /// The id stays known so a late echo cannot bring the message back.
    pub fn apply_delete(&mut self, message_id: MessageId) -> bool {
        let mut removed = false;
        for entries in self.timelines.values_mut() {
            let before = entries.len();
            entries.retain(|entry| {
                !matches!(entry, TimelineEntry::Confirmed(message) if message.id == message_id)
            });
            removed |= entries.len() != before;
        }
        self.confirmed.insert(message_id);
        removed
    }

    /// Withdraws a speculative record whose send never left this client.
    pub fn rollback(&mut self, temp_id: &str) -> Option<PendingMessage> {
        self.remove_pending(temp_id)
    }

    /// Drops speculative records older than the expiry, oldest first.
    pub fn sweep(&mut self, now: Instant) -> Vec<PendingMessage> {
        let expiry = self.config.expiry;
        let mut expired = Vec::new();
        for entries in self.timelines.values_mut() {
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                match entry {
                    TimelineEntry::Pending(pending)
                        if now.saturating_duration_since(pending.created_at) >= expiry =>
                    {
                        expired.push(pending)
                    }
                    other => kept.push(other),
                }
            }
            *entries = kept;
        }
        for pending in &expired {
            self.pending_peers.remove(&pending.temp_id);
        }
        expired.sort_by_key(|pending| pending.created_at);
        expired
    }

    /// An echo that names a `temp_id` is matched by that id only. An unknown
    /// id gets no content fallback.
    fn match_pending(&self, message: &MessagePayload, now: Instant) -> Option<String> {
        if message.sender_id != self.viewer {
            return None;
        }
        if let Some(temp_id) = &message.temp_id {
            return self
                .pending_peers
                .contains_key(temp_id)
                .then(|| temp_id.clone());
        }
        let window = self.config.fallback_window?;
        self.timeline(message.receiver_id)
            .iter()
            .filter_map(|entry| match entry {
                TimelineEntry::Pending(pending) => Some(pending),
                TimelineEntry::Confirmed(_) => None,
            })
            .find(|pending| {
                now.saturating_duration_since(pending.created_at) <= window
                    && pending.message.content == message.content
                    && pending.message.attachment == message.attachment
                    && pending.message.message_type == message.message_type
            })
            .map(|pending| pending.temp_id.clone())
    }

    fn remove_pending(&mut self, temp_id: &str) -> Option<PendingMessage> {
        let peer = self.pending_peers.remove(temp_id)?;
        let entries = self.timelines.get_mut(&peer)?;
        let index = entries
            .iter()
            .position(|entry| entry.temp_id() == Some(temp_id))?;
        match entries.remove(index) {
            TimelineEntry::Pending(pending) => Some(pending),
            TimelineEntry::Confirmed(_) => None,
        }
    }

    fn find_confirmed_mut(&mut self, message_id: MessageId) -> Option<&mut MessagePayload> {
        self.timelines
            .values_mut()
            .flat_map(|entries| entries.iter_mut())
            .find_map(|entry| entry.confirmed_mut(message_id))
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
