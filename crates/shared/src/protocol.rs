use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{CallKind, MessageId, MessageKind, ReactionSummary, UserId, UserSummary},
    error::ProtocolError,
};

/// Session description exchanged during negotiation.
///
/// Serialises as `{"type": "offer", "sdp": "..."}`. On input a JSON string holding
/// that object is accepted too, since some peers send the description pre-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Deserialize)]
struct SessionDescriptionObject {
    #[serde(rename = "type")]
    kind: SdpKind,
    sdp: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SessionDescriptionWire {
    Object(SessionDescriptionObject),
    Encoded(String),
}

impl<'de> Deserialize<'de> for SessionDescription {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let object = match SessionDescriptionWire::deserialize(deserializer)? {
            SessionDescriptionWire::Object(object) => object,
            SessionDescriptionWire::Encoded(raw) => {
                serde_json::from_str::<SessionDescriptionObject>(&raw)
                    .map_err(serde::de::Error::custom)?
            }
        };
        Ok(Self {
            kind: object.kind,
            sdp: object.sdp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub to: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl OutgoingMessage {
    pub fn text(to: UserId, content: impl Into<String>) -> Self {
        Self {
            to,
            content: Some(content.into()),
            attachment: None,
            message_type: MessageKind::Text,
            location_lat: None,
            location_lng: None,
            temp_id: None,
        }
    }
}

/// Envelopes a client submits over the persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Message(OutgoingMessage),
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    AddReaction {
        message_id: MessageId,
        reaction_type: String,
    },
    RemoveReaction {
        message_id: MessageId,
    },
    Typing {
        to: UserId,
    },
    CallRequest {
        to: UserId,
        #[serde(default)]
        call_type: CallKind,
    },
    CallAccept {
        to: UserId,
    },
    CallReject {
        to: UserId,
    },
    #[serde(rename = "incoming_call", alias = "call_offer")]
    CallOffer {
        to: UserId,
        sdp: SessionDescription,
        #[serde(default)]
        call_type: CallKind,
    },
    CallAnswer {
        to: UserId,
        sdp: SessionDescription,
    },
    IceCandidate {
        to: UserId,
        candidate: IceCandidate,
    },
    CallEnd {
        to: UserId,
    },
}

impl ClientEnvelope {
    /// Parses and validates one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_str(text)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::Message(_) => "message",
            ClientEnvelope::EditMessage { .. } => "edit_message",
            ClientEnvelope::DeleteMessage { .. } => "delete_message",
            ClientEnvelope::AddReaction { .. } => "add_reaction",
            ClientEnvelope::RemoveReaction { .. } => "remove_reaction",
            ClientEnvelope::Typing { .. } => "typing",
            ClientEnvelope::CallRequest { .. } => "call_request",
            ClientEnvelope::CallAccept { .. } => "call_accept",
            ClientEnvelope::CallReject { .. } => "call_reject",
            ClientEnvelope::CallOffer { .. } => "incoming_call",
            ClientEnvelope::CallAnswer { .. } => "call_answer",
            ClientEnvelope::IceCandidate { .. } => "ice_candidate",
            ClientEnvelope::CallEnd { .. } => "call_end",
        }
    }

    /// Checks the field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let kind = self.kind();
        match self {
            ClientEnvelope::EditMessage { content, .. } if content.trim().is_empty() => {
                Err(ProtocolError::MissingField {
                    kind,
                    field: "content",
                })
            }
            ClientEnvelope::AddReaction { reaction_type, .. }
                if reaction_type.trim().is_empty() =>
            {
                Err(ProtocolError::MissingField {
                    kind,
                    field: "reaction_type",
                })
            }
            ClientEnvelope::CallOffer { sdp, .. } | ClientEnvelope::CallAnswer { sdp, .. }
                if sdp.sdp.trim().is_empty() =>
            {
                Err(ProtocolError::MissingField { kind, field: "sdp" })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_lng: Option<f64>,
    pub sender: UserSummary,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    /// Set on the live relay and echo; absent from history pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionSummary>,
}

impl MessagePayload {
    /// The other participant of the conversation, seen from `viewer`.
    pub fn peer_of(&self, viewer: UserId) -> UserId {
        if self.sender_id == viewer {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// Envelopes the server delivers to a bound connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Connected {
        user_id: UserId,
    },
    Message(MessagePayload),
    ReactionUpdate {
        message_id: MessageId,
        reactions: Vec<ReactionSummary>,
        from: UserId,
        sender_id: UserId,
        receiver_id: UserId,
    },
    MessageEdited {
        message_id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
        from: UserId,
        sender_id: UserId,
        receiver_id: UserId,
    },
    MessageDeleted {
        message_id: MessageId,
        from: UserId,
        sender_id: UserId,
        receiver_id: UserId,
    },
    Typing {
        from: UserId,
    },
    CallRequest {
        from: UserId,
        call_type: CallKind,
        caller: UserSummary,
    },
    CallAccept {
        from: UserId,
    },
    CallReject {
        from: UserId,
    },
    #[serde(rename = "incoming_call", alias = "call_offer")]
    CallOffer {
        from: UserId,
        call_type: CallKind,
        caller: UserSummary,
        sdp: SessionDescription,
    },
    CallAnswer {
        from: UserId,
        sdp: SessionDescription,
    },
    IceCandidate {
        from: UserId,
        candidate: IceCandidate,
    },
    CallEnd {
        from: UserId,
    },
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::Connected { .. } => "connected",
            ServerEnvelope::Message(_) => "message",
            ServerEnvelope::ReactionUpdate { .. } => "reaction_update",
            ServerEnvelope::MessageEdited { .. } => "message_edited",
            ServerEnvelope::MessageDeleted { .. } => "message_deleted",
            ServerEnvelope::Typing { .. } => "typing",
            ServerEnvelope::CallRequest { .. } => "call_request",
            ServerEnvelope::CallAccept { .. } => "call_accept",
            ServerEnvelope::CallReject { .. } => "call_reject",
            ServerEnvelope::CallOffer { .. } => "incoming_call",
            ServerEnvelope::CallAnswer { .. } => "call_answer",
            ServerEnvelope::IceCandidate { .. } => "ice_candidate",
            ServerEnvelope::CallEnd { .. } => "call_end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub last_message: String,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
    pub url: String,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
