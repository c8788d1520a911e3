use std::collections::HashMap;

use chrono::Utc;
use shared::{
    domain::{MessageId, MessageKind, ReactionSummary, UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{
        ClientEnvelope, ConversationSummary, MessagePayload, OutgoingMessage, ServerEnvelope,
        UploadResponse,
    },
};
use storage::{Storage, StoredFile, StoredMessage};
use tracing::debug;

pub mod auth;

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// One envelope addressed to one bound identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: UserId,
    pub envelope: ServerEnvelope,
}

impl Delivery {
    fn new(to: UserId, envelope: ServerEnvelope) -> Self {
        Self { to, envelope }
    }
}

/// Applies one validated client envelope and returns what must be delivered, in order.
///
/// Actions against unknown, deleted or foreign messages are no-ops and yield no deliveries.
pub async fn handle_envelope(
    ctx: &ApiContext,
    sender: UserId,
    envelope: ClientEnvelope,
) -> Result<Vec<Delivery>, ApiError> {
    match envelope {
        ClientEnvelope::Message(message) => send_message(ctx, sender, message).await,
        ClientEnvelope::EditMessage {
            message_id,
            content,
        } => edit_message(ctx, sender, message_id, &content).await,
        ClientEnvelope::DeleteMessage { message_id } => {
            delete_message(ctx, sender, message_id).await
        }
        ClientEnvelope::AddReaction {
            message_id,
            reaction_type,
        } => react(ctx, sender, message_id, Some(&reaction_type)).await,
        ClientEnvelope::RemoveReaction { message_id } => {
            react(ctx, sender, message_id, None).await
        }
        ClientEnvelope::Typing { to } => Ok(vec![Delivery::new(
            to,
            ServerEnvelope::Typing { from: sender },
        )]),
        ClientEnvelope::CallRequest { to, call_type } => {
            let caller = user_summary(ctx, sender).await?;
            Ok(vec![Delivery::new(
                to,
                ServerEnvelope::CallRequest {
                    from: sender,
                    call_type,
                    caller,
                },
            )])
        }
        ClientEnvelope::CallOffer { to, sdp, call_type } => {
            let caller = user_summary(ctx, sender).await?;
            Ok(vec![Delivery::new(
                to,
                ServerEnvelope::CallOffer {
                    from: sender,
                    call_type,
                    caller,
                    sdp,
                },
            )])
        }
        ClientEnvelope::CallAccept { to } => Ok(vec![Delivery::new(
            to,
            ServerEnvelope::CallAccept { from: sender },
        )]),
        ClientEnvelope::CallReject { to } => Ok(vec![Delivery::new(
            to,
            ServerEnvelope::CallReject { from: sender },
        )]),
        ClientEnvelope::CallAnswer { to, sdp } => Ok(vec![Delivery::new(
            to,
            ServerEnvelope::CallAnswer { from: sender, sdp },
        )]),
        ClientEnvelope::IceCandidate { to, candidate } => Ok(vec![Delivery::new(
            to,
            ServerEnvelope::IceCandidate {
                from: sender,
                candidate,
            },
        )]),
        ClientEnvelope::CallEnd { to } => Ok(vec![Delivery::new(
            to,
            ServerEnvelope::CallEnd { from: sender },
        )]),
    }
}

async fn send_message(
    ctx: &ApiContext,
    sender: UserId,
    message: OutgoingMessage,
) -> Result<Vec<Delivery>, ApiError> {
    let has_content = message
        .content
        .as_deref()
        .is_some_and(|content| !content.trim().is_empty());
    let has_location = message.location_lat.is_some() && message.location_lng.is_some();
    if !has_content && message.attachment.is_none() && !has_location {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message has no content, attachment or location",
        ));
    }
    if message.message_type.carries_upload() && message.attachment.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{} message requires an attachment", message.message_type.as_str()),
        ));
    }

    let recipient = ctx
        .storage
        .load_user(message.to)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "recipient not found"))?;
    let sender_summary = user_summary(ctx, sender).await?;

    let stored = ctx
        .storage
        .insert_message(sender, &message)
        .await
        .map_err(internal)?;
    let mut payload = message_payload(stored, sender_summary, message.temp_id, Vec::new());
    payload.from = Some(sender);
    let envelope = ServerEnvelope::Message(payload);

    let mut deliveries = vec![Delivery::new(recipient.id, envelope.clone())];
    if recipient.id != sender {
        deliveries.push(Delivery::new(sender, envelope));
    }
    Ok(deliveries)
}

async fn edit_message(
    ctx: &ApiContext,
    sender: UserId,
    message_id: MessageId,
    content: &str,
) -> Result<Vec<Delivery>, ApiError> {
    let Some(message) = owned_live_message(ctx, sender, message_id).await? else {
        return Ok(Vec::new());
    };
    let edited_at = ctx
        .storage
        .edit_message(message_id, content)
        .await
        .map_err(internal)?;
    let envelope = ServerEnvelope::MessageEdited {
        message_id,
        content: content.to_string(),
        edited_at,
        from: sender,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
    };
    Ok(fan_out(&message, envelope))
}

async fn delete_message(
    ctx: &ApiContext,
    sender: UserId,
    message_id: MessageId,
) -> Result<Vec<Delivery>, ApiError> {
    let Some(message) = owned_live_message(ctx, sender, message_id).await? else {
        return Ok(Vec::new());
    };
    ctx.storage
        .soft_delete_message(message_id)
        .await
        .map_err(internal)?;
    let envelope = ServerEnvelope::MessageDeleted {
        message_id,
        from: sender,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
    };
    Ok(fan_out(&message, envelope))
}

async fn react(
    ctx: &ApiContext,
    sender: UserId,
    message_id: MessageId,
    reaction_type: Option<&str>,
) -> Result<Vec<Delivery>, ApiError> {
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?;
    let Some(message) = message.filter(|m| !m.is_deleted && m.involves(sender)) else {
        debug!(
            user_id = sender.0,
            message_id = message_id.0,
            "reaction ignored: message missing or not visible to user"
        );
        return Ok(Vec::new());
    };

    match reaction_type {
        Some(reaction_type) => {
            ctx.storage
                .toggle_reaction(message_id, sender, reaction_type)
                .await
                .map_err(internal)?;
        }
        None => {
            let removed = ctx
                .storage
                .remove_reaction(message_id, sender)
                .await
                .map_err(internal)?;
            if !removed {
                return Ok(Vec::new());
            }
        }
    }

    let reactions = ctx
        .storage
        .list_reactions(message_id)
        .await
        .map_err(internal)?;
    let envelope = ServerEnvelope::ReactionUpdate {
        message_id,
        reactions,
        from: sender,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
    };
    Ok(fan_out(&message, envelope))
}

/// Chronological page of the conversation with `peer_id`; marks what the viewer received as read.
pub async fn history(
    ctx: &ApiContext,
    viewer: UserId,
    peer_id: UserId,
    limit: Option<u32>,
    offset: Option<u32>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let peer = ctx
        .storage
        .load_user(peer_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))?;
    let viewer_summary = user_summary(ctx, viewer).await?;

    let limit = limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let messages = ctx
        .storage
        .list_conversation(viewer, peer.id, limit, offset.unwrap_or(0))
        .await
        .map_err(internal)?;

    let mut senders: HashMap<UserId, UserSummary> = HashMap::new();
    senders.insert(viewer, viewer_summary);
    senders.insert(peer.id, peer.summary());

    let unread: Vec<MessageId> = messages
        .iter()
        .filter(|m| m.receiver_id == viewer && !m.is_read)
        .map(|m| m.id)
        .collect();

    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let reactions = ctx
            .storage
            .list_reactions(message.id)
            .await
            .map_err(internal)?;
        let sender = senders
            .get(&message.sender_id)
            .cloned()
            .unwrap_or_else(|| UserSummary::bare(message.sender_id, String::new()));
        payloads.push(message_payload(message, sender, None, reactions));
    }

    if !unread.is_empty() {
        ctx.storage
            .mark_read(viewer, &unread)
            .await
            .map_err(internal)?;
    }
    Ok(payloads)
}

pub async fn conversations(
    ctx: &ApiContext,
    viewer: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations(viewer)
        .await
        .map_err(internal)?;
    Ok(conversations
        .into_iter()
        .map(|conversation| ConversationSummary {
            user_id: conversation.peer.id,
            username: conversation.peer.username,
            profile_pic: conversation.peer.profile_pic,
            first_name: conversation.peer.first_name,
            last_name: conversation.peer.last_name,
            last_message: conversation.last_message.preview(),
            last_message_time: conversation.last_message.created_at,
            unread_count: conversation.unread_count,
        })
        .collect())
}

/// Allowed file extensions for an uploaded attachment of the given kind.
pub fn allowed_extensions(kind: MessageKind) -> &'static [&'static str] {
    match kind {
        MessageKind::Image => &[".jpg", ".jpeg", ".png", ".gif"],
        MessageKind::Video | MessageKind::CircularVideo => &[".mp4", ".webm", ".mov"],
        MessageKind::Text | MessageKind::Location => &[],
    }
}

pub fn validate_upload(
    kind: MessageKind,
    original_name: &str,
    size: usize,
    max_bytes: usize,
) -> Result<&'static str, ApiError> {
    if size > max_bytes {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("file exceeds {} bytes", max_bytes),
        ));
    }
    if size == 0 {
        return Err(ApiError::new(ErrorCode::Validation, "file is empty"));
    }
    let lowered = original_name.to_ascii_lowercase();
    allowed_extensions(kind)
        .iter()
        .copied()
        .find(|ext| lowered.ends_with(ext))
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Validation,
                format!("invalid file type for {} message", kind.as_str()),
            )
        })
}

pub async fn store_upload(
    ctx: &ApiContext,
    uploader: UserId,
    kind: MessageKind,
    original_name: &str,
    mime_type: Option<&str>,
    bytes: &[u8],
    max_bytes: usize,
) -> Result<UploadResponse, ApiError> {
    let ext = validate_upload(kind, original_name, bytes.len(), max_bytes)?;
    let filename = format!(
        "msg_{}_{}{}",
        uploader.0,
        Utc::now().timestamp_millis(),
        ext
    );
    ctx.storage
        .store_file(uploader, &filename, mime_type, bytes)
        .await
        .map_err(internal)?;
    Ok(UploadResponse {
        url: format!("/files/{filename}"),
        filename,
    })
}

pub async fn load_upload(ctx: &ApiContext, filename: &str) -> Result<StoredFile, ApiError> {
    ctx.storage
        .load_file(filename)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "file not found"))
}

async fn owned_live_message(
    ctx: &ApiContext,
    sender: UserId,
    message_id: MessageId,
) -> Result<Option<StoredMessage>, ApiError> {
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?;
    let owned = message.filter(|m| m.sender_id == sender && !m.is_deleted);
    if owned.is_none() {
        debug!(
            user_id = sender.0,
            message_id = message_id.0,
            "mutation ignored: message missing, deleted or not owned by user"
        );
    }
    Ok(owned)
}

fn fan_out(message: &StoredMessage, envelope: ServerEnvelope) -> Vec<Delivery> {
    let mut deliveries = vec![Delivery::new(message.sender_id, envelope.clone())];
    if message.receiver_id != message.sender_id {
        deliveries.push(Delivery::new(message.receiver_id, envelope));
    }
    deliveries
}

async fn user_summary(ctx: &ApiContext, user_id: UserId) -> Result<UserSummary, ApiError> {
    ctx.storage
        .load_user(user_id)
        .await
        .map_err(internal)?
        .map(|user| user.summary())
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))
}

fn message_payload(
    message: StoredMessage,
    sender: UserSummary,
    temp_id: Option<String>,
    reactions: Vec<ReactionSummary>,
) -> MessagePayload {
    MessagePayload {
        id: message.id,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        content: message.content,
        attachment: message.attachment,
        message_type: message.message_type,
        location_lat: message.location_lat,
        location_lng: message.location_lng,
        sender,
        created_at: message.created_at,
        edited_at: message.edited_at,
        temp_id,
        from: None,
        reactions,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
