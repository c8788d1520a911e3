use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::CallKind,
    protocol::{IceCandidate, SessionDescription},
};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_call(kind: CallKind) -> Self {
        Self {
            audio: true,
            video: kind.wants_video(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Connection state reported by the peer media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalIceCandidate(IceCandidate),
    StateChanged(TransportState),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("no camera or microphone found")]
    DeviceNotFound,
    #[error("camera or microphone is in use by another application")]
    DeviceBusy,
    #[error("peer media transport is not supported")]
    UnsupportedTransport,
    #[error("media capture requires a secure context")]
    InsecureContext,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

impl MediaError {
    /// Stable category name surfaced to the user next to the message.
    pub fn category(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => "PERMISSION_DENIED",
            MediaError::DeviceNotFound => "DEVICE_NOT_FOUND",
            MediaError::DeviceBusy => "DEVICE_BUSY",
            MediaError::UnsupportedTransport => "BROWSER_NOT_SUPPORTED",
            MediaError::InsecureContext => "SECURE_CONTEXT_REQUIRED",
            MediaError::Negotiation(_) => "NEGOTIATION_FAILED",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            MediaError::PermissionDenied => {
                "Camera/microphone access was denied. Allow access and try again.".to_string()
            }
            MediaError::DeviceNotFound => {
                "No camera or microphone was found. Connect a device and try again.".to_string()
            }
            MediaError::DeviceBusy => {
                "Your camera or microphone is being used by another application.".to_string()
            }
            MediaError::UnsupportedTransport => {
                "Calls are not supported on this client.".to_string()
            }
            MediaError::InsecureContext => {
                "Calls require a secure (HTTPS) connection.".to_string()
            }
            MediaError::Negotiation(reason) => format!("The call could not be set up: {reason}"),
        }
    }
}

/// Captured local tracks. Owned by exactly one call attempt.
#[async_trait]
pub trait LocalMedia: Send + Sync {
    fn has_track(&self, kind: TrackKind) -> bool;
    fn set_enabled(&self, kind: TrackKind, enabled: bool);
    async fn release(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints)
        -> Result<Arc<dyn LocalMedia>, MediaError>;
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), MediaError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;
    async fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self, media: Arc<dyn LocalMedia>) -> Result<Arc<dyn PeerSession>, MediaError>;
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError> {
        Err(MediaError::UnsupportedTransport)
    }
}

pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn create(
        &self,
        _media: Arc<dyn LocalMedia>,
    ) -> Result<Arc<dyn PeerSession>, MediaError> {
        Err(MediaError::UnsupportedTransport)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
