//! Call signaling state machine.
//!
//! [`CallManager`] performs no I/O: it consumes [`CallInput`] values (local
//! intents, remote envelopes, completions of async media work, timers) and
//! returns the [`CallAction`]s the controller must execute. Every async
//! completion carries the [`AttemptId`] it was started for and is ignored once
//! that attempt is terminal or replaced.

use std::time::Duration;

use media::{MediaConstraints, MediaError, TrackKind, TransportState};
use shared::{
    domain::{CallKind, UserId, UserSummary},
    protocol::{ClientEnvelope, IceCandidate, ServerEnvelope, SessionDescription},
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

pub type AttemptId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimings {
    pub disconnected_grace: Duration,
    pub failed_grace: Duration,
    pub teardown_delay: Duration,
    /// Callee-side only; the caller never times out a ringing call.
    pub ring_timeout: Option<Duration>,
}

impl Default for CallTimings {
    fn default() -> Self {
        Self {
            disconnected_grace: Duration::from_secs(3),
            failed_grace: Duration::from_secs(2),
            teardown_delay: Duration::from_secs(2),
            ring_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Requesting,
    Ringing,
    Accepted,
    Negotiating,
    Connected,
    OnHold,
    Ending,
    Ended,
    Rejected,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Ended | CallState::Rejected | CallState::Failed
        )
    }

    fn accepts_ice(self) -> bool {
        matches!(
            self,
            CallState::Ringing
                | CallState::Accepted
                | CallState::Negotiating
                | CallState::Connected
                | CallState::OnHold
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// How the callee learned about the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// `call_request` / `call_accept`, then the caller's offer.
    RequestAccept,
    /// Legacy peers send the offer straight away as `incoming_call`.
    DirectOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTimer {
    Teardown,
    DisconnectGrace,
    FailedGrace,
    RingTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteEnded,
    LocalRejected,
    RemoteRejected,
    RingTimeout,
    Media(MediaError),
    Negotiation(String),
    TransportLost,
    TransportFailed,
    SignalingUnavailable,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    StateChanged {
        attempt: AttemptId,
        peer: UserId,
        state: CallState,
    },
    Incoming {
        attempt: AttemptId,
        from: UserId,
        caller: Option<UserSummary>,
        kind: CallKind,
    },
    AutoRejected {
        from: UserId,
    },
    Failure {
        attempt: AttemptId,
        category: &'static str,
        message: String,
    },
    Ended {
        attempt: AttemptId,
        peer: UserId,
        reason: EndReason,
        duration: Option<Duration>,
    },
}

/// Signaling envelopes the state machine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteSignal {
    Request {
        from: UserId,
        kind: CallKind,
        caller: UserSummary,
    },
    Accept {
        from: UserId,
    },
    Reject {
        from: UserId,
    },
    Offer {
        from: UserId,
        kind: CallKind,
        caller: UserSummary,
        sdp: SessionDescription,
    },
    Answer {
        from: UserId,
        sdp: SessionDescription,
    },
    Ice {
        from: UserId,
        candidate: IceCandidate,
    },
    End {
        from: UserId,
    },
}

impl RemoteSignal {
    pub fn from_envelope(envelope: &ServerEnvelope) -> Option<Self> {
        let signal = match envelope {
            ServerEnvelope::CallRequest {
                from,
                call_type,
                caller,
            } => RemoteSignal::Request {
                from: *from,
                kind: *call_type,
                caller: caller.clone(),
            },
            ServerEnvelope::CallAccept { from } => RemoteSignal::Accept { from: *from },
            ServerEnvelope::CallReject { from } => RemoteSignal::Reject { from: *from },
            ServerEnvelope::CallOffer {
                from,
                call_type,
                caller,
                sdp,
            } => RemoteSignal::Offer {
                from: *from,
                kind: *call_type,
                caller: caller.clone(),
                sdp: sdp.clone(),
            },
            ServerEnvelope::CallAnswer { from, sdp } => RemoteSignal::Answer {
                from: *from,
                sdp: sdp.clone(),
            },
            ServerEnvelope::IceCandidate { from, candidate } => RemoteSignal::Ice {
                from: *from,
                candidate: candidate.clone(),
            },
            ServerEnvelope::CallEnd { from } => RemoteSignal::End { from: *from },
            _ => return None,
        };
        Some(signal)
    }

    pub fn from(&self) -> UserId {
        match self {
            RemoteSignal::Request { from, .. }
            | RemoteSignal::Accept { from }
            | RemoteSignal::Reject { from }
            | RemoteSignal::Offer { from, .. }
            | RemoteSignal::Answer { from, .. }
            | RemoteSignal::Ice { from, .. }
            | RemoteSignal::End { from } => *from,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    Start { peer: UserId, kind: CallKind },
    Accept,
    Reject,
    Hangup,
    ToggleHold,
    SetAudioMuted(bool),
    SetVideoEnabled(bool),
    Remote(RemoteSignal),
    MediaAcquired {
        attempt: AttemptId,
    },
    MediaFailed {
        attempt: AttemptId,
        error: MediaError,
    },
    LocalDescriptionReady {
        attempt: AttemptId,
        description: SessionDescription,
    },
    RemoteDescriptionApplied {
        attempt: AttemptId,
    },
    NegotiationFailed {
        attempt: AttemptId,
        reason: String,
    },
    LocalIceCandidate {
        attempt: AttemptId,
        candidate: IceCandidate,
    },
    TransportChanged {
        attempt: AttemptId,
        state: TransportState,
    },
    TimerFired {
        attempt: AttemptId,
        timer: CallTimer,
    },
    SignalFailed {
        attempt: AttemptId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    Send {
        attempt: Option<AttemptId>,
        envelope: ClientEnvelope,
    },
    AcquireMedia {
        attempt: AttemptId,
        constraints: MediaConstraints,
    },
    CreateOffer {
        attempt: AttemptId,
    },
    ApplyRemoteOffer {
        attempt: AttemptId,
        offer: SessionDescription,
    },
    ApplyRemoteAnswer {
        attempt: AttemptId,
        answer: SessionDescription,
    },
    /// Candidates must be applied in the given order.
    ApplyIce {
        attempt: AttemptId,
        candidates: Vec<IceCandidate>,
    },
    SetTrackEnabled {
        attempt: AttemptId,
        track: TrackKind,
        enabled: bool,
    },
    /// Closes the peer session, releases local tracks and cancels the attempt's timers.
    ReleaseMedia {
        attempt: AttemptId,
    },
    StartTimer {
        attempt: AttemptId,
        timer: CallTimer,
        after: Duration,
    },
    CancelTimer {
        attempt: AttemptId,
        timer: CallTimer,
    },
    Notify(CallNotice),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    AlreadyInCall,
    #[error("no active call")]
    NoActiveCall,
    #[error("cannot call yourself")]
    SelfCall,
    #[error("`{action}` is not allowed while {state:?}")]
    NotAllowed {
        action: &'static str,
        state: CallState,
    },
    #[error("call controller stopped")]
    ControllerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub attempt: AttemptId,
    pub peer: UserId,
    pub peer_summary: Option<UserSummary>,
    pub role: CallRole,
    pub kind: CallKind,
    pub handshake: Handshake,
    pub state: CallState,
    pub audio_muted: bool,
    pub video_enabled: bool,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    attempt: AttemptId,
    caller: UserId,
    callee: UserId,
    role: CallRole,
    kind: CallKind,
    handshake: Handshake,
    state: CallState,
    peer_summary: Option<UserSummary>,
    pending_offer: Option<SessionDescription>,
    local_description: Option<SessionDescription>,
    remote_description_applied: bool,
    answer_in_flight: bool,
    queued_ice: Vec<IceCandidate>,
    media_acquired: bool,
    audio_muted: bool,
    video_enabled: bool,
    transport: TransportState,
    connected_at: Option<Instant>,
    end_reason: Option<EndReason>,
}

impl CallSession {
    fn new(
        attempt: AttemptId,
        role: CallRole,
        local: UserId,
        peer: UserId,
        kind: CallKind,
        handshake: Handshake,
    ) -> Self {
        let (caller, callee) = match role {
            CallRole::Caller => (local, peer),
            CallRole::Callee => (peer, local),
        };
        Self {
            attempt,
            caller,
            callee,
            role,
            kind,
            handshake,
            state: CallState::Idle,
            peer_summary: None,
            pending_offer: None,
            local_description: None,
            remote_description_applied: false,
            answer_in_flight: false,
            queued_ice: Vec::new(),
            media_acquired: false,
            audio_muted: false,
            video_enabled: kind.wants_video(),
            transport: TransportState::New,
            connected_at: None,
            end_reason: None,
        }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn caller(&self) -> UserId {
        self.caller
    }

    pub fn callee(&self) -> UserId {
        self.callee
    }

    pub fn peer(&self) -> UserId {
        match self.role {
            CallRole::Caller => self.callee,
            CallRole::Callee => self.caller,
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    pub fn queued_ice(&self) -> &[IceCandidate] {
        &self.queued_ice
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn duration(&self, now: Instant) -> Option<Duration> {
        self.connected_at.map(|at| now.saturating_duration_since(at))
    }

    pub fn snapshot(&self, now: Instant) -> CallSnapshot {
        CallSnapshot {
            attempt: self.attempt,
            peer: self.peer(),
            peer_summary: self.peer_summary.clone(),
            role: self.role,
            kind: self.kind,
            handshake: self.handshake,
            state: self.state,
            audio_muted: self.audio_muted,
            video_enabled: self.video_enabled,
            duration: self.duration(now),
        }
    }

    fn set_state(&mut self, state: CallState, out: &mut Vec<CallAction>) {
        if self.state == state {
            return;
        }
        info!(
            attempt = self.attempt,
            peer = self.peer().0,
            from = ?self.state,
            to = ?state,
            "call state transition"
        );
        self.state = state;
        out.push(CallAction::Notify(CallNotice::StateChanged {
            attempt: self.attempt,
            peer: self.peer(),
            state,
        }));
    }

    fn send(&self, envelope: ClientEnvelope, out: &mut Vec<CallAction>) {
        out.push(CallAction::Send {
            attempt: Some(self.attempt),
            envelope,
        });
    }

    fn timer(&self, timer: CallTimer, after: Duration, out: &mut Vec<CallAction>) {
        out.push(CallAction::StartTimer {
            attempt: self.attempt,
            timer,
            after,
        });
    }

    fn track(&self, track: TrackKind, enabled: bool, out: &mut Vec<CallAction>) {
        out.push(CallAction::SetTrackEnabled {
            attempt: self.attempt,
            track,
            enabled,
        });
    }

    /// Ending → Ended. Releases media immediately.
    fn finish(
        &mut self,
        reason: EndReason,
        notify_peer: bool,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        self.set_state(CallState::Ending, out);
        if notify_peer {
            self.send(ClientEnvelope::CallEnd { to: self.peer() }, out);
        }
        out.push(CallAction::ReleaseMedia {
            attempt: self.attempt,
        });
        self.close(reason, now, out);
    }

    /// Rejected or Failed: media is released now, the session lingers until teardown.
    fn settle(
        &mut self,
        state: CallState,
        reason: EndReason,
        timings: &CallTimings,
        out: &mut Vec<CallAction>,
    ) {
        self.end_reason = Some(reason);
        self.set_state(state, out);
        out.push(CallAction::ReleaseMedia {
            attempt: self.attempt,
        });
        self.timer(CallTimer::Teardown, timings.teardown_delay, out);
    }

    fn close(&mut self, reason: EndReason, now: Instant, out: &mut Vec<CallAction>) {
        let duration = self.duration(now);
        self.set_state(CallState::Ended, out);
        out.push(CallAction::Notify(CallNotice::Ended {
            attempt: self.attempt,
            peer: self.peer(),
            reason,
            duration,
        }));
    }

    fn acquire_media(&self, out: &mut Vec<CallAction>) {
        out.push(CallAction::AcquireMedia {
            attempt: self.attempt,
            constraints: MediaConstraints::for_call(self.kind),
        });
    }

    /// Callee: once accepted and an offer is known, acquire media to answer it.
    fn begin_answer(&mut self, out: &mut Vec<CallAction>) {
        if self.state == CallState::Accepted && self.pending_offer.is_some() {
            self.set_state(CallState::Negotiating, out);
            self.acquire_media(out);
        }
    }

    fn reject_incoming(
        &mut self,
        reason: EndReason,
        timings: &CallTimings,
        out: &mut Vec<CallAction>,
    ) {
        let envelope = match self.handshake {
            Handshake::RequestAccept => ClientEnvelope::CallReject { to: self.peer() },
            Handshake::DirectOffer => ClientEnvelope::CallEnd { to: self.peer() },
        };
        self.send(envelope, out);
        self.settle(CallState::Rejected, reason, timings, out);
    }

    fn fail(&mut self, error: &MediaError, out: &mut Vec<CallAction>) {
        out.push(CallAction::Notify(CallNotice::Failure {
            attempt: self.attempt,
            category: error.category(),
            message: error.user_message(),
        }));
    }

    fn apply_track_flags(&self, out: &mut Vec<CallAction>) {
        if self.state == CallState::OnHold || !self.media_acquired {
            return;
        }
        self.track(TrackKind::Audio, !self.audio_muted, out);
        if self.kind.wants_video() {
            self.track(TrackKind::Video, self.video_enabled, out);
        }
    }
}

/// Owns at most one [`CallSession`] for the local identity.
pub struct CallManager {
    local_user: UserId,
    timings: CallTimings,
    session: Option<CallSession>,
    next_attempt: AttemptId,
}

impl CallManager {
    pub fn new(local_user: UserId, timings: CallTimings) -> Self {
        Self {
            local_user,
            timings,
            session: None,
            next_attempt: 0,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    /// True while `attempt` is the current, non-terminal attempt.
    pub fn is_live(&self, attempt: AttemptId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.attempt == attempt && !s.state.is_terminal())
    }

    pub fn handle(
        &mut self,
        input: CallInput,
        now: Instant,
    ) -> Result<Vec<CallAction>, CallError> {
        let mut out = Vec::new();
        let result = self.dispatch(input, now, &mut out);
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.state == CallState::Ended)
        {
            self.session = None;
        }
        result.map(|()| out)
    }

    fn dispatch(
        &mut self,
        input: CallInput,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) -> Result<(), CallError> {
        match input {
            CallInput::Start { peer, kind } => self.start(peer, kind, now, out),
            CallInput::Accept => self.accept(out),
            CallInput::Reject => {
                let timings = self.timings;
                let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
                if session.role != CallRole::Callee || session.state != CallState::Ringing {
                    return Err(CallError::NotAllowed {
                        action: "reject",
                        state: session.state,
                    });
                }
                session.reject_incoming(EndReason::LocalRejected, &timings, out);
                Ok(())
            }
            CallInput::Hangup => {
                let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
                if session.state.is_terminal() {
                    let reason = session.end_reason.clone().unwrap_or(EndReason::LocalHangup);
                    out.push(CallAction::ReleaseMedia {
                        attempt: session.attempt,
                    });
                    session.close(reason, now, out);
                } else {
                    session.finish(EndReason::LocalHangup, true, now, out);
                }
                Ok(())
            }
            CallInput::ToggleHold => {
                let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
                match session.state {
                    CallState::Connected => {
                        session.set_state(CallState::OnHold, out);
                        session.track(TrackKind::Audio, false, out);
                        if session.kind.wants_video() {
                            session.track(TrackKind::Video, false, out);
                        }
                    }
                    CallState::OnHold => {
                        session.set_state(CallState::Connected, out);
                        session.apply_track_flags(out);
                    }
                    state => {
                        return Err(CallError::NotAllowed {
                            action: "hold",
                            state,
                        })
                    }
                }
                Ok(())
            }
            CallInput::SetAudioMuted(muted) => {
                let session = self.live_session_mut()?;
                session.audio_muted = muted;
                if session.media_acquired && session.state != CallState::OnHold {
                    session.track(TrackKind::Audio, !muted, out);
                }
                Ok(())
            }
            CallInput::SetVideoEnabled(enabled) => {
                let session = self.live_session_mut()?;
                if !session.kind.wants_video() {
                    return Err(CallError::NotAllowed {
                        action: "toggle video",
                        state: session.state,
                    });
                }
                session.video_enabled = enabled;
                if session.media_acquired && session.state != CallState::OnHold {
                    session.track(TrackKind::Video, enabled, out);
                }
                Ok(())
            }
            CallInput::Remote(signal) => {
                self.remote(signal, now, out);
                Ok(())
            }
            completion => {
                self.completion(completion, now, out);
                Ok(())
            }
        }
    }

    fn live_session_mut(&mut self) -> Result<&mut CallSession, CallError> {
        match self.session.as_mut() {
            Some(session) if !session.state.is_terminal() => Ok(session),
            _ => Err(CallError::NoActiveCall),
        }
    }

    fn has_active_session(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.state.is_terminal())
    }

    /// Drops a lingering Rejected/Failed session so a new attempt can start.
    fn discard_terminal(&mut self, now: Instant, out: &mut Vec<CallAction>) {
        if let Some(mut old) = self.session.take() {
            out.push(CallAction::ReleaseMedia {
                attempt: old.attempt,
            });
            let reason = old.end_reason.clone().unwrap_or(EndReason::Superseded);
            old.close(reason, now, out);
        }
    }

    fn open_session(
        &mut self,
        role: CallRole,
        peer: UserId,
        kind: CallKind,
        handshake: Handshake,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) -> &mut CallSession {
        self.discard_terminal(now, out);
        self.next_attempt += 1;
        let session = CallSession::new(
            self.next_attempt,
            role,
            self.local_user,
            peer,
            kind,
            handshake,
        );
        self.session.insert(session)
    }

    fn start(
        &mut self,
        peer: UserId,
        kind: CallKind,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) -> Result<(), CallError> {
        if peer == self.local_user {
            return Err(CallError::SelfCall);
        }
        if self.has_active_session() {
            return Err(CallError::AlreadyInCall);
        }
        let session =
            self.open_session(CallRole::Caller, peer, kind, Handshake::RequestAccept, now, out);
        session.set_state(CallState::Requesting, out);
        session.send(ClientEnvelope::CallRequest { to: peer, call_type: kind }, out);
        Ok(())
    }

    fn accept(&mut self, out: &mut Vec<CallAction>) -> Result<(), CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        if session.role != CallRole::Callee || session.state != CallState::Ringing {
            return Err(CallError::NotAllowed {
                action: "accept",
                state: session.state,
            });
        }
        out.push(CallAction::CancelTimer {
            attempt: session.attempt,
            timer: CallTimer::RingTimeout,
        });
        if session.handshake == Handshake::RequestAccept {
            session.send(ClientEnvelope::CallAccept { to: session.peer() }, out);
        }
        session.set_state(CallState::Accepted, out);
        session.begin_answer(out);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn ring(
        &mut self,
        from: UserId,
        caller: UserSummary,
        kind: CallKind,
        handshake: Handshake,
        offer: Option<SessionDescription>,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        let ring_timeout = self.timings.ring_timeout;
        let session = self.open_session(CallRole::Callee, from, kind, handshake, now, out);
        session.peer_summary = Some(caller.clone());
        session.pending_offer = offer;
        session.set_state(CallState::Ringing, out);
        out.push(CallAction::Notify(CallNotice::Incoming {
            attempt: session.attempt,
            from,
            caller: Some(caller),
            kind,
        }));
        if let Some(after) = ring_timeout {
            session.timer(CallTimer::RingTimeout, after, out);
        }
    }

    fn auto_reject(&self, from: UserId, envelope: ClientEnvelope, out: &mut Vec<CallAction>) {
        info!(from = from.0, "busy; auto-rejecting incoming call");
        out.push(CallAction::Send {
            attempt: None,
            envelope,
        });
        out.push(CallAction::Notify(CallNotice::AutoRejected { from }));
    }

    fn remote(&mut self, signal: RemoteSignal, now: Instant, out: &mut Vec<CallAction>) {
        let from = signal.from();
        match signal {
            RemoteSignal::Request { kind, caller, .. } => {
                if self.has_active_session() {
                    self.auto_reject(from, ClientEnvelope::CallReject { to: from }, out);
                    return;
                }
                self.ring(from, caller, kind, Handshake::RequestAccept, None, now, out);
            }
            RemoteSignal::Offer {
                kind, caller, sdp, ..
            } => {
                if !self.has_active_session() {
                    self.ring(from, caller, kind, Handshake::DirectOffer, Some(sdp), now, out);
                    return;
                }
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let expected = session.role == CallRole::Callee
                    && session.peer() == from
                    && matches!(session.state, CallState::Ringing | CallState::Accepted)
                    && session.pending_offer.is_none()
                    && !session.remote_description_applied;
                if expected {
                    session.pending_offer = Some(sdp);
                    session.begin_answer(out);
                } else if session.peer() == from {
                    debug!(from = from.0, state = ?session.state, "duplicate offer ignored");
                } else {
                    self.auto_reject(from, ClientEnvelope::CallEnd { to: from }, out);
                }
            }
            RemoteSignal::Accept { .. } => {
                let Some(session) = self.peer_session_mut(from) else {
                    return;
                };
                if session.role == CallRole::Caller && session.state == CallState::Requesting {
                    session.set_state(CallState::Accepted, out);
                    session.acquire_media(out);
                } else {
                    debug!(state = ?session.state, "call_accept ignored");
                }
            }
            RemoteSignal::Reject { .. } => {
                let timings = self.timings;
                let Some(session) = self.peer_session_mut(from) else {
                    return;
                };
                let rejectable = session.role == CallRole::Caller
                    && matches!(
                        session.state,
                        CallState::Requesting
                            | CallState::Accepted
                            | CallState::Negotiating
                            | CallState::Connected
                            | CallState::OnHold
                    );
                if rejectable {
                    session.settle(CallState::Rejected, EndReason::RemoteRejected, &timings, out);
                }
            }
            RemoteSignal::Answer { sdp, .. } => {
                let Some(session) = self.peer_session_mut(from) else {
                    return;
                };
                if session.role == CallRole::Caller
                    && session.state == CallState::Negotiating
                    && !session.remote_description_applied
                    && !session.answer_in_flight
                {
                    session.answer_in_flight = true;
                    out.push(CallAction::ApplyRemoteAnswer {
                        attempt: session.attempt,
                        answer: sdp,
                    });
                } else {
                    debug!(state = ?session.state, "call_answer ignored");
                }
            }
            RemoteSignal::Ice { candidate, .. } => {
                let Some(session) = self.peer_session_mut(from) else {
                    return;
                };
                if !session.state.accepts_ice() {
                    return;
                }
                if session.remote_description_applied {
                    out.push(CallAction::ApplyIce {
                        attempt: session.attempt,
                        candidates: vec![candidate],
                    });
                } else {
                    session.queued_ice.push(candidate);
                }
            }
            RemoteSignal::End { .. } => {
                let Some(session) = self.session.as_mut().filter(|s| s.peer() == from) else {
                    return;
                };
                if session.state.is_terminal() {
                    let reason = session.end_reason.clone().unwrap_or(EndReason::RemoteEnded);
                    out.push(CallAction::ReleaseMedia {
                        attempt: session.attempt,
                    });
                    session.close(reason, now, out);
                } else {
                    session.finish(EndReason::RemoteEnded, false, now, out);
                }
            }
        }
    }

    fn peer_session_mut(&mut self, from: UserId) -> Option<&mut CallSession> {
        let session = self
            .session
            .as_mut()
            .filter(|s| s.peer() == from && !s.state.is_terminal());
        if session.is_none() {
            debug!(from = from.0, "signal without matching call ignored");
        }
        session
    }

    fn completion(&mut self, input: CallInput, now: Instant, out: &mut Vec<CallAction>) {
        let timings = self.timings;
        let attempt = match &input {
            CallInput::MediaAcquired { attempt }
            | CallInput::MediaFailed { attempt, .. }
            | CallInput::LocalDescriptionReady { attempt, .. }
            | CallInput::RemoteDescriptionApplied { attempt }
            | CallInput::NegotiationFailed { attempt, .. }
            | CallInput::LocalIceCandidate { attempt, .. }
            | CallInput::TransportChanged { attempt, .. }
            | CallInput::TimerFired { attempt, .. }
            | CallInput::SignalFailed { attempt } => *attempt,
            _ => return,
        };
        let Some(session) = self.session.as_mut().filter(|s| s.attempt == attempt) else {
            debug!(attempt, "completion for stale call attempt ignored");
            return;
        };

        if session.state.is_terminal() {
            if let CallInput::TimerFired {
                timer: CallTimer::Teardown,
                ..
            } = input
            {
                let reason = session.end_reason.clone().unwrap_or(EndReason::Superseded);
                session.close(reason, now, out);
            }
            return;
        }

        match input {
            CallInput::MediaAcquired { .. } => {
                session.media_acquired = true;
                match (session.role, session.state) {
                    (CallRole::Caller, CallState::Accepted) => {
                        session.set_state(CallState::Negotiating, out);
                        out.push(CallAction::CreateOffer { attempt });
                    }
                    (CallRole::Callee, CallState::Negotiating) => {
                        if let Some(offer) = session.pending_offer.take() {
                            out.push(CallAction::ApplyRemoteOffer { attempt, offer });
                        }
                    }
                    _ => {}
                }
                if session.audio_muted || (session.kind.wants_video() && !session.video_enabled)
                {
                    session.apply_track_flags(out);
                }
            }
            CallInput::MediaFailed { error, .. } => {
                session.fail(&error, out);
                session.finish(EndReason::Media(error), true, now, out);
            }
            CallInput::LocalDescriptionReady { description, .. } => {
                if session.state != CallState::Negotiating {
                    return;
                }
                session.local_description = Some(description.clone());
                let envelope = match session.role {
                    CallRole::Caller => ClientEnvelope::CallOffer {
                        to: session.peer(),
                        sdp: description,
                        call_type: session.kind,
                    },
                    CallRole::Callee => ClientEnvelope::CallAnswer {
                        to: session.peer(),
                        sdp: description,
                    },
                };
                session.send(envelope, out);
            }
            CallInput::RemoteDescriptionApplied { .. } => {
                session.remote_description_applied = true;
                session.answer_in_flight = false;
                if !session.queued_ice.is_empty() {
                    out.push(CallAction::ApplyIce {
                        attempt,
                        candidates: std::mem::take(&mut session.queued_ice),
                    });
                }
            }
            CallInput::NegotiationFailed { reason, .. } => {
                let error = MediaError::Negotiation(reason.clone());
                session.fail(&error, out);
                session.finish(EndReason::Negotiation(reason), true, now, out);
            }
            CallInput::LocalIceCandidate { candidate, .. } => {
                if matches!(
                    session.state,
                    CallState::Negotiating | CallState::Connected | CallState::OnHold
                ) {
                    session.send(
                        ClientEnvelope::IceCandidate {
                            to: session.peer(),
                            candidate,
                        },
                        out,
                    );
                }
            }
            CallInput::TransportChanged { state, .. } => {
                session.transport = state;
                match state {
                    TransportState::Connected => {
                        out.push(CallAction::CancelTimer {
                            attempt,
                            timer: CallTimer::DisconnectGrace,
                        });
                        if session.state == CallState::Negotiating {
                            session.connected_at = Some(now);
                            session.set_state(CallState::Connected, out);
                        }
                    }
                    TransportState::Disconnected => {
                        if matches!(
                            session.state,
                            CallState::Negotiating | CallState::Connected | CallState::OnHold
                        ) {
                            session.timer(
                                CallTimer::DisconnectGrace,
                                timings.disconnected_grace,
                                out,
                            );
                        }
                    }
                    TransportState::Failed => {
                        session.timer(CallTimer::FailedGrace, timings.failed_grace, out);
                    }
                    TransportState::New | TransportState::Connecting | TransportState::Closed => {}
                }
            }
            CallInput::TimerFired { timer, .. } => match timer {
                CallTimer::DisconnectGrace => {
                    if session.transport == TransportState::Disconnected {
                        session.finish(EndReason::TransportLost, true, now, out);
                    }
                }
                CallTimer::FailedGrace => {
                    session.finish(EndReason::TransportFailed, true, now, out);
                }
                CallTimer::RingTimeout => {
                    if session.state == CallState::Ringing {
                        session.reject_incoming(EndReason::RingTimeout, &timings, out);
                    }
                }
                CallTimer::Teardown => {}
            },
            CallInput::SignalFailed { .. } => {
                out.push(CallAction::Notify(CallNotice::Failure {
                    attempt,
                    category: "NOT_CONNECTED",
                    message: "Not connected to the server. Please try again.".to_string(),
                }));
                session.settle(
                    CallState::Failed,
                    EndReason::SignalingUnavailable,
                    &timings,
                    out,
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
