use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use media::{
    LocalMedia, MediaDevices, MediaError, PeerConnector, PeerEvent, PeerSession,
};
use shared::{
    domain::{CallKind, UserId},
    protocol::{IceCandidate, ServerEnvelope, SessionDescription},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    call::{
        AttemptId, CallAction, CallError, CallInput, CallManager, CallSnapshot, CallTimer,
        CallTimings, RemoteSignal,
    },
    transport::OutboundGate,
    ClientEvent,
};

enum Command {
    Input {
        input: CallInput,
        reply: Option<oneshot::Sender<Result<(), CallError>>>,
    },
    MediaReady {
        attempt: AttemptId,
        result: Result<Arc<dyn LocalMedia>, MediaError>,
    },
    PeerReady {
        attempt: AttemptId,
        peer: Arc<dyn PeerSession>,
    },
    Snapshot(oneshot::Sender<Option<CallSnapshot>>),
    Shutdown,
}

enum NegotiationStep {
    CreateOffer,
    ApplyOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    ApplyIce(Vec<IceCandidate>),
}

/// Handle to the call actor. Cloning is cheap; all clones drive the same call.
#[derive(Clone)]
pub struct CallController {
    commands: mpsc::UnboundedSender<Command>,
}

impl CallController {
    pub fn spawn(
        local_user: UserId,
        timings: CallTimings,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnector>,
        gate: OutboundGate,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let actor = CallActor {
            manager: CallManager::new(local_user, timings),
            devices,
            peers,
            gate,
            events,
            commands: commands.clone(),
            resources: None,
            timers: HashMap::new(),
        };
        tokio::spawn(actor.run(inbox));
        Self { commands }
    }

    pub async fn start_call(&self, peer: UserId, kind: CallKind) -> Result<(), CallError> {
        self.request(CallInput::Start { peer, kind }).await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(CallInput::Accept).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(CallInput::Reject).await
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(CallInput::Hangup).await
    }

    pub async fn toggle_hold(&self) -> Result<(), CallError> {
        self.request(CallInput::ToggleHold).await
    }

    pub async fn set_audio_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(CallInput::SetAudioMuted(muted)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(CallInput::SetVideoEnabled(enabled)).await
    }

    /// Feeds a signalling envelope to the call. Returns false for non-call envelopes.
    pub fn deliver(&self, envelope: &ServerEnvelope) -> bool {
        let Some(signal) = RemoteSignal::from_envelope(envelope) else {
            return false;
        };
        let _ = self.commands.send(Command::Input {
            input: CallInput::Remote(signal),
            reply: None,
        });
        true
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Hangs up any active call and stops the actor.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn request(&self, input: CallInput) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Input {
                input,
                reply: Some(tx),
            })
            .map_err(|_| CallError::ControllerStopped)?;
        rx.await.map_err(|_| CallError::ControllerStopped)?
    }
}

/// Media owned by one attempt. Dropped as a unit on release.
struct AttemptResources {
    attempt: AttemptId,
    media: Arc<dyn LocalMedia>,
    peer: Option<Arc<dyn PeerSession>>,
    steps: mpsc::UnboundedSender<NegotiationStep>,
    worker: JoinHandle<()>,
}

struct CallActor {
    manager: CallManager,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnector>,
    gate: OutboundGate,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::UnboundedSender<Command>,
    resources: Option<AttemptResources>,
    timers: HashMap<CallTimer, (AttemptId, JoinHandle<()>)>,
}

impl CallActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            match command {
                Command::Input { input, reply } => {
                    let result = self.process(input).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::MediaReady { attempt, result } => match result {
                    Ok(media) => self.media_ready(attempt, media).await,
                    Err(error) => {
                        let _ = self.process(CallInput::MediaFailed { attempt, error }).await;
                    }
                },
                Command::PeerReady { attempt, peer } => match self.resources.as_mut() {
                    Some(resources) if resources.attempt == attempt => {
                        resources.peer = Some(peer);
                    }
                    _ => peer.close().await,
                },
                Command::Snapshot(reply) => {
                    let snapshot = self
                        .manager
                        .session()
                        .map(|session| session.snapshot(Instant::now()));
                    let _ = reply.send(snapshot);
                }
                Command::Shutdown => {
                    let _ = self.process(CallInput::Hangup).await;
                    if let Some(resources) = self.resources.take() {
                        release(resources).await;
                    }
                    for (_, (_, timer)) in self.timers.drain() {
                        timer.abort();
                    }
                    break;
                }
            }
        }
        debug!("call controller stopped");
    }

    async fn media_ready(&mut self, attempt: AttemptId, media: Arc<dyn LocalMedia>) {
        if !self.manager.is_live(attempt) {
            debug!(attempt, "releasing media acquired for a finished call");
            media.release().await;
            return;
        }
        if let Some(previous) = self.resources.take() {
            release(previous).await;
        }
        let (steps, step_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(negotiate(
            attempt,
            Arc::clone(&media),
            Arc::clone(&self.peers),
            step_rx,
            self.commands.clone(),
        ));
        self.resources = Some(AttemptResources {
            attempt,
            media,
            peer: None,
            steps,
            worker,
        });
        let _ = self.process(CallInput::MediaAcquired { attempt }).await;
    }

    /// Runs the state machine to quiescence, including inputs produced by its own actions.
    async fn process(&mut self, input: CallInput) -> Result<(), CallError> {
        let mut queue = VecDeque::from([input]);
        let mut first = true;
        let mut outcome = Ok(());
        while let Some(input) = queue.pop_front() {
            let actions = match self.manager.handle(input, Instant::now()) {
                Ok(actions) => actions,
                Err(err) if first => {
                    outcome = Err(err);
                    break;
                }
                Err(err) => {
                    debug!(%err, "follow-up call input rejected");
                    continue;
                }
            };
            first = false;
            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
        outcome
    }

    async fn execute(&mut self, action: CallAction) -> Option<CallInput> {
        match action {
            CallAction::Send { attempt, envelope } => {
                let kind = envelope.kind();
                if let Err(err) = self.gate.send(envelope).await {
                    warn!(kind, %err, "signalling send failed");
                    return attempt.map(|attempt| CallInput::SignalFailed { attempt });
                }
            }
            CallAction::AcquireMedia {
                attempt,
                constraints,
            } => {
                let devices = Arc::clone(&self.devices);
                let commands = self.commands.clone();
                tokio::spawn(async move {
                    let result = devices.acquire(constraints).await;
                    let _ = commands.send(Command::MediaReady { attempt, result });
                });
            }
            CallAction::CreateOffer { attempt } => self.step(attempt, NegotiationStep::CreateOffer),
            CallAction::ApplyRemoteOffer { attempt, offer } => {
                self.step(attempt, NegotiationStep::ApplyOffer(offer))
            }
            CallAction::ApplyRemoteAnswer { attempt, answer } => {
                self.step(attempt, NegotiationStep::ApplyAnswer(answer))
            }
            CallAction::ApplyIce {
                attempt,
                candidates,
            } => self.step(attempt, NegotiationStep::ApplyIce(candidates)),
            CallAction::SetTrackEnabled {
                attempt,
                track,
                enabled,
            } => {
                if let Some(resources) = self.resources.as_ref().filter(|r| r.attempt == attempt) {
                    resources.media.set_enabled(track, enabled);
                }
            }
            CallAction::ReleaseMedia { attempt } => {
                self.timers.retain(|_, (owner, timer)| {
                    if *owner == attempt {
                        timer.abort();
                        false
                    } else {
                        true
                    }
                });
                if self
                    .resources
                    .as_ref()
                    .is_some_and(|resources| resources.attempt == attempt)
                {
                    if let Some(resources) = self.resources.take() {
                        release(resources).await;
                    }
                }
            }
            CallAction::StartTimer {
                attempt,
                timer,
                after,
            } => {
                let commands = self.commands.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = commands.send(Command::Input {
                        input: CallInput::TimerFired { attempt, timer },
                        reply: None,
                    });
                });
                if let Some((_, previous)) = self.timers.insert(timer, (attempt, handle)) {
                    previous.abort();
                }
            }
            CallAction::CancelTimer { attempt, timer } => {
                if self.timers.get(&timer).is_some_and(|(owner, _)| *owner == attempt) {
                    if let Some((_, handle)) = self.timers.remove(&timer) {
                        handle.abort();
                    }
                }
            }
            CallAction::Notify(notice) => {
                let _ = self.events.send(ClientEvent::Call(notice));
            }
        }
        None
    }

    fn step(&self, attempt: AttemptId, step: NegotiationStep) {
        match self.resources.as_ref().filter(|r| r.attempt == attempt) {
            Some(resources) => {
                let _ = resources.steps.send(step);
            }
            None => warn!(attempt, "negotiation step without local media dropped"),
        }
    }
}

async fn release(resources: AttemptResources) {
    resources.worker.abort();
    if let Some(peer) = resources.peer {
        peer.close().await;
    }
    resources.media.release().await;
    debug!(attempt = resources.attempt, "call media released");
}

fn post(commands: &mpsc::UnboundedSender<Command>, input: CallInput) {
    let _ = commands.send(Command::Input { input, reply: None });
}

/// Owns the peer session of one attempt and applies negotiation steps in order.
async fn negotiate(
    attempt: AttemptId,
    media: Arc<dyn LocalMedia>,
    peers: Arc<dyn PeerConnector>,
    mut steps: mpsc::UnboundedReceiver<NegotiationStep>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let peer = match peers.create(media).await {
        Ok(peer) => peer,
        Err(error) => {
            post(&commands, CallInput::MediaFailed { attempt, error });
            return;
        }
    };
    let mut peer_events = peer.subscribe_events();
    let _ = commands.send(Command::PeerReady {
        attempt,
        peer: Arc::clone(&peer),
    });

    let mut events_open = true;
    loop {
        tokio::select! {
            step = steps.recv() => {
                let Some(step) = step else { break };
                if let Err(err) = apply_step(peer.as_ref(), attempt, step, &commands).await {
                    warn!(attempt, %err, "negotiation step failed");
                    let reason = err.to_string();
                    post(&commands, CallInput::NegotiationFailed { attempt, reason });
                }
            }
            event = peer_events.recv(), if events_open => match event {
                Ok(PeerEvent::LocalIceCandidate(candidate)) => {
                    post(&commands, CallInput::LocalIceCandidate { attempt, candidate });
                }
                Ok(PeerEvent::StateChanged(state)) => {
                    post(&commands, CallInput::TransportChanged { attempt, state });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(attempt, skipped, "peer events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
        }
    }
}

async fn apply_step(
    peer: &dyn PeerSession,
    attempt: AttemptId,
    step: NegotiationStep,
    commands: &mpsc::UnboundedSender<Command>,
) -> Result<(), MediaError> {
    match step {
        NegotiationStep::CreateOffer => {
            let offer = peer.create_offer().await?;
            peer.set_local_description(offer.clone()).await?;
            post(
                commands,
                CallInput::LocalDescriptionReady {
                    attempt,
                    description: offer,
                },
            );
        }
        NegotiationStep::ApplyOffer(offer) => {
            peer.set_remote_description(offer).await?;
            post(commands, CallInput::RemoteDescriptionApplied { attempt });
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            post(
                commands,
                CallInput::LocalDescriptionReady {
                    attempt,
                    description: answer,
                },
            );
        }
        NegotiationStep::ApplyAnswer(answer) => {
            peer.set_remote_description(answer).await?;
            post(commands, CallInput::RemoteDescriptionApplied { attempt });
        }
        NegotiationStep::ApplyIce(candidates) => {
            for candidate in candidates {
                peer.add_ice_candidate(candidate).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
