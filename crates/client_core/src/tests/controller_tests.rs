use super::*;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use media::{MediaConstraints, TrackKind, TransportState};
use shared::{domain::UserSummary, protocol::ClientEnvelope};

use crate::call::{CallNotice, CallState};

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CAROL: UserId = UserId(3);

#[derive(Default)]
struct FakeMedia {
    enabled: StdMutex<HashMap<TrackKind, bool>>,
    released: AtomicUsize,
}

#[async_trait]
impl LocalMedia for FakeMedia {
    fn has_track(&self, _kind: TrackKind) -> bool {
        true
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        self.enabled.lock().expect("tracks").insert(kind, enabled);
    }

    async fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeDevices {
    media: Arc<FakeMedia>,
    fail_with: Option<MediaError>,
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError> {
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(Arc::clone(&self.media) as Arc<dyn LocalMedia>),
        }
    }
}

struct FakePeer {
    log: StdMutex<Vec<String>>,
    events: broadcast::Sender<PeerEvent>,
    closed: AtomicBool,
}

impl FakePeer {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            log: StdMutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().expect("log").push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().expect("log").clone()
    }
}

#[async_trait]
impl PeerSession for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_offer".to_string());
        Ok(SessionDescription::offer("fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_answer".to_string());
        Ok(SessionDescription::answer("fake-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(format!("set_local:{}", description.sdp));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(format!("set_remote:{}", description.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(format!("ice:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

struct FakeConnector {
    peer: Arc<FakePeer>,
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn create(
        &self,
        _media: Arc<dyn LocalMedia>,
    ) -> Result<Arc<dyn PeerSession>, MediaError> {
        Ok(Arc::clone(&self.peer) as Arc<dyn PeerSession>)
    }
}

struct Harness {
    calls: CallController,
    sent: mpsc::Receiver<ClientEnvelope>,
    events: broadcast::Receiver<ClientEvent>,
    media: Arc<FakeMedia>,
    peer: Arc<FakePeer>,
}

async fn harness(local: UserId, fail_with: Option<MediaError>, connected: bool) -> Harness {
    let gate = OutboundGate::new();
    let (tx, sent) = mpsc::channel(32);
    if connected {
        gate.install(tx).await;
    }
    let media = Arc::new(FakeMedia::default());
    let peer = Arc::new(FakePeer::new());
    let (events_tx, events) = broadcast::channel(64);
    let calls = CallController::spawn(
        local,
        CallTimings::default(),
        Arc::new(FakeDevices {
            media: Arc::clone(&media),
            fail_with,
        }),
        Arc::new(FakeConnector {
            peer: Arc::clone(&peer),
        }),
        gate,
        events_tx,
    );
    Harness {
        calls,
        sent,
        events,
        media,
        peer,
    }
}

async fn next_sent(sent: &mut mpsc::Receiver<ClientEnvelope>) -> ClientEnvelope {
    tokio::time::timeout(Duration::from_secs(5), sent.recv())
        .await
        .expect("envelope in time")
        .expect("gate open")
}

async fn wait_for_notice(
    events: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&CallNotice) -> bool,
) -> CallNotice {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ClientEvent::Call(notice) = events.recv().await.expect("event stream") {
                if matches(&notice) {
                    return notice;
                }
            }
        }
    })
    .await
    .expect("notice in time")
}

async fn wait_for_state(events: &mut broadcast::Receiver<ClientEvent>, wanted: CallState) {
    wait_for_notice(events, |notice| {
        matches!(notice, CallNotice::StateChanged { state, .. } if *state == wanted)
    })
    .await;
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition in time");
}

fn caller_summary() -> UserSummary {
    UserSummary::bare(ALICE, "alice")
}

#[tokio::test]
async fn caller_negotiates_connects_and_hangs_up() {
    let mut h = harness(ALICE, None, true).await;

    h.calls
        .start_call(BOB, CallKind::Video)
        .await
        .expect("start");
    assert_eq!(
        next_sent(&mut h.sent).await,
        ClientEnvelope::CallRequest {
            to: BOB,
            call_type: CallKind::Video
        }
    );

    assert!(h.calls.deliver(&ServerEnvelope::CallAccept { from: BOB }));
    assert_eq!(
        next_sent(&mut h.sent).await,
        ClientEnvelope::CallOffer {
            to: BOB,
            sdp: SessionDescription::offer("fake-offer"),
            call_type: CallKind::Video
        }
    );

    let candidate = IceCandidate {
        candidate: "candidate:1".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    };
    h.calls.deliver(&ServerEnvelope::IceCandidate {
        from: BOB,
        candidate,
    });
    h.calls.deliver(&ServerEnvelope::CallAnswer {
        from: BOB,
        sdp: SessionDescription::answer("remote-answer"),
    });

    let peer = Arc::clone(&h.peer);
    wait_until(move || peer.log().iter().any(|entry| entry == "ice:candidate:1")).await;
    assert_eq!(
        h.peer.log(),
        vec![
            "create_offer".to_string(),
            "set_local:fake-offer".to_string(),
            "set_remote:remote-answer".to_string(),
            "ice:candidate:1".to_string(),
        ]
    );

    h.peer
        .events
        .send(PeerEvent::StateChanged(TransportState::Connected))
        .expect("peer event");
    wait_for_state(&mut h.events, CallState::Connected).await;

    let snapshot = h.calls.snapshot().await.expect("active call");
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(snapshot.peer, BOB);

    h.calls.set_audio_muted(true).await.expect("mute");
    assert_eq!(
        h.media.enabled.lock().expect("tracks").get(&TrackKind::Audio),
        Some(&false)
    );

    h.calls.hangup().await.expect("hangup");
    assert_eq!(next_sent(&mut h.sent).await, ClientEnvelope::CallEnd { to: BOB });
    assert_eq!(h.media.released.load(Ordering::SeqCst), 1);
    assert!(h.peer.closed.load(Ordering::SeqCst));
    assert!(h.calls.snapshot().await.is_none());
}

#[tokio::test]
async fn callee_answers_a_legacy_direct_offer() {
    let mut h = harness(BOB, None, true).await;

    h.calls.deliver(&ServerEnvelope::CallOffer {
        from: ALICE,
        call_type: CallKind::Audio,
        caller: caller_summary(),
        sdp: SessionDescription::offer("remote-offer"),
    });
    let incoming = wait_for_notice(&mut h.events, |notice| {
        matches!(notice, CallNotice::Incoming { .. })
    })
    .await;
    assert!(matches!(incoming, CallNotice::Incoming { from: ALICE, .. }));

    h.calls.accept().await.expect("accept");
    assert_eq!(
        next_sent(&mut h.sent).await,
        ClientEnvelope::CallAnswer {
            to: ALICE,
            sdp: SessionDescription::answer("fake-answer")
        }
    );
    assert_eq!(
        h.peer.log(),
        vec![
            "set_remote:remote-offer".to_string(),
            "create_answer".to_string(),
            "set_local:fake-answer".to_string(),
        ]
    );
}

#[tokio::test]
async fn busy_callee_rejects_second_caller_and_accepts_first() {
    let mut h = harness(BOB, None, true).await;

    h.calls.deliver(&ServerEnvelope::CallRequest {
        from: ALICE,
        call_type: CallKind::Video,
        caller: caller_summary(),
    });
    wait_for_state(&mut h.events, CallState::Ringing).await;

    h.calls.deliver(&ServerEnvelope::CallRequest {
        from: CAROL,
        call_type: CallKind::Video,
        caller: UserSummary::bare(CAROL, "carol"),
    });
    assert_eq!(
        next_sent(&mut h.sent).await,
        ClientEnvelope::CallReject { to: CAROL }
    );

    h.calls.accept().await.expect("accept");
    assert_eq!(
        next_sent(&mut h.sent).await,
        ClientEnvelope::CallAccept { to: ALICE }
    );
    let snapshot = h.calls.snapshot().await.expect("call");
    assert_eq!(snapshot.state, CallState::Accepted);
    assert_eq!(snapshot.peer_summary, Some(caller_summary()));
}

#[tokio::test]
async fn media_failure_ends_the_call_with_a_category() {
    let mut h = harness(ALICE, Some(MediaError::DeviceBusy), true).await;

    h.calls
        .start_call(BOB, CallKind::Video)
        .await
        .expect("start");
    next_sent(&mut h.sent).await;
    h.calls.deliver(&ServerEnvelope::CallAccept { from: BOB });

    let failure = wait_for_notice(&mut h.events, |notice| {
        matches!(notice, CallNotice::Failure { .. })
    })
    .await;
    assert!(matches!(
        failure,
        CallNotice::Failure {
            category: "DEVICE_BUSY",
            ..
        }
    ));
    assert_eq!(next_sent(&mut h.sent).await, ClientEnvelope::CallEnd { to: BOB });
    assert!(h.calls.snapshot().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn call_without_connection_fails_then_tears_down() {
    let mut h = harness(ALICE, None, false).await;

    h.calls
        .start_call(BOB, CallKind::Audio)
        .await
        .expect("accepted locally");
    wait_for_state(&mut h.events, CallState::Failed).await;
    assert_eq!(
        h.calls.snapshot().await.map(|s| s.state),
        Some(CallState::Failed)
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.calls.snapshot().await.is_none());
}

#[tokio::test]
async fn intents_without_a_call_are_refused() {
    let h = harness(ALICE, None, true).await;
    assert_eq!(h.calls.accept().await, Err(CallError::NoActiveCall));
    assert_eq!(h.calls.hangup().await, Err(CallError::NoActiveCall));
    assert!(!h.calls.deliver(&ServerEnvelope::Typing { from: BOB }));

    h.calls.shutdown();
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.calls.accept().await == Err(CallError::ControllerStopped) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(stopped.is_ok());
}
