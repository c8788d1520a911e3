use super::*;
use shared::domain::{MessageKind, UserSummary};

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

fn confirmed(
    id: i64,
    from: UserId,
    to: UserId,
    content: &str,
    temp_id: Option<&str>,
) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        sender_id: from,
        receiver_id: to,
        content: Some(content.to_string()),
        attachment: None,
        message_type: MessageKind::Text,
        location_lat: None,
        location_lng: None,
        sender: UserSummary::bare(from, "sender"),
        created_at: Utc::now(),
        edited_at: None,
        temp_id: temp_id.map(str::to_string),
        from: Some(from),
        reactions: Vec::new(),
    }
}

fn reconciler() -> OptimisticReconciler {
    OptimisticReconciler::new(ALICE, ReconcilerConfig::default())
}

#[test]
fn begin_send_renders_a_tagged_speculative_record() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    let first = reconciler.begin_send(OutgoingMessage::text(BOB, "hi"), now);
    let second = reconciler.begin_send(OutgoingMessage::text(BOB, "hi"), now);

    let first_id = first.temp_id.expect("temp id");
    let second_id = second.temp_id.expect("temp id");
    assert!(first_id.starts_with("temp_"));
    assert_ne!(first_id, second_id);
    assert_eq!(reconciler.pending_count(), 2);
    assert!(reconciler.timeline(BOB).iter().all(TimelineEntry::is_pending));
}

#[test]
fn echo_with_temp_id_replaces_the_speculative_record_in_place() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    let sent = reconciler.begin_send(OutgoingMessage::text(BOB, "first"), now);
    reconciler.begin_send(OutgoingMessage::text(BOB, "second"), now);
    let temp_id = sent.temp_id.expect("temp id");

    let outcome = reconciler.apply_confirmed(
        confirmed(10, ALICE, BOB, "first", Some(&temp_id)),
        now,
    );
    assert!(matches!(
        &outcome,
        Confirmation::Reconciled { temp_id: reconciled, message }
            if *reconciled == temp_id && message.id == MessageId(10)
    ));

    let timeline = reconciler.timeline(BOB);
    assert_eq!(timeline.len(), 2);
    assert!(matches!(&timeline[0], TimelineEntry::Confirmed(m) if m.id == MessageId(10)));
    assert!(timeline[1].is_pending());
    assert_eq!(reconciler.pending_count(), 1);
}

#[test]
fn confirmed_message_is_rendered_at_most_once() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    let sent = reconciler.begin_send(OutgoingMessage::text(BOB, "hi"), now);
    let temp_id = sent.temp_id.expect("temp id");
    let echo = confirmed(7, ALICE, BOB, "hi", Some(&temp_id));

    reconciler.apply_confirmed(echo.clone(), now);
    let outcome = reconciler.apply_confirmed(echo, now);
    assert_eq!(
        outcome,
        Confirmation::Duplicate {
            message_id: MessageId(7),
            released: None
        }
    );
    assert_eq!(reconciler.timeline(BOB).len(), 1);
}

#[test]
fn relayed_message_from_peer_is_inserted() {
    let mut reconciler = reconciler();
    let outcome = reconciler.apply_confirmed(confirmed(3, BOB, ALICE, "yo", None), Instant::now());
    assert!(matches!(outcome, Confirmation::Inserted(ref m) if m.id == MessageId(3)));
    assert_eq!(reconciler.timeline(BOB).len(), 1);
}

#[test]
fn content_fallback_matches_echo_without_temp_id_inside_window() {
    let mut reconciler = reconciler();
    let sent_at = Instant::now();
    let sent = reconciler.begin_send(OutgoingMessage::text(BOB, "same"), sent_at);
    let temp_id = sent.temp_id.expect("temp id");

    let outcome = reconciler.apply_confirmed(
        confirmed(4, ALICE, BOB, "same", None),
        sent_at + Duration::from_secs(3),
    );
    assert!(matches!(outcome, Confirmation::Reconciled { temp_id: ref t, .. } if *t == temp_id));
    assert_eq!(reconciler.pending_count(), 0);
}

#[test]
fn content_fallback_expires_after_window() {
    let mut reconciler = reconciler();
    let sent_at = Instant::now();
    reconciler.begin_send(OutgoingMessage::text(BOB, "late"), sent_at);

    let outcome = reconciler.apply_confirmed(
        confirmed(5, ALICE, BOB, "late", None),
        sent_at + Duration::from_secs(6),
    );
    assert!(matches!(outcome, Confirmation::Inserted(_)));
    assert_eq!(reconciler.pending_count(), 1);
}

#[test]
fn content_fallback_can_be_disabled() {
    let mut reconciler = OptimisticReconciler::new(
        ALICE,
        ReconcilerConfig {
            fallback_window: None,
            ..ReconcilerConfig::default()
        },
    );
    let now = Instant::now();
    reconciler.begin_send(OutgoingMessage::text(BOB, "same"), now);
    let outcome = reconciler.apply_confirmed(confirmed(6, ALICE, BOB, "same", None), now);
    assert!(matches!(outcome, Confirmation::Inserted(_)));
}

#[test]
fn unknown_temp_id_does_not_fall_back_to_content() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    reconciler.begin_send(OutgoingMessage::text(BOB, "same"), now);
    let outcome = reconciler.apply_confirmed(
        confirmed(8, ALICE, BOB, "same", Some("temp_from_other_device")),
        now,
    );
    assert!(matches!(outcome, Confirmation::Inserted(_)));
    assert_eq!(reconciler.pending_count(), 1);
}

#[test]
fn sweep_expires_only_old_speculative_records() {
    let mut reconciler = reconciler();
    let start = Instant::now();
    let old = reconciler.begin_send(OutgoingMessage::text(BOB, "old"), start);
    reconciler.begin_send(
        OutgoingMessage::text(BOB, "fresh"),
        start + Duration::from_secs(20),
    );

    let expired = reconciler.sweep(start + Duration::from_secs(30));
    assert_eq!(expired.len(), 1);
    assert_eq!(Some(expired[0].temp_id.clone()), old.temp_id);
    assert_eq!(reconciler.pending_count(), 1);
    assert_eq!(reconciler.timeline(BOB).len(), 1);

    // a late echo for the expired record renders as a fresh message
    let outcome = reconciler.apply_confirmed(
        confirmed(9, ALICE, BOB, "old", old.temp_id.as_deref()),
        start + Duration::from_secs(31),
    );
    assert!(matches!(outcome, Confirmation::Inserted(_)));
}

#[test]
fn history_merge_skips_known_ids_and_keeps_pending_last() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    reconciler.apply_confirmed(confirmed(2, BOB, ALICE, "two", None), now);
    reconciler.begin_send(OutgoingMessage::text(BOB, "pending"), now);

    let added = reconciler.load_history(
        BOB,
        vec![
            confirmed(1, ALICE, BOB, "one", None),
            confirmed(2, BOB, ALICE, "two", None),
        ],
    );
    assert_eq!(added, 1);

    let timeline = reconciler.timeline(BOB);
    assert_eq!(timeline.len(), 3);
    assert!(matches!(&timeline[0], TimelineEntry::Confirmed(m) if m.id == MessageId(1)));
    assert!(matches!(&timeline[1], TimelineEntry::Confirmed(m) if m.id == MessageId(2)));
    assert!(timeline[2].is_pending());
}

#[test]
fn history_then_echo_releases_the_pending_record() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    let sent = reconciler.begin_send(OutgoingMessage::text(BOB, "race"), now);
    let temp_id = sent.temp_id.expect("temp id");
    reconciler.load_history(BOB, vec![confirmed(11, ALICE, BOB, "race", None)]);

    let outcome = reconciler.apply_confirmed(
        confirmed(11, ALICE, BOB, "race", Some(&temp_id)),
        now,
    );
    assert_eq!(
        outcome,
        Confirmation::Duplicate {
            message_id: MessageId(11),
            released: Some(temp_id)
        }
    );
    assert_eq!(reconciler.timeline(BOB).len(), 1);
    assert_eq!(reconciler.pending_count(), 0);
}

#[test]
fn edits_reactions_and_deletes_update_confirmed_records() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    reconciler.apply_confirmed(confirmed(20, BOB, ALICE, "before", None), now);

    let edited_at = Utc::now();
    assert!(reconciler.apply_edit(MessageId(20), "after", edited_at));
    let reaction = ReactionSummary {
        id: shared::domain::ReactionId(1),
        user_id: ALICE,
        reaction_type: "like".to_string(),
        user: UserSummary::bare(ALICE, "alice"),
    };
    assert!(reconciler.apply_reactions(MessageId(20), vec![reaction.clone()]));
    match &reconciler.timeline(BOB)[0] {
        TimelineEntry::Confirmed(message) => {
            assert_eq!(message.content.as_deref(), Some("after"));
            assert_eq!(message.edited_at, Some(edited_at));
            assert_eq!(message.reactions, vec![reaction]);
        }
        other => panic!("unexpected entry {other:?}"),
    }

    assert!(!reconciler.apply_edit(MessageId(99), "missing", edited_at));
    assert!(reconciler.apply_delete(MessageId(20)));
    assert!(reconciler.timeline(BOB).is_empty());

    let outcome = reconciler.apply_confirmed(confirmed(20, BOB, ALICE, "before", None), now);
    assert!(matches!(outcome, Confirmation::Duplicate { .. }));
    assert!(reconciler.timeline(BOB).is_empty());
}

#[test]
fn rollback_withdraws_only_the_named_record() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    let kept = reconciler.begin_send(OutgoingMessage::text(BOB, "kept"), now);
    let failed = reconciler.begin_send(OutgoingMessage::text(BOB, "failed"), now);
    let failed_id = failed.temp_id.expect("temp id");

    let withdrawn = reconciler.rollback(&failed_id).expect("pending record");
    assert_eq!(withdrawn.message.content.as_deref(), Some("failed"));
    assert!(reconciler.rollback(&failed_id).is_none());

    let timeline = reconciler.timeline(BOB);
    assert_eq!(timeline.len(), 1);
    assert!(matches!(
        &timeline[0],
        TimelineEntry::Pending(p) if Some(&p.temp_id) == kept.temp_id.as_ref()
    ));
    assert_eq!(reconciler.pending_count(), 1);
}

#[test]
fn ownership_covers_only_confirmed_messages_sent_by_the_viewer() {
    let mut reconciler = reconciler();
    let now = Instant::now();
    reconciler.apply_confirmed(confirmed(1, ALICE, BOB, "mine", None), now);
    reconciler.apply_confirmed(confirmed(2, BOB, ALICE, "theirs", None), now);

    assert!(reconciler.owns(MessageId(1)));
    assert!(!reconciler.owns(MessageId(2)));
    assert!(!reconciler.owns(MessageId(3)));

    reconciler.apply_delete(MessageId(1));
    assert!(!reconciler.owns(MessageId(1)));
}
