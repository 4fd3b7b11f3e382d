use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use chat_stream::codec::InboundEvent;
use chat_stream::models::{
    Message, MessageId, Role, Session, SessionId, SessionWithMessages,
};
use chat_stream::store::{DeletionFallback, FrameOutcome, SessionStore};

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
}

fn session(id: i64, updated_minute: i64) -> Session {
    Session {
        id: SessionId(id),
        user_id: 1,
        title: format!("s{id}"),
        created_at: at(0),
        updated_at: at(updated_minute),
    }
}

fn message(id: i64, role: Role, content: &str, minute: i64) -> Message {
    Message {
        id: MessageId(id),
        session_id: None,
        role,
        content: content.to_string(),
        created_at: at(minute),
    }
}

fn assert_sorted(store: &SessionStore) -> Result<(), TestCaseError> {
    for pair in store.sessions().windows(2) {
        let ordered = pair[0].updated_at > pair[1].updated_at
            || (pair[0].updated_at == pair[1].updated_at && pair[0].id > pair[1].id);
        prop_assert!(ordered, "{:?} before {:?}", pair[0], pair[1]);
    }
    Ok(())
}

/// Distinct session ids with arbitrary update times.
fn arb_sessions() -> impl Strategy<Value = Vec<Session>> {
    prop::collection::btree_map(1i64..500, 0i64..10_000, 1..12)
        .prop_map(|m| m.into_iter().map(|(id, minute)| session(id, minute)).collect())
}

#[derive(Debug, Clone)]
enum Op {
    Upsert { id: i64, minute: i64 },
    Confirm { id: i64, minute: i64 },
    SendAndRollback,
    SendAndConfirm { id: i64, minute: i64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..20, 0i64..20_000).prop_map(|(id, minute)| Op::Upsert { id, minute }),
        (1000i64..2000, 0i64..20_000).prop_map(|(id, minute)| Op::Confirm { id, minute }),
        Just(Op::SendAndRollback),
        (2000i64..3000, 0i64..20_000).prop_map(|(id, minute)| Op::SendAndConfirm { id, minute }),
    ]
}

// --- Stream aggregation ---

proptest! {
    #[test]
    fn chunks_concatenate_in_arrival_order(chunks in prop::collection::vec(".{0,12}", 0..20)) {
        let sid = SessionId(1);
        let mut store = SessionStore::new();
        store.open_session(SessionWithMessages { session: session(1, 0), messages: vec![] });
        store.insert_provisional(sid, "q").unwrap();
        store.apply_frame(sid, InboundEvent::UserMessageAck(message(1, Role::User, "q", 1)));

        for chunk in &chunks {
            store.apply_frame(sid, InboundEvent::Chunk(chunk.clone()));
        }
        let expected = chunks.concat();
        if !chunks.is_empty() {
            prop_assert_eq!(store.streaming_text(sid), Some(expected.as_str()));
        }

        let outcome = store.apply_frame(
            sid,
            InboundEvent::Done(message(2, Role::Assistant, &expected, 2)),
        );
        prop_assert!(matches!(outcome, FrameOutcome::Completed(_)));
        prop_assert_eq!(store.messages().len(), 2);
        prop_assert_eq!(store.messages()[1].content(), expected.as_str());
        prop_assert!(!store.turn_open(sid));
        prop_assert_eq!(store.streaming_text(sid), None);
    }

    #[test]
    fn chunk_without_turn_never_mutates(
        history in prop::collection::vec(".{0,8}", 0..6),
        stray in ".{0,16}",
    ) {
        let sid = SessionId(7);
        let mut store = SessionStore::new();
        let messages = history
            .iter()
            .enumerate()
            .map(|(i, text)| message(i as i64 + 1, Role::User, text, i as i64))
            .collect();
        store.open_session(SessionWithMessages { session: session(7, 0), messages });

        let before = store.snapshot();
        prop_assert_eq!(store.apply_frame(sid, InboundEvent::Chunk(stray)), FrameOutcome::Ignored);
        prop_assert_eq!(store.snapshot(), before);
    }
}

// --- Session ordering and rollback ---

proptest! {
    #[test]
    fn sessions_stay_sorted(sessions in arb_sessions(), ops in prop::collection::vec(arb_op(), 0..30)) {
        let active = sessions[0].id;
        let mut store = SessionStore::new();
        store.replace_sessions(sessions.clone());
        assert_sorted(&store)?;
        store.open_session(SessionWithMessages { session: sessions[0].clone(), messages: vec![] });
        assert_sorted(&store)?;

        for op in ops {
            match op {
                Op::Upsert { id, minute } => store.upsert_session(session(id, minute)),
                Op::Confirm { id, minute } => {
                    store.apply_confirmed(active, message(id, Role::Assistant, "a", minute));
                }
                Op::SendAndRollback => {
                    let pid = store.insert_provisional(active, "x").unwrap();
                    assert_sorted(&store)?;
                    store.rollback_provisional(active, pid);
                }
                Op::SendAndConfirm { id, minute } => {
                    let pid = store.insert_provisional(active, "y").unwrap();
                    assert_sorted(&store)?;
                    store.confirm_provisional(active, pid, message(id, Role::User, "y", minute));
                }
            }
            assert_sorted(&store)?;
        }
    }

    #[test]
    fn rollback_restores_state(sessions in arb_sessions(), text in ".{1,40}") {
        let active = sessions[sessions.len() - 1].id;
        let mut store = SessionStore::new();
        store.replace_sessions(sessions.clone());
        let full = sessions.iter().find(|s| s.id == active).cloned().unwrap();
        store.open_session(SessionWithMessages {
            session: full,
            messages: vec![message(1, Role::User, "earlier", 0)],
        });

        let before = store.snapshot();
        let pid = store.insert_provisional(active, &text).unwrap();
        prop_assert_eq!(store.messages().len(), 2);
        prop_assert_eq!(store.rollback_provisional(active, pid), Some(text));
        prop_assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn deleting_active_selects_most_recent_remaining(
        sessions in arb_sessions(),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut store = SessionStore::new();
        store.replace_sessions(sessions.clone());
        let active = pick.get(store.sessions()).clone();
        store.open_session(SessionWithMessages { session: active.clone(), messages: vec![] });

        let fallback = store.remove_session(active.id);
        prop_assert_eq!(store.active_session_id(), None);
        match store.sessions().first() {
            Some(next) => {
                prop_assert_eq!(fallback, DeletionFallback::Select(next.id));
                prop_assert!(store.sessions().iter().all(|s| s.updated_at <= next.updated_at));
            }
            None => prop_assert_eq!(fallback, DeletionFallback::CreateNew),
        }
        prop_assert!(store.sessions().iter().all(|s| s.id != active.id));
    }
}
