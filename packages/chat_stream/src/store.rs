//! Session Store
//!
//! The single owner of chat state: the session list (always ordered by
//! `updated_at` descending), the active session's message sequence, and the
//! in-flight stream. Optimistic user messages are inserted here and later
//! replaced by the server's confirmed record, or rolled back.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::codec::InboundEvent;
use crate::error::{ChatError, ChatResult};
use crate::models::{
    Message, MessageId, MessagePair, ProvisionalId, ProvisionalMessage, Session, SessionId,
    SessionWithMessages, ThreadMessage,
};
use crate::stream::StreamAggregator;

/// Presentation-facing copy of the store, published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    pub sessions: Vec<Session>,
    pub active_session: Option<SessionId>,
    pub messages: Vec<ThreadMessage>,
}

/// What the caller should do after the active session was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionFallback {
    /// The deleted session was not active; nothing to do.
    Unaffected,
    /// Open this session, the most recent remaining one.
    Select(SessionId),
    /// No sessions remain; create a fresh one.
    CreateNew,
}

/// Effect of applying one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// The user message was confirmed. `replaced` names the provisional
    /// message it superseded, if any.
    Acknowledged { replaced: Option<ProvisionalId> },
    /// A chunk was appended; carries the text accumulated so far.
    Streaming(String),
    /// The assistant turn finished with this confirmed message.
    Completed(Message),
    /// The server reported an error; any partial stream was discarded.
    RemoteError {
        message: String,
        code: Option<String>,
    },
    /// Duplicate or out-of-sequence frame; the store did not change.
    Ignored,
}

#[derive(Debug, Clone)]
struct PendingProvisional {
    id: ProvisionalId,
    previous_updated_at: Option<DateTime<Utc>>,
    /// `updated_at` as left by the insert; rollback only restores over this.
    touched_updated_at: Option<DateTime<Utc>>,
    /// The assistant reply landed before the user message was confirmed.
    reply_received: bool,
}

#[derive(Debug, Clone)]
struct ActiveThread {
    session_id: SessionId,
    messages: Vec<ThreadMessage>,
    pending: Option<PendingProvisional>,
}

impl ActiveThread {
    fn contains_confirmed(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.confirmed_id() == Some(id))
    }

    fn position_of(&self, id: ProvisionalId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.provisional_id() == Some(id))
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
    active: Option<ActiveThread>,
    stream: StreamAggregator,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// Replace the session list with a freshly fetched one.
    pub fn replace_sessions(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions;
        self.resort();
    }

    /// Insert or update one session record (create / rename results).
    pub fn upsert_session(&mut self, session: Session) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
        self.resort();
    }

    /// Remove a deleted session and report which session should become active.
    pub fn remove_session(&mut self, session_id: SessionId) -> DeletionFallback {
        self.sessions.retain(|s| s.id != session_id);
        self.stream.discard(session_id);

        if self.active_session_id() != Some(session_id) {
            return DeletionFallback::Unaffected;
        }
        self.active = None;
        match self.sessions.first() {
            Some(next) => DeletionFallback::Select(next.id),
            None => DeletionFallback::CreateNew,
        }
    }

    /// Make a fetched session the active one, replacing any previous thread.
    pub fn open_session(&mut self, full: SessionWithMessages) {
        if let Some(previous) = self.active_session_id() {
            if previous != full.session.id && self.stream.discard(previous) {
                debug!(session_id = %previous, "discarded partial stream on session switch");
            }
        }

        let session_id = full.session.id;
        let mut messages: Vec<ThreadMessage> = Vec::with_capacity(full.messages.len());
        for mut msg in full.messages {
            if messages.iter().any(|m| m.confirmed_id() == Some(msg.id)) {
                continue;
            }
            msg.session_id.get_or_insert(session_id);
            messages.push(ThreadMessage::Confirmed(msg));
        }

        self.upsert_session(full.session);
        self.active = Some(ActiveThread {
            session_id,
            messages,
            pending: None,
        });
    }

    /// Forget the active thread (teardown or unmount).
    pub fn close_active(&mut self) {
        if let Some(thread) = self.active.take() {
            self.stream.discard(thread.session_id);
        }
    }

    // ── Optimistic updates ──────────────────────────────────────────────

    /// Show a user message immediately, before the server confirms it.
    pub fn insert_provisional(
        &mut self,
        session_id: SessionId,
        text: &str,
    ) -> ChatResult<ProvisionalId> {
        let busy = self.stream.is_open(session_id);
        let thread = self
            .active
            .as_mut()
            .filter(|t| t.session_id == session_id)
            .ok_or(ChatError::SessionNotActive(session_id))?;
        if thread.pending.is_some() || busy {
            return Err(ChatError::Busy(session_id));
        }

        let now = Utc::now();
        let id = ProvisionalId::new();
        thread.messages.push(ThreadMessage::Provisional(ProvisionalMessage {
            id,
            session_id,
            content: text.to_string(),
            created_at: now,
        }));

        let previous_updated_at = self
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.updated_at);
        thread.pending = Some(PendingProvisional {
            id,
            previous_updated_at,
            touched_updated_at: previous_updated_at.map(|previous| previous.max(now)),
            reply_received: false,
        });
        self.touch(session_id, now);
        Ok(id)
    }

    /// Replace a provisional message with its confirmed record.
    ///
    /// If the confirmed record is already present (duplicate delivery), the
    /// provisional message is simply dropped.
    pub fn confirm_provisional(
        &mut self,
        session_id: SessionId,
        provisional_id: ProvisionalId,
        mut confirmed: Message,
    ) {
        confirmed.session_id.get_or_insert(session_id);
        let created_at = confirmed.created_at;

        let Some(thread) = self
            .active
            .as_mut()
            .filter(|t| t.session_id == session_id)
        else {
            self.touch(session_id, created_at);
            return;
        };

        if thread.pending.as_ref().map(|p| p.id) == Some(provisional_id) {
            thread.pending = None;
        }

        match thread.position_of(provisional_id) {
            Some(pos) if thread.contains_confirmed(confirmed.id) => {
                thread.messages.remove(pos);
            }
            Some(pos) => {
                thread.messages[pos] = ThreadMessage::Confirmed(confirmed);
            }
            None => {
                if !thread.contains_confirmed(confirmed.id) {
                    thread.messages.push(ThreadMessage::Confirmed(confirmed));
                }
            }
        }
        self.touch(session_id, created_at);
    }

    /// Apply a confirmed message that has no provisional counterpart.
    /// Returns false when it was already known.
    pub fn apply_confirmed(&mut self, session_id: SessionId, mut confirmed: Message) -> bool {
        confirmed.session_id.get_or_insert(session_id);
        let created_at = confirmed.created_at;

        let inserted = match self
            .active
            .as_mut()
            .filter(|t| t.session_id == session_id)
        {
            Some(thread) if thread.contains_confirmed(confirmed.id) => return false,
            Some(thread) => {
                thread.messages.push(ThreadMessage::Confirmed(confirmed));
                true
            }
            // Not on screen; only the list order changes.
            None => false,
        };
        self.touch(session_id, created_at);
        inserted
    }

    /// Reconcile a fallback send: replace the provisional message with the
    /// confirmed user message and append the assistant reply.
    pub fn apply_pair(
        &mut self,
        session_id: SessionId,
        provisional_id: ProvisionalId,
        pair: MessagePair,
    ) {
        self.confirm_provisional(session_id, provisional_id, pair.user_message);
        self.apply_confirmed(session_id, pair.assistant_message);
    }

    /// Undo an optimistic insert, returning the text for the caller to restore.
    pub fn rollback_provisional(
        &mut self,
        session_id: SessionId,
        provisional_id: ProvisionalId,
    ) -> Option<String> {
        let thread = self
            .active
            .as_mut()
            .filter(|t| t.session_id == session_id)?;
        let pos = thread.position_of(provisional_id)?;
        let removed = thread.messages.remove(pos);

        if let Some(pending) = thread
            .pending
            .take_if(|p| p.id == provisional_id)
        {
            if let Some(previous) = pending.previous_updated_at {
                // A confirmation since the insert owns the newer timestamp.
                if let Some(session) = self
                    .sessions
                    .iter_mut()
                    .find(|s| s.id == session_id)
                    .filter(|s| Some(s.updated_at) == pending.touched_updated_at)
                {
                    session.updated_at = previous;
                }
                self.resort();
            }
        }
        Some(removed.content().to_string())
    }

    /// The provisional message awaiting confirmation for a session.
    pub fn pending_provisional(&self, session_id: SessionId) -> Option<ProvisionalId> {
        self.pending(session_id).map(|p| p.id)
    }

    // ── Inbound frames ──────────────────────────────────────────────────

    /// Apply one decoded frame from `session_id`'s connection.
    pub fn apply_frame(&mut self, session_id: SessionId, event: InboundEvent) -> FrameOutcome {
        match event {
            InboundEvent::UserMessageAck(msg) => {
                if self.is_known(session_id, &msg) {
                    debug!(session_id = %session_id, message_id = %msg.id, "duplicate user message ack");
                    return FrameOutcome::Ignored;
                }
                let replaced = self.pending_provisional(session_id);
                let reply_received = self
                    .pending(session_id)
                    .is_some_and(|p| p.reply_received);
                match replaced {
                    Some(provisional_id) => self.confirm_provisional(session_id, provisional_id, msg),
                    None => {
                        self.apply_confirmed(session_id, msg);
                    }
                }
                if reply_received {
                    debug!(session_id = %session_id, "late ack closes an already completed turn");
                } else {
                    self.stream.arm(session_id);
                }
                FrameOutcome::Acknowledged { replaced }
            }
            InboundEvent::Chunk(text) => match self.stream.push_chunk(session_id, &text) {
                Ok(accumulated) => FrameOutcome::Streaming(accumulated.to_string()),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "dropping chunk");
                    FrameOutcome::Ignored
                }
            },
            InboundEvent::Done(msg) => {
                match self.stream.finish(session_id) {
                    Some(aggregated) if aggregated != msg.content => {
                        warn!(
                            session_id = %session_id,
                            message_id = %msg.id,
                            streamed = aggregated.len(),
                            confirmed = msg.content.len(),
                            "streamed text differs from confirmed message, keeping confirmed"
                        );
                    }
                    Some(_) => {}
                    None => {
                        debug!(session_id = %session_id, message_id = %msg.id, "done without open turn");
                        if let Some(pending) = self.pending_mut(session_id) {
                            pending.reply_received = true;
                        }
                    }
                }
                if self.is_known(session_id, &msg) {
                    return FrameOutcome::Ignored;
                }
                self.apply_confirmed(session_id, msg.clone());
                FrameOutcome::Completed(msg)
            }
            InboundEvent::Error { message, code } => {
                if self.stream.discard(session_id) {
                    debug!(session_id = %session_id, "discarded partial stream after remote error");
                }
                FrameOutcome::RemoteError { message, code }
            }
        }
    }

    /// Drop any in-flight stream for a session.
    pub fn discard_stream(&mut self, session_id: SessionId) -> bool {
        self.stream.discard(session_id)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|t| t.session_id)
    }

    pub fn active_session(&self) -> Option<&Session> {
        let id = self.active_session_id()?;
        self.sessions.iter().find(|s| s.id == id)
    }

    /// The active session's message sequence (empty when none is active).
    pub fn messages(&self) -> &[ThreadMessage] {
        self.active
            .as_ref()
            .map(|t| t.messages.as_slice())
            .unwrap_or(&[])
    }

    /// Text streamed so far for the session's in-flight assistant response.
    pub fn streaming_text(&self, session_id: SessionId) -> Option<&str> {
        self.stream
            .current(session_id)
            .map(|state| state.buffer.as_str())
    }

    /// Whether an assistant turn is open (acknowledged or streaming).
    pub fn turn_open(&self, session_id: SessionId) -> bool {
        self.stream.is_open(session_id)
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            sessions: self.sessions.clone(),
            active_session: self.active_session_id(),
            messages: self.messages().to_vec(),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn pending(&self, session_id: SessionId) -> Option<&PendingProvisional> {
        self.active
            .as_ref()
            .filter(|t| t.session_id == session_id)?
            .pending
            .as_ref()
    }

    fn pending_mut(&mut self, session_id: SessionId) -> Option<&mut PendingProvisional> {
        self.active
            .as_mut()
            .filter(|t| t.session_id == session_id)?
            .pending
            .as_mut()
    }

    fn is_known(&self, session_id: SessionId, msg: &Message) -> bool {
        self.active
            .as_ref()
            .filter(|t| t.session_id == session_id)
            .is_some_and(|t| t.contains_confirmed(msg.id))
    }

    /// Bump a session's `updated_at` (never backwards) and re-sort.
    fn touch(&mut self, session_id: SessionId, at: DateTime<Utc>) {
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
            if at > session.updated_at {
                session.updated_at = at;
            }
        }
        self.resort();
    }

    fn resort(&mut self) {
        self.sessions
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn session(id: i64, updated_minute: i64) -> Session {
        Session {
            id: SessionId(id),
            user_id: 1,
            title: format!("Session {id}"),
            created_at: at(0),
            updated_at: at(updated_minute),
        }
    }

    fn message(id: i64, role: Role, content: &str) -> Message {
        Message {
            id: MessageId(id),
            session_id: None,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    fn store_with_active(id: i64) -> SessionStore {
        let mut store = SessionStore::new();
        store.replace_sessions(vec![session(1, 10), session(2, 20), session(3, 30)]);
        store.open_session(SessionWithMessages {
            session: session(id, id * 10),
            messages: vec![],
        });
        store
    }

    fn contents(store: &SessionStore) -> Vec<(Role, String, bool)> {
        store
            .messages()
            .iter()
            .map(|m| (m.role(), m.content().to_string(), m.is_provisional()))
            .collect()
    }

    #[test]
    fn test_sessions_sorted_by_updated_at_desc() {
        let mut store = SessionStore::new();
        store.replace_sessions(vec![session(1, 5), session(2, 50), session(3, 20)]);
        let ids: Vec<i64> = store.sessions().iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_duplex_scenario() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        let pid = store.insert_provisional(sid, "hi").unwrap();
        assert_eq!(contents(&store), vec![(Role::User, "hi".into(), true)]);
        assert_eq!(store.sessions()[0].id, sid);

        let out = store.apply_frame(sid, InboundEvent::UserMessageAck(message(10, Role::User, "hi")));
        assert_eq!(out, FrameOutcome::Acknowledged { replaced: Some(pid) });
        assert_eq!(store.apply_frame(sid, InboundEvent::Chunk("Hel".into())), FrameOutcome::Streaming("Hel".into()));
        assert_eq!(store.apply_frame(sid, InboundEvent::Chunk("lo".into())), FrameOutcome::Streaming("Hello".into()));
        assert_eq!(store.streaming_text(sid), Some("Hello"));

        let done = message(11, Role::Assistant, "Hello");
        assert_eq!(
            store.apply_frame(sid, InboundEvent::Done(done.clone())),
            FrameOutcome::Completed(done)
        );

        assert_eq!(
            contents(&store),
            vec![
                (Role::User, "hi".into(), false),
                (Role::Assistant, "Hello".into(), false)
            ]
        );
        assert!(!store.turn_open(sid));
        assert_eq!(store.streaming_text(sid), None);
        assert_eq!(store.pending_provisional(sid), None);
    }

    #[test]
    fn test_provisional_replaced_in_place_not_by_content() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        // An earlier confirmed message with identical text must stay untouched.
        store.apply_confirmed(sid, message(5, Role::User, "same"));
        let pid = store.insert_provisional(sid, "same").unwrap();
        store.confirm_provisional(sid, pid, message(6, Role::User, "same"));

        let ids: Vec<Option<MessageId>> = store.messages().iter().map(|m| m.confirmed_id()).collect();
        assert_eq!(ids, vec![Some(MessageId(5)), Some(MessageId(6))]);
    }

    #[test]
    fn test_duplicate_ack_is_ignored_and_keeps_stream() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        store.insert_provisional(sid, "hi").unwrap();
        store.apply_frame(sid, InboundEvent::UserMessageAck(message(10, Role::User, "hi")));
        store.apply_frame(sid, InboundEvent::Chunk("par".into()));

        let dup = store.apply_frame(sid, InboundEvent::UserMessageAck(message(10, Role::User, "hi")));
        assert_eq!(dup, FrameOutcome::Ignored);
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.streaming_text(sid), Some("par"));
    }

    #[test]
    fn test_duplicate_done_is_ignored() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        store.apply_confirmed(sid, message(11, Role::Assistant, "x"));
        let out = store.apply_frame(sid, InboundEvent::Done(message(11, Role::Assistant, "x")));
        assert_eq!(out, FrameOutcome::Ignored);
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn test_chunk_without_turn_is_noop() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        store.apply_confirmed(sid, message(1, Role::User, "a"));
        let before = store.snapshot();
        assert_eq!(store.apply_frame(sid, InboundEvent::Chunk("stray".into())), FrameOutcome::Ignored);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_remote_error_discards_partial_stream() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        store.insert_provisional(sid, "hi").unwrap();
        store.apply_frame(sid, InboundEvent::UserMessageAck(message(10, Role::User, "hi")));
        store.apply_frame(sid, InboundEvent::Chunk("half an ans".into()));
        let out = store.apply_frame(
            sid,
            InboundEvent::Error {
                message: "boom".into(),
                code: Some("PROCESSING_ERROR".into()),
            },
        );
        assert!(matches!(out, FrameOutcome::RemoteError { ref message, .. } if message == "boom"));
        assert_eq!(store.streaming_text(sid), None);
        assert_eq!(contents(&store), vec![(Role::User, "hi".into(), false)]);
    }

    #[test]
    fn test_rollback_restores_sequence_and_order() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        store.apply_confirmed(sid, message(1, Role::User, "old"));
        let before = store.snapshot();

        let pid = store.insert_provisional(sid, "try me").unwrap();
        assert_eq!(store.sessions()[0].id, sid);
        assert_eq!(store.rollback_provisional(sid, pid).as_deref(), Some("try me"));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.pending_provisional(sid), None);
    }

    #[test]
    fn test_second_send_is_busy() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        store.insert_provisional(sid, "one").unwrap();
        assert_eq!(store.insert_provisional(sid, "two"), Err(ChatError::Busy(sid)));

        // Still busy while the assistant turn is open after the ack.
        store.apply_frame(sid, InboundEvent::UserMessageAck(message(10, Role::User, "one")));
        assert_eq!(store.insert_provisional(sid, "two"), Err(ChatError::Busy(sid)));

        store.apply_frame(sid, InboundEvent::Done(message(11, Role::Assistant, "")));
        assert!(store.insert_provisional(sid, "two").is_ok());
    }

    #[test]
    fn test_send_to_inactive_session_rejected() {
        let mut store = store_with_active(1);
        assert_eq!(
            store.insert_provisional(SessionId(2), "hi"),
            Err(ChatError::SessionNotActive(SessionId(2)))
        );
    }

    #[test]
    fn test_apply_pair() {
        let mut store = store_with_active(2);
        let sid = SessionId(2);
        let pid = store.insert_provisional(sid, "hi").unwrap();
        store.apply_pair(
            sid,
            pid,
            MessagePair {
                user_message: message(20, Role::User, "hi"),
                assistant_message: message(21, Role::Assistant, "ok"),
            },
        );
        assert_eq!(
            contents(&store),
            vec![
                (Role::User, "hi".into(), false),
                (Role::Assistant, "ok".into(), false)
            ]
        );
    }

    #[test]
    fn test_delete_active_selects_next_most_recent() {
        let mut store = store_with_active(3);
        assert_eq!(store.remove_session(SessionId(3)), DeletionFallback::Select(SessionId(2)));
        assert_eq!(store.active_session_id(), None);
        assert_eq!(store.remove_session(SessionId(1)), DeletionFallback::Unaffected);
    }

    #[test]
    fn test_delete_last_session_requests_new() {
        let mut store = SessionStore::new();
        store.open_session(SessionWithMessages {
            session: session(9, 1),
            messages: vec![],
        });
        assert_eq!(store.remove_session(SessionId(9)), DeletionFallback::CreateNew);
        assert!(store.sessions().is_empty());
    }

    #[test]
    fn test_confirmation_bumps_updated_at() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        assert_eq!(store.sessions().last().unwrap().id, sid);
        store.apply_confirmed(sid, message(1, Role::Assistant, "late"));
        assert_eq!(store.sessions()[0].id, sid);
    }

    #[test]
    fn test_confirmation_for_inactive_session_only_reorders() {
        let mut store = store_with_active(3);
        assert!(!store.apply_confirmed(SessionId(1), message(7, Role::Assistant, "elsewhere")));
        assert_eq!(store.sessions()[0].id, SessionId(1));
        assert!(store.messages().is_empty());
    }

    #[test]
    fn test_done_before_ack_leaves_no_open_turn() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        let pid = store.insert_provisional(sid, "hi").unwrap();

        let out = store.apply_frame(sid, InboundEvent::Done(message(11, Role::Assistant, "ok")));
        assert!(matches!(out, FrameOutcome::Completed(_)));
        let out = store.apply_frame(sid, InboundEvent::UserMessageAck(message(10, Role::User, "hi")));
        assert_eq!(out, FrameOutcome::Acknowledged { replaced: Some(pid) });

        assert!(!store.turn_open(sid));
        assert_eq!(
            contents(&store),
            vec![
                (Role::User, "hi".into(), false),
                (Role::Assistant, "ok".into(), false)
            ]
        );
        assert!(store.insert_provisional(sid, "next").is_ok());
    }

    #[test]
    fn test_rollback_keeps_newer_confirmation_timestamp() {
        let mut store = store_with_active(1);
        let sid = SessionId(1);
        let pid = store.insert_provisional(sid, "hi").unwrap();

        // Another sender's message lands while ours is in flight.
        let mut other = message(20, Role::User, "from elsewhere");
        other.created_at = Utc::now() + Duration::minutes(5);
        let confirmed_at = other.created_at;
        assert!(store.apply_confirmed(sid, other));

        assert_eq!(store.rollback_provisional(sid, pid).as_deref(), Some("hi"));
        let session = store.sessions().iter().find(|s| s.id == sid).unwrap();
        assert_eq!(session.updated_at, confirmed_at);
        assert_eq!(store.sessions()[0].id, sid);
        assert_eq!(contents(&store), vec![(Role::User, "from elsewhere".into(), false)]);
    }

    #[test]
    fn test_open_session_dedupes_history() {
        let mut store = SessionStore::new();
        store.open_session(SessionWithMessages {
            session: session(4, 4),
            messages: vec![message(1, Role::User, "a"), message(1, Role::User, "a")],
        });
        assert_eq!(store.messages().len(), 1);
        match &store.messages()[0] {
            ThreadMessage::Confirmed(m) => assert_eq!(m.session_id, Some(SessionId(4))),
            other => panic!("expected confirmed message, got {other:?}"),
        }
    }
}
