//! Aggregation of incremental `chunk` frames into one assistant message.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::ChatError;
use crate::models::SessionId;

/// In-flight assistant response for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub buffer: String,
    pub is_streaming: bool,
}

/// Per-session turn tracker. At most one turn exists per session.
///
/// A turn is `None` between the `user_message` ack and the first chunk.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    turns: HashMap<SessionId, Option<StreamState>>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `user_message` ack was received: the next `chunk` opens the stream.
    pub fn arm(&mut self, session_id: SessionId) {
        match self.turns.get(&session_id) {
            Some(Some(state)) => {
                warn!(
                    session_id = %session_id,
                    buffered = state.buffer.len(),
                    "ack arrived while a stream was open, discarding partial buffer"
                );
            }
            Some(None) => {
                debug!(session_id = %session_id, "duplicate ack for pending turn");
            }
            None => {}
        }
        self.turns.insert(session_id, None);
    }

    /// Append a chunk verbatim. Returns the accumulated text so far.
    pub fn push_chunk(&mut self, session_id: SessionId, text: &str) -> Result<&str, ChatError> {
        let Some(phase) = self.turns.get_mut(&session_id) else {
            return Err(ChatError::ProtocolViolation(format!(
                "chunk for session {session_id} with no open stream"
            )));
        };
        let state = phase.get_or_insert_with(|| StreamState {
            buffer: String::new(),
            is_streaming: true,
        });
        state.buffer.push_str(text);
        Ok(&state.buffer)
    }

    /// Close the turn on `done`, returning the aggregated text.
    ///
    /// Returns `None` when no turn was open for the session.
    pub fn finish(&mut self, session_id: SessionId) -> Option<String> {
        let phase = self.turns.remove(&session_id)?;
        Some(phase.map(|state| state.buffer).unwrap_or_default())
    }

    /// Drop any turn for the session. Returns whether partial text was lost.
    pub fn discard(&mut self, session_id: SessionId) -> bool {
        matches!(
            self.turns.remove(&session_id),
            Some(Some(ref state)) if !state.buffer.is_empty()
        )
    }

    /// The open stream for a session, if content has started arriving.
    pub fn current(&self, session_id: SessionId) -> Option<&StreamState> {
        self.turns.get(&session_id)?.as_ref()
    }

    /// Whether a turn (armed or streaming) is open for the session.
    pub fn is_open(&self, session_id: SessionId) -> bool {
        self.turns.contains_key(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    #[test]
    fn test_chunks_concatenate_in_arrival_order() {
        let pieces = ["Hel", "lo", ", ", "", "wörld", "!"];
        let mut agg = StreamAggregator::new();
        agg.arm(A);
        for p in pieces {
            agg.push_chunk(A, p).unwrap();
        }
        assert_eq!(agg.current(A).unwrap().buffer, pieces.concat());
        assert!(agg.current(A).unwrap().is_streaming);
        assert_eq!(agg.finish(A).as_deref(), Some("Hello, wörld!"));
        assert!(!agg.is_open(A));
    }

    #[test]
    fn test_chunk_without_turn_is_violation() {
        let mut agg = StreamAggregator::new();
        assert!(matches!(
            agg.push_chunk(A, "x"),
            Err(ChatError::ProtocolViolation(_))
        ));
        assert!(agg.current(A).is_none());
    }

    #[test]
    fn test_stream_opens_on_first_chunk_not_on_ack() {
        let mut agg = StreamAggregator::new();
        agg.arm(A);
        assert!(agg.is_open(A));
        assert!(agg.current(A).is_none());
        agg.push_chunk(A, "a").unwrap();
        assert!(agg.current(A).is_some());
    }

    #[test]
    fn test_done_without_chunks_yields_empty_text() {
        let mut agg = StreamAggregator::new();
        agg.arm(A);
        assert_eq!(agg.finish(A).as_deref(), Some(""));
        assert_eq!(agg.finish(A), None);
    }

    #[test]
    fn test_discard_drops_partial_buffer() {
        let mut agg = StreamAggregator::new();
        agg.arm(A);
        agg.push_chunk(A, "partial").unwrap();
        assert!(agg.discard(A));
        assert!(!agg.is_open(A));
        assert!(!agg.discard(A));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut agg = StreamAggregator::new();
        agg.arm(A);
        agg.arm(B);
        agg.push_chunk(A, "a1").unwrap();
        agg.push_chunk(B, "b1").unwrap();
        agg.push_chunk(A, "a2").unwrap();
        assert_eq!(agg.finish(B).as_deref(), Some("b1"));
        assert_eq!(agg.current(A).unwrap().buffer, "a1a2");
    }

    #[test]
    fn test_rearm_resets_open_stream() {
        let mut agg = StreamAggregator::new();
        agg.arm(A);
        agg.push_chunk(A, "stale").unwrap();
        agg.arm(A);
        agg.push_chunk(A, "fresh").unwrap();
        assert_eq!(agg.finish(A).as_deref(), Some("fresh"));
    }
}
