//! Chat client actor.
//!
//! One task owns the [`SessionStore`] and the current [`ConnectionManager`].
//! User commands, connection events and the results of HTTP calls all
//! arrive as messages on that task, so every state transition happens in one
//! place. HTTP calls run on spawned tasks and never hold up frame handling.
//! Presentation code talks to it through a cloneable [`ChatHandle`] and
//! observes it through `watch` signals.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::api::{ChatApi, HttpChatApi};
use crate::codec::{InboundEvent, OutboundFrame};
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStatus};
use crate::error::{ChatError, ChatResult, SendError};
use crate::models::{MessagePair, ProvisionalId, Session, SessionId, SessionPage, SessionWithMessages};
use crate::store::{ChatSnapshot, DeletionFallback, FrameOutcome, SessionStore};
use crate::transport::{Route, select_route};

const COMMAND_BUFFER: usize = 32;

/// Commands accepted by the client actor.
#[derive(Debug)]
enum ChatCommand {
    SendUserMessage {
        session_id: SessionId,
        text: String,
        respond_to: oneshot::Sender<Result<(), SendError>>,
    },
    LoadSessions {
        respond_to: oneshot::Sender<ChatResult<Vec<Session>>>,
    },
    SelectSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<ChatResult<()>>,
    },
    CreateSession {
        title: Option<String>,
        respond_to: oneshot::Sender<ChatResult<Session>>,
    },
    RenameSession {
        session_id: SessionId,
        title: String,
        respond_to: oneshot::Sender<ChatResult<Session>>,
    },
    /// Responds with the session that became active, if the deleted one was.
    DeleteSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<ChatResult<Option<SessionId>>>,
    },
    Reconnect {
        respond_to: oneshot::Sender<ChatResult<()>>,
    },
    Dispose {
        respond_to: oneshot::Sender<()>,
    },
}

/// Result of an HTTP call, reported back from its task.
#[derive(Debug)]
enum TaskResult {
    Fallback {
        session_id: SessionId,
        provisional_id: ProvisionalId,
        result: ChatResult<MessagePair>,
    },
    Listed {
        result: ChatResult<SessionPage>,
        respond_to: oneshot::Sender<ChatResult<Vec<Session>>>,
    },
    Fetched {
        session_id: SessionId,
        selection: u64,
        result: ChatResult<SessionWithMessages>,
        reply: OpenReply,
    },
    Created {
        result: ChatResult<Session>,
        reply: CreateReply,
    },
    Renamed {
        result: ChatResult<Session>,
        respond_to: oneshot::Sender<ChatResult<Session>>,
    },
    Deleted {
        session_id: SessionId,
        result: ChatResult<()>,
        respond_to: oneshot::Sender<ChatResult<Option<SessionId>>>,
    },
}

/// Who is waiting for a session to open.
#[derive(Debug)]
enum OpenReply {
    Select(oneshot::Sender<ChatResult<()>>),
    /// The session replaces one that was just deleted.
    AfterDelete(oneshot::Sender<ChatResult<Option<SessionId>>>),
}

impl OpenReply {
    fn send(self, session_id: SessionId, result: ChatResult<()>) {
        match self {
            OpenReply::Select(tx) => {
                let _ = tx.send(result);
            }
            OpenReply::AfterDelete(tx) => {
                let _ = tx.send(result.map(|()| Some(session_id)));
            }
        }
    }

    /// A newer selection won; the session was never opened.
    fn superseded(self) {
        match self {
            OpenReply::Select(tx) => {
                let _ = tx.send(Err(ChatError::Aborted));
            }
            // The delete itself succeeded.
            OpenReply::AfterDelete(tx) => {
                let _ = tx.send(Ok(None));
            }
        }
    }
}

/// Who is waiting for a session to be created.
#[derive(Debug)]
enum CreateReply {
    Caller(oneshot::Sender<ChatResult<Session>>),
    /// No sessions remained after a delete; open the new one.
    AfterDelete(oneshot::Sender<ChatResult<Option<SessionId>>>),
}

/// The one exchange allowed in flight.
#[derive(Debug)]
struct PendingSend {
    session_id: SessionId,
    provisional_id: ProvisionalId,
    text: String,
    route: Route,
    /// The server confirmed the user message (duplex only).
    acked: bool,
    /// The assistant reply was applied before the ack arrived.
    reply_applied: bool,
    respond_to: oneshot::Sender<Result<(), SendError>>,
}

struct Signals {
    status: watch::Sender<ConnectionStatus>,
    streaming: watch::Sender<Option<String>>,
    snapshot: watch::Sender<ChatSnapshot>,
    last_error: watch::Sender<Option<ChatError>>,
}

/// Handle to the chat client actor.
#[derive(Clone)]
pub struct ChatHandle {
    sender: mpsc::Sender<ChatCommand>,
    status: watch::Receiver<ConnectionStatus>,
    streaming: watch::Receiver<Option<String>>,
    snapshot: watch::Receiver<ChatSnapshot>,
    last_error: watch::Receiver<Option<ChatError>>,
}

impl ChatHandle {
    /// Send a user message to `session_id`, which must be the active session.
    ///
    /// Resolves once the exchange is complete: the assistant reply has been
    /// confirmed and applied, or the exchange failed. On failure the
    /// optimistic message is rolled back when it was never confirmed, and
    /// its text is returned in [`SendError::restored_text`].
    pub async fn send_user_message(
        &self,
        session_id: SessionId,
        text: impl Into<String>,
    ) -> Result<(), SendError> {
        let text = text.into();
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ChatCommand::SendUserMessage {
                session_id,
                text: text.clone(),
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Err(SendError::rolled_back(ChatError::Closed, text));
        }
        rx.await
            .unwrap_or_else(|_| Err(SendError::rolled_back(ChatError::Closed, text)))
    }

    /// Fetch the first page of sessions, most recent first.
    pub async fn load_sessions(&self) -> ChatResult<Vec<Session>> {
        self.request(|respond_to| ChatCommand::LoadSessions { respond_to })
            .await
    }

    /// Make `session_id` active: fetch its history and connect to it.
    pub async fn select_session(&self, session_id: SessionId) -> ChatResult<()> {
        self.request(|respond_to| ChatCommand::SelectSession {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn create_session(&self, title: Option<String>) -> ChatResult<Session> {
        self.request(|respond_to| ChatCommand::CreateSession { title, respond_to })
            .await
    }

    pub async fn rename_session(
        &self,
        session_id: SessionId,
        title: impl Into<String>,
    ) -> ChatResult<Session> {
        let title = title.into();
        self.request(|respond_to| ChatCommand::RenameSession {
            session_id,
            title,
            respond_to,
        })
        .await
    }

    /// Delete a session. If it was active, the next most recent session (or
    /// a freshly created one) becomes active and is returned.
    pub async fn delete_session(&self, session_id: SessionId) -> ChatResult<Option<SessionId>> {
        self.request(|respond_to| ChatCommand::DeleteSession {
            session_id,
            respond_to,
        })
        .await
    }

    /// Re-establish the duplex connection for the active session.
    pub async fn reconnect(&self) -> ChatResult<()> {
        self.request(|respond_to| ChatCommand::Reconnect { respond_to })
            .await
    }

    /// Tear everything down. In-flight sends resolve with `Aborted`.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ChatCommand::Dispose { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Text of the assistant response currently streaming, if any.
    pub fn streaming_text(&self) -> watch::Receiver<Option<String>> {
        self.streaming.clone()
    }

    pub fn snapshot(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot.clone()
    }

    /// The most recent user-visible error.
    pub fn last_error(&self) -> watch::Receiver<Option<ChatError>> {
        self.last_error.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<ChatResult<T>>) -> ChatCommand,
    ) -> ChatResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| ChatError::Closed)?;
        rx.await.map_err(|_| ChatError::Closed)?
    }
}

pub struct ChatClient {
    config: ClientConfig,
    token: String,
    api: Arc<dyn ChatApi>,
    store: SessionStore,
    connection: Option<ConnectionManager>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    pending: Option<PendingSend>,
    /// Bumped per session-open request; older fetches are dropped.
    selection: u64,
    tasks_tx: mpsc::UnboundedSender<TaskResult>,
    tasks_rx: mpsc::UnboundedReceiver<TaskResult>,
    signals: Signals,
    receiver: mpsc::Receiver<ChatCommand>,
}

impl ChatClient {
    /// Spawn the client actor and return its handle.
    pub fn init(config: ClientConfig, api: Arc<dyn ChatApi>, token: impl Into<String>) -> ChatHandle {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (streaming, streaming_rx) = watch::channel(None);
        let (snapshot, snapshot_rx) = watch::channel(ChatSnapshot::default());
        let (last_error, last_error_rx) = watch::channel(None);

        let actor = ChatClient {
            config,
            token: token.into(),
            api,
            store: SessionStore::new(),
            connection: None,
            events: None,
            pending: None,
            selection: 0,
            tasks_tx,
            tasks_rx,
            signals: Signals {
                status,
                streaming,
                snapshot,
                last_error,
            },
            receiver,
        };
        tokio::spawn(actor.run());

        ChatHandle {
            sender,
            status: status_rx,
            streaming: streaming_rx,
            snapshot: snapshot_rx,
            last_error: last_error_rx,
        }
    }

    /// [`ChatClient::init`] with the HTTP API described by `config`.
    pub fn connect_http(config: ClientConfig, token: impl Into<String>) -> ChatResult<ChatHandle> {
        let token = token.into();
        let api = HttpChatApi::new(config.api_url.clone(), token.clone(), config.request_timeout)?;
        Ok(Self::init(config, Arc::new(api), token))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.receiver.recv() => {
                    match cmd {
                        Some(ChatCommand::Dispose { respond_to }) => {
                            self.shutdown();
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }

                Some(event) = next_event(&mut self.events) => {
                    self.handle_connection_event(event);
                }

                Some(done) = self.tasks_rx.recv() => {
                    self.handle_task_result(done);
                }
            }
        }
        debug!("chat client stopped");
    }

    fn handle_command(&mut self, cmd: ChatCommand) {
        match cmd {
            ChatCommand::SendUserMessage {
                session_id,
                text,
                respond_to,
            } => self.send_user_message(session_id, text, respond_to),
            ChatCommand::LoadSessions { respond_to } => self.load_sessions(respond_to),
            ChatCommand::SelectSession {
                session_id,
                respond_to,
            } => self.select_session(session_id, respond_to),
            ChatCommand::CreateSession { title, respond_to } => {
                self.create_session(title, CreateReply::Caller(respond_to))
            }
            ChatCommand::RenameSession {
                session_id,
                title,
                respond_to,
            } => self.rename_session(session_id, title, respond_to),
            ChatCommand::DeleteSession {
                session_id,
                respond_to,
            } => self.delete_session(session_id, respond_to),
            ChatCommand::Reconnect { respond_to } => {
                let _ = respond_to.send(self.reconnect());
            }
            ChatCommand::Dispose { respond_to } => {
                self.shutdown();
                let _ = respond_to.send(());
            }
        }
    }

    // ── Sending ─────────────────────────────────────────────────────────

    fn send_user_message(
        &mut self,
        session_id: SessionId,
        text: String,
        respond_to: oneshot::Sender<Result<(), SendError>>,
    ) {
        if self.pending.is_some() {
            let _ = respond_to.send(Err(SendError::rolled_back(ChatError::Busy(session_id), text)));
            return;
        }
        let provisional_id = match self.store.insert_provisional(session_id, &text) {
            Ok(id) => id,
            Err(e) => {
                let _ = respond_to.send(Err(SendError::rolled_back(e, text)));
                return;
            }
        };
        self.publish_snapshot();

        let route = match select_route(self.connection_status()) {
            Route::Duplex => match self.send_duplex(session_id, &text) {
                Ok(()) => Route::Duplex,
                Err(ChatError::NotConnected) => {
                    debug!(session_id = %session_id, "connection dropped before send, using fallback");
                    Route::Fallback
                }
                Err(e) => {
                    let text = self
                        .store
                        .rollback_provisional(session_id, provisional_id)
                        .unwrap_or(text);
                    self.publish_snapshot();
                    self.report(&e);
                    let _ = respond_to.send(Err(SendError::rolled_back(e, text)));
                    return;
                }
            },
            Route::Fallback => Route::Fallback,
        };

        if route == Route::Fallback {
            self.spawn_fallback(session_id, provisional_id, text.clone());
        }
        debug!(session_id = %session_id, provisional_id = %provisional_id, ?route, "message sent");

        self.pending = Some(PendingSend {
            session_id,
            provisional_id,
            text,
            route,
            acked: false,
            reply_applied: false,
            respond_to,
        });
    }

    fn send_duplex(&self, session_id: SessionId, text: &str) -> ChatResult<()> {
        match &self.connection {
            Some(connection) => connection.send(OutboundFrame::new(session_id, text)),
            None => Err(ChatError::NotConnected),
        }
    }

    fn spawn_fallback(&self, session_id: SessionId, provisional_id: ProvisionalId, text: String) {
        let api = self.api.clone();
        self.spawn_task(
            async move { api.send_message(session_id, &text).await },
            move |result| TaskResult::Fallback {
                session_id,
                provisional_id,
                result,
            },
        );
    }

    /// Run an HTTP call off the actor; its result comes back on `tasks_rx`.
    fn spawn_task<T, F>(&self, call: F, wrap: impl FnOnce(T) -> TaskResult + Send + 'static)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(wrap(call.await));
        });
    }

    fn handle_task_result(&mut self, done: TaskResult) {
        match done {
            TaskResult::Fallback {
                session_id,
                provisional_id,
                result,
            } => self.handle_fallback_result(session_id, provisional_id, result),
            TaskResult::Listed { result, respond_to } => {
                let result = result.map(|page| {
                    debug!(count = page.sessions.len(), total = page.total, "loaded sessions");
                    self.store.replace_sessions(page.sessions);
                    self.publish_snapshot();
                    self.store.sessions().to_vec()
                });
                let _ = respond_to.send(result);
            }
            TaskResult::Fetched {
                session_id,
                selection,
                result,
                reply,
            } => self.finish_open(session_id, selection, result, reply),
            TaskResult::Created { result, reply } => self.finish_create(result, reply),
            TaskResult::Renamed { result, respond_to } => {
                let result = result.inspect(|session| {
                    self.store.upsert_session(session.clone());
                    self.publish_snapshot();
                });
                let _ = respond_to.send(result);
            }
            TaskResult::Deleted {
                session_id,
                result,
                respond_to,
            } => self.finish_delete(session_id, result, respond_to),
        }
    }

    fn handle_fallback_result(
        &mut self,
        session_id: SessionId,
        provisional_id: ProvisionalId,
        result: ChatResult<MessagePair>,
    ) {
        let Some(pending) = self
            .pending
            .take_if(|p| p.provisional_id == provisional_id)
        else {
            debug!(provisional_id = %provisional_id, "stale fallback result dropped");
            return;
        };

        match result {
            Ok(pair) => {
                self.store.apply_pair(session_id, provisional_id, pair);
                self.publish_snapshot();
                let _ = pending.respond_to.send(Ok(()));
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "fallback send failed");
                let text = self
                    .store
                    .rollback_provisional(session_id, provisional_id)
                    .unwrap_or(pending.text);
                self.publish_snapshot();
                let error = ChatError::SendFailed {
                    reason: e.to_string(),
                };
                self.report(&error);
                let _ = pending.respond_to.send(Err(SendError::rolled_back(error, text)));
            }
        }
    }

    /// Resolve the pending duplex exchange for `session_id` with `error`.
    fn fail_duplex(&mut self, session_id: SessionId, error: ChatError) {
        let Some(pending) = self
            .pending
            .take_if(|p| p.session_id == session_id && p.route == Route::Duplex)
        else {
            return;
        };
        self.resolve_failed(pending, error);
    }

    fn resolve_failed(&mut self, pending: PendingSend, error: ChatError) {
        let result = if pending.acked {
            SendError::kept(error)
        } else {
            let text = self
                .store
                .rollback_provisional(pending.session_id, pending.provisional_id)
                .unwrap_or(pending.text);
            SendError::rolled_back(error, text)
        };
        self.publish_snapshot();
        let _ = pending.respond_to.send(Err(result));
    }

    /// Answer any in-flight exchange with `Aborted` before a teardown.
    fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(session_id = %pending.session_id, "aborting in-flight exchange");
            self.resolve_failed(pending, ChatError::Aborted);
        }
    }

    // ── Connection events ───────────────────────────────────────────────

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let current = self.connection.as_ref().and_then(|c| c.session_id());
        if current != Some(event.session_id()) {
            debug!(session_id = %event.session_id(), "event from torn-down connection dropped");
            return;
        }

        match event {
            ConnectionEvent::Status { session_id, status } => {
                self.signals.status.send_replace(status);
                if matches!(status, ConnectionStatus::Error | ConnectionStatus::Disconnected) {
                    self.store.discard_stream(session_id);
                    self.publish_streaming();
                    if self.pending_route(session_id) == Some(Route::Duplex) {
                        self.report(&ChatError::ConnectionLost);
                    }
                    self.fail_duplex(session_id, ChatError::ConnectionLost);
                }
            }
            ConnectionEvent::HandshakeFailed { session_id, error } => {
                warn!(session_id = %session_id, error = %error, "could not connect");
                self.report(&error);
            }
            ConnectionEvent::Frame { session_id, event } => self.handle_frame(session_id, event),
        }
    }

    fn handle_frame(&mut self, session_id: SessionId, event: InboundEvent) {
        // A user message from another sender must not claim a provisional
        // message that is travelling over HTTP.
        if let InboundEvent::UserMessageAck(message) = &event {
            if self.pending_route(session_id) == Some(Route::Fallback) {
                self.store.apply_confirmed(session_id, message.clone());
                self.publish_snapshot();
                return;
            }
        }

        match self.store.apply_frame(session_id, event) {
            FrameOutcome::Acknowledged { replaced } => {
                let complete = match self
                    .pending
                    .as_mut()
                    .filter(|p| p.session_id == session_id && p.route == Route::Duplex)
                {
                    Some(pending) => {
                        if replaced != Some(pending.provisional_id) {
                            debug!(session_id = %session_id, "ack did not replace the pending message");
                        }
                        pending.acked = true;
                        pending.reply_applied
                    }
                    None => false,
                };
                self.publish_snapshot();
                if complete {
                    if let Some(pending) = self.pending.take() {
                        let _ = pending.respond_to.send(Ok(()));
                    }
                }
            }
            FrameOutcome::Streaming(text) => {
                self.signals.streaming.send_replace(Some(text));
            }
            FrameOutcome::Completed(message) => {
                self.publish_streaming();
                self.publish_snapshot();
                match self
                    .pending
                    .take_if(|p| p.session_id == session_id && p.route == Route::Duplex)
                {
                    Some(pending) if pending.acked => {
                        let _ = pending.respond_to.send(Ok(()));
                    }
                    Some(mut pending) => {
                        warn!(
                            session_id = %session_id,
                            message_id = %message.id,
                            "done arrived before the user message was confirmed"
                        );
                        pending.reply_applied = true;
                        self.pending = Some(pending);
                    }
                    None => {}
                }
            }
            FrameOutcome::RemoteError { message, code } => {
                self.publish_streaming();
                let error = ChatError::Remote { message, code };
                warn!(session_id = %session_id, error = %error, "server reported an error");
                self.report(&error);
                self.fail_duplex(session_id, error);
            }
            FrameOutcome::Ignored => {}
        }
    }

    fn pending_route(&self, session_id: SessionId) -> Option<Route> {
        self.pending
            .as_ref()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.route)
    }

    // ── Sessions ────────────────────────────────────────────────────────

    fn load_sessions(&self, respond_to: oneshot::Sender<ChatResult<Vec<Session>>>) {
        let api = self.api.clone();
        let limit = self.config.page_size;
        self.spawn_task(
            async move { api.list_sessions(limit, 0).await },
            move |result| TaskResult::Listed { result, respond_to },
        );
    }

    fn select_session(&mut self, session_id: SessionId, respond_to: oneshot::Sender<ChatResult<()>>) {
        if self.store.active_session_id() == Some(session_id) && self.connection.is_some() {
            debug!(session_id = %session_id, "session already active");
            let _ = respond_to.send(Ok(()));
            return;
        }
        self.open_session(session_id, OpenReply::Select(respond_to));
    }

    /// Fetch a session's history; it becomes active when the fetch returns.
    fn open_session(&mut self, session_id: SessionId, reply: OpenReply) {
        self.selection += 1;
        let selection = self.selection;
        let api = self.api.clone();
        self.spawn_task(
            async move { api.get_session(session_id).await },
            move |result| TaskResult::Fetched {
                session_id,
                selection,
                result,
                reply,
            },
        );
    }

    fn finish_open(
        &mut self,
        session_id: SessionId,
        selection: u64,
        result: ChatResult<SessionWithMessages>,
        reply: OpenReply,
    ) {
        if selection != self.selection {
            debug!(session_id = %session_id, "superseded session fetch dropped");
            reply.superseded();
            return;
        }
        let full = match result {
            Ok(full) => full,
            Err(e) => {
                reply.send(session_id, Err(e));
                return;
            }
        };

        self.abort_pending();
        self.teardown_connection();
        self.store.open_session(full);
        self.publish_streaming();
        self.publish_snapshot();
        info!(session_id = %session_id, "session selected");

        self.open_connection(session_id);
        reply.send(session_id, Ok(()));
    }

    fn create_session(&self, title: Option<String>, reply: CreateReply) {
        let title = title.unwrap_or_else(|| self.config.default_title.clone());
        let api = self.api.clone();
        self.spawn_task(
            async move { api.create_session(Some(&title)).await },
            move |result| TaskResult::Created { result, reply },
        );
    }

    fn finish_create(&mut self, result: ChatResult<Session>, reply: CreateReply) {
        let (session, reply) = match (result, reply) {
            (Ok(session), reply) => (session, reply),
            (Err(e), CreateReply::Caller(tx)) => {
                let _ = tx.send(Err(e));
                return;
            }
            (Err(e), CreateReply::AfterDelete(tx)) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        info!(session_id = %session.id, title = %session.title, "session created");
        self.store.upsert_session(session.clone());
        self.publish_snapshot();

        match reply {
            CreateReply::Caller(tx) => {
                let _ = tx.send(Ok(session));
            }
            CreateReply::AfterDelete(tx) => self.open_session(session.id, OpenReply::AfterDelete(tx)),
        }
    }

    fn rename_session(
        &self,
        session_id: SessionId,
        title: String,
        respond_to: oneshot::Sender<ChatResult<Session>>,
    ) {
        let api = self.api.clone();
        self.spawn_task(
            async move { api.rename_session(session_id, &title).await },
            move |result| TaskResult::Renamed { result, respond_to },
        );
    }

    fn delete_session(
        &self,
        session_id: SessionId,
        respond_to: oneshot::Sender<ChatResult<Option<SessionId>>>,
    ) {
        let api = self.api.clone();
        self.spawn_task(
            async move { api.delete_session(session_id).await },
            move |result| TaskResult::Deleted {
                session_id,
                result,
                respond_to,
            },
        );
    }

    fn finish_delete(
        &mut self,
        session_id: SessionId,
        result: ChatResult<()>,
        respond_to: oneshot::Sender<ChatResult<Option<SessionId>>>,
    ) {
        if let Err(e) = result {
            let _ = respond_to.send(Err(e));
            return;
        }
        info!(session_id = %session_id, "session deleted");

        if self.store.active_session_id() == Some(session_id) {
            self.abort_pending();
            self.teardown_connection();
        }

        let fallback = self.store.remove_session(session_id);
        self.publish_streaming();
        self.publish_snapshot();
        match fallback {
            DeletionFallback::Unaffected => {
                let _ = respond_to.send(Ok(None));
            }
            DeletionFallback::Select(next) => {
                self.open_session(next, OpenReply::AfterDelete(respond_to));
            }
            DeletionFallback::CreateNew => {
                self.create_session(None, CreateReply::AfterDelete(respond_to));
            }
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    fn reconnect(&mut self) -> ChatResult<()> {
        let Some(session_id) = self.store.active_session_id() else {
            debug!("reconnect without an active session");
            return Ok(());
        };
        match self.connection_status() {
            ConnectionStatus::Connected | ConnectionStatus::Connecting => {
                debug!(session_id = %session_id, status = %self.connection_status(), "reconnect not needed");
                Ok(())
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                self.teardown_connection();
                self.open_connection(session_id);
                Ok(())
            }
        }
    }

    fn open_connection(&mut self, session_id: SessionId) {
        let (mut manager, events) = ConnectionManager::new(self.config.connection.clone());
        if let Err(e) = manager.connect(session_id, &self.token) {
            match e {
                ChatError::AlreadyConnecting => debug!(session_id = %session_id, "connect already in flight"),
                other => {
                    warn!(session_id = %session_id, error = %other, "connect refused");
                    self.report(&other);
                }
            }
        }
        self.signals.status.send_replace(manager.status());
        self.connection = Some(manager);
        self.events = Some(events);
    }

    fn teardown_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Some(session_id) = connection.session_id() {
                self.store.discard_stream(session_id);
            }
            connection.disconnect();
        }
        // Late frames from the old socket die with the receiver.
        self.events = None;
        self.signals.status.send_replace(ConnectionStatus::Disconnected);
    }

    fn shutdown(&mut self) {
        self.abort_pending();
        self.teardown_connection();
        self.store.close_active();
        self.publish_streaming();
        self.publish_snapshot();
        info!("chat client disposed");
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.connection
            .as_ref()
            .map(|c| c.status())
            .unwrap_or_default()
    }

    // ── Signals ─────────────────────────────────────────────────────────

    fn publish_snapshot(&self) {
        self.signals.snapshot.send_replace(self.store.snapshot());
    }

    fn publish_streaming(&self) {
        let text = self
            .store
            .active_session_id()
            .and_then(|id| self.store.streaming_text(id))
            .map(str::to_string);
        self.signals.streaming.send_replace(text);
    }

    fn report(&self, error: &ChatError) {
        if error.is_user_visible() {
            self.signals.last_error.send_replace(Some(error.clone()));
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
