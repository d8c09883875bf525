//! Duplex relay between a voice client and the upstream realtime socket.
//!
//! One [`VoiceRelay::run`] call owns one connection from client open to
//! teardown. Frames are handled one at a time in arrival order; the bounded
//! [`Link`] channels on both sides are the only buffering.

mod connector;
mod manager;

pub use connector::{OpenAiRealtimeConnector, RealtimeConnector};
pub use manager::{ConnectionInfo, ConnectionManager};

use crate::context::ContextCache;
use crate::error::{MemoirError, Result};
use crate::ledger::{QuestionLedger, QuestionOrigin};
use crate::model::{
    ConversationContext, ConversationMedium, ConversationMessage, ConversationSession,
    ConversationType, ScopeKey,
};
use crate::prompts::PromptLibrary;
use crate::store::ConversationStore;
use memoir_realtime::{Frame, Link};
use memoir_realtime_types::audio::{
    AudioFormat, ServerVadTurnDetection, TranscriptionModel, TurnDetection, Voice,
};
use memoir_realtime_types::events::frame_type;
use memoir_realtime_types::{ClientFrameKind, RelayEvent, ServerFrame, Session, SessionUpdateEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CONNECTION_TIMEOUT: &str = "connection_timeout";
pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
pub const UPSTREAM_PROTOCOL_ERROR: &str = "upstream_protocol_error";
pub const PERSISTENCE_ERROR: &str = "persistence_error";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub voice: Voice,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            voice: Voice::Alloy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Generated when absent.
    pub session_id: Option<String>,
    pub user_id: String,
    pub book_id: String,
    pub chapter_id: Option<String>,
    pub conversation_type: ConversationType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Connecting,
    AwaitingUpstream,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientClosed,
    UpstreamClosed,
    ProtocolError,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelaySummary {
    pub session_id: String,
    pub close_reason: CloseReason,
    pub client_frames_forwarded: usize,
    pub client_frames_dropped: usize,
    pub upstream_frames_forwarded: usize,
    pub messages: usize,
}

enum Incoming {
    Client(Option<Frame>),
    Upstream(Option<Frame>),
    Shutdown,
}

/// Per-connection state. Lives only inside one `run` call.
struct Connection {
    state: RelayState,
    session: ConversationSession,
    pending_transcript: String,
    unsaved: bool,
    tasks: JoinSet<()>,
    summary: RelaySummary,
}

impl Connection {
    fn transition(&mut self, state: RelayState) {
        debug!(session_id = %self.session.session_id, from = ?self.state, to = ?state, "relay state");
        self.state = state;
    }
}

pub struct VoiceRelay {
    connector: Arc<dyn RealtimeConnector>,
    conversations: Arc<dyn ConversationStore>,
    contexts: Arc<ContextCache>,
    ledger: Arc<QuestionLedger>,
    prompts: Arc<PromptLibrary>,
    manager: Arc<ConnectionManager>,
    config: RelayConfig,
}

impl VoiceRelay {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        conversations: Arc<dyn ConversationStore>,
        contexts: Arc<ContextCache>,
        ledger: Arc<QuestionLedger>,
        prompts: Arc<PromptLibrary>,
        manager: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            connector,
            conversations,
            contexts,
            ledger,
            prompts,
            manager,
            config: RelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Relays one voice session until either side closes.
    ///
    /// Failures before streaming starts are reported to the client as an
    /// error event and returned as [`MemoirError::Connection`]. Once
    /// streaming, every ending is a normal close described by the summary.
    pub async fn run(&self, request: RelayRequest, client: Link) -> Result<RelaySummary> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(%session_id, user_id = %request.user_id, "voice connection opened");

        let session = match self.open_session(&session_id, &request).await {
            Ok(session) => session,
            Err(err) => {
                reject(client, &err).await;
                return Err(err);
            }
        };
        let mut conn = Connection {
            state: RelayState::Connecting,
            session,
            pending_transcript: String::new(),
            unsaved: false,
            tasks: JoinSet::new(),
            summary: RelaySummary {
                session_id: session_id.clone(),
                close_reason: CloseReason::ClientClosed,
                client_frames_forwarded: 0,
                client_frames_dropped: 0,
                upstream_frames_forwarded: 0,
                messages: 0,
            },
        };

        let shutdown = self.manager.register(&session_id, &request.user_id).await;
        conn.transition(RelayState::AwaitingUpstream);

        let upstream = match self.open_upstream(&conn.session).await {
            Ok(upstream) => upstream,
            Err(err) => {
                error!(%session_id, "upstream connection failed: {err}");
                reject(client, &err).await;
                self.manager
                    .deregister(&session_id, &request.user_id, &shutdown)
                    .await;
                conn.transition(RelayState::Closed);
                return Err(err);
            }
        };

        let ready = RelayEvent::ConnectionReady {
            session_id: session_id.clone(),
        };
        if let Ok(json) = ready.to_json() {
            if client.send_text(json).await.is_err() {
                debug!(%session_id, "client left before the connection was ready");
            }
        }
        conn.transition(RelayState::Streaming);

        let (mut client, mut upstream) = (client, upstream);
        loop {
            let incoming = tokio::select! {
                _ = shutdown.notified() => Incoming::Shutdown,
                frame = client.recv() => Incoming::Client(frame),
                frame = upstream.recv() => Incoming::Upstream(frame),
            };

            let outcome = match incoming {
                Incoming::Shutdown => Some(CloseReason::Shutdown),
                Incoming::Client(None) | Incoming::Client(Some(Frame::Close(_))) => {
                    Some(CloseReason::ClientClosed)
                }
                Incoming::Upstream(None) | Incoming::Upstream(Some(Frame::Close(_))) => {
                    Some(CloseReason::UpstreamClosed)
                }
                Incoming::Client(Some(Frame::Text(text))) => {
                    self.forward_client_frame(&mut conn, &upstream, text).await
                }
                Incoming::Upstream(Some(Frame::Text(text))) => {
                    self.handle_upstream_frame(&mut conn, &client, text).await
                }
            };
            if let Some(reason) = outcome {
                conn.summary.close_reason = reason;
                break;
            }
        }

        conn.transition(RelayState::Closing);
        let reason = format!("{:?}", conn.summary.close_reason);
        upstream.close(Some(reason.clone())).await;
        client.close(Some(reason)).await;

        if conn.unsaved {
            self.persist(&mut conn).await;
        }
        while let Some(result) = conn.tasks.join_next().await {
            if let Err(e) = result {
                warn!(%session_id, "question tracking task failed: {e}");
            }
        }
        self.manager
            .deregister(&session_id, &request.user_id, &shutdown)
            .await;
        conn.transition(RelayState::Closed);

        conn.summary.messages = conn.session.messages.len();
        info!(
            %session_id,
            reason = ?conn.summary.close_reason,
            client_frames = conn.summary.client_frames_forwarded,
            dropped = conn.summary.client_frames_dropped,
            upstream_frames = conn.summary.upstream_frames_forwarded,
            messages = conn.summary.messages,
            "voice connection closed"
        );
        Ok(conn.summary)
    }

    /// Continues the user's stored session when one exists. Otherwise a new
    /// session is created and its empty record persisted.
    async fn open_session(
        &self,
        session_id: &str,
        request: &RelayRequest,
    ) -> Result<ConversationSession> {
        let persistence_failed = |e: anyhow::Error| {
            error!(session_id, "failed to open voice session record: {e:#}");
            MemoirError::connection(PERSISTENCE_ERROR, "could not open the session")
        };

        let existing = self
            .conversations
            .find(session_id, &request.user_id)
            .await
            .map_err(persistence_failed)?;
        if let Some(record) = existing {
            let mut session = ConversationSession::from_record(&record);
            session.conversation_medium = ConversationMedium::Voice;
            info!(
                session_id,
                messages = session.messages.len(),
                "resuming stored voice session"
            );
            return Ok(session);
        }

        let context = self.load_context(request).await;
        let session = ConversationSession::new(
            session_id,
            &request.user_id,
            &request.book_id,
            request.chapter_id.clone(),
            request.conversation_type,
            ConversationMedium::Voice,
            (*context).clone(),
        );
        self.conversations
            .save(&session.to_record())
            .await
            .map_err(persistence_failed)?;
        Ok(session)
    }

    async fn load_context(&self, request: &RelayRequest) -> Arc<ConversationContext> {
        match self
            .contexts
            .get_context(
                &request.user_id,
                &request.book_id,
                request.chapter_id.as_deref(),
            )
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(user_id = %request.user_id, "voice session without context: {e:#}");
                Arc::new(ConversationContext::default())
            }
        }
    }

    fn session_config(&self, session: &ConversationSession) -> Session {
        let mut configurator = Session::new()
            .with_voice(self.config.voice.clone())
            .with_input_audio_format(AudioFormat::Pcm16)
            .with_output_audio_format(AudioFormat::Pcm16)
            .with_input_audio_transcription_enable(TranscriptionModel::Whisper)
            .with_turn_detection_enable(TurnDetection::ServerVad(
                ServerVadTurnDetection::default(),
            ));
        match self
            .prompts
            .voice_instructions(session.conversation_type, &session.context)
        {
            Ok(instructions) => configurator = configurator.with_instructions(&instructions),
            Err(e) => warn!("voice instructions unavailable: {e:#}"),
        }
        configurator.build()
    }

    /// Connects upstream and dispatches the session configuration frame.
    async fn open_upstream(&self, session: &ConversationSession) -> Result<Link> {
        let upstream = tokio::time::timeout(self.config.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                MemoirError::connection(CONNECTION_TIMEOUT, "timed out connecting to the voice service")
            })?
            .map_err(|e| MemoirError::connection(UPSTREAM_UNAVAILABLE, format!("{e:#}")))?;

        let update = serde_json::to_string(&SessionUpdateEvent::new(self.session_config(session)))
            .map_err(|e| MemoirError::connection(UPSTREAM_PROTOCOL_ERROR, e.to_string()))?;
        upstream
            .send_text(update)
            .await
            .map_err(|e| MemoirError::connection(UPSTREAM_UNAVAILABLE, format!("{e:#}")))?;
        Ok(upstream)
    }

    async fn forward_client_frame(
        &self,
        conn: &mut Connection,
        upstream: &Link,
        text: String,
    ) -> Option<CloseReason> {
        let kind = frame_type(&text).and_then(|t| ClientFrameKind::from_type(&t));
        let Some(kind) = kind else {
            conn.summary.client_frames_dropped += 1;
            debug!(session_id = %conn.session.session_id, "dropped client frame outside the allow-list");
            return None;
        };
        if upstream.send_text(text).await.is_err() {
            return Some(CloseReason::UpstreamClosed);
        }
        conn.summary.client_frames_forwarded += 1;
        if kind != ClientFrameKind::InputAudioBufferAppend {
            debug!(session_id = %conn.session.session_id, frame = kind.as_str(), "client frame forwarded");
        }
        None
    }

    async fn handle_upstream_frame(
        &self,
        conn: &mut Connection,
        client: &Link,
        text: String,
    ) -> Option<CloseReason> {
        let parsed = ServerFrame::parse(&text);
        let frame = match parsed {
            Ok(frame) => frame,
            Err(e) => {
                error!(session_id = %conn.session.session_id, "malformed upstream frame: {e}");
                if let Ok(json) =
                    RelayEvent::error(UPSTREAM_PROTOCOL_ERROR, "the voice service sent an unreadable frame")
                        .to_json()
                {
                    let _ = client.send_text(json).await;
                }
                return Some(CloseReason::ProtocolError);
            }
        };

        if client.send_text(text).await.is_err() {
            return Some(CloseReason::ClientClosed);
        }
        conn.summary.upstream_frames_forwarded += 1;

        match frame {
            ServerFrame::TranscriptDelta { delta } => {
                conn.pending_transcript.push_str(&delta);
            }
            ServerFrame::TranscriptDone { transcript } => {
                let buffered = std::mem::take(&mut conn.pending_transcript);
                let content = if transcript.trim().is_empty() {
                    buffered
                } else {
                    transcript
                };
                if !content.trim().is_empty() {
                    let message = ConversationMessage::assistant(content.trim());
                    self.append(conn, message.clone()).await;
                    self.track_questions(conn, message.content);
                }
            }
            ServerFrame::InputTranscriptionCompleted { transcript } => {
                if !transcript.trim().is_empty() {
                    self.append(conn, ConversationMessage::user(transcript.trim()))
                        .await;
                }
            }
            ServerFrame::Error { error } => {
                warn!(
                    session_id = %conn.session.session_id,
                    code = error.code().unwrap_or("unknown"),
                    "upstream error: {}",
                    error.message()
                );
            }
            ServerFrame::Other => {}
        }
        None
    }

    async fn append(&self, conn: &mut Connection, message: ConversationMessage) {
        conn.session.append(message);
        conn.unsaved = true;
        self.persist(conn).await;
    }

    /// Overwrites the record with the full message list.
    async fn persist(&self, conn: &mut Connection) {
        match self.conversations.save(&conn.session.to_record()).await {
            Ok(()) => {
                conn.unsaved = false;
                debug!(
                    session_id = %conn.session.session_id,
                    messages = conn.session.messages.len(),
                    "voice transcript saved"
                );
            }
            Err(e) => warn!(session_id = %conn.session.session_id, "failed to save voice transcript: {e:#}"),
        }
    }

    fn track_questions(&self, conn: &mut Connection, text: String) {
        let ledger = self.ledger.clone();
        let scope = ScopeKey::new(&conn.session.user_id, &conn.session.book_id);
        let conversation_type = conn.session.conversation_type;
        let origin = QuestionOrigin::new(
            conn.session.chapter_id.as_deref(),
            Some(conn.session.session_id.as_str()),
        );
        while let Some(finished) = conn.tasks.try_join_next() {
            if let Err(e) = finished {
                warn!("question tracking task failed: {e}");
            }
        }
        conn.tasks.spawn(async move {
            if let Err(e) = ledger
                .track_response(&scope, conversation_type, &text, &origin)
                .await
            {
                warn!("question tracking failed: {e}");
            }
        });
    }
}

/// Reports a failure to a client that never reached streaming, then closes it.
async fn reject(client: Link, err: &MemoirError) {
    let code = match err {
        MemoirError::Connection { code, .. } => *code,
        _ => UPSTREAM_UNAVAILABLE,
    };
    let description = err.user_facing().description;
    if let Ok(json) = RelayEvent::error(code, &description).to_json() {
        let _ = client.send_text(json).await;
    }
    client.close(Some(code.to_string())).await;
}
