//! Bridges an axum WebSocket onto the relay's client [`Link`].

use crate::routes::UserId;
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use memoir_core::model::ConversationType;
use memoir_core::relay::{RelayRequest, VoiceRelay};
use memoir_realtime::{Frame, Link};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const BRIDGE_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
pub struct VoiceParams {
    book_id: String,
    #[serde(default)]
    chapter_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "default_conversation_type")]
    conversation_type: ConversationType,
}

fn default_conversation_type() -> ConversationType {
    ConversationType::Interview
}

pub async fn voice_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<VoiceParams>,
) -> Response {
    let request = RelayRequest {
        session_id: params.session_id,
        user_id: user.0,
        book_id: params.book_id,
        chapter_id: params.chapter_id,
        conversation_type: params.conversation_type,
    };
    info!(user_id = %request.user_id, "voice WebSocket upgrade request received");
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| bridge(socket, relay, request))
}

async fn bridge(socket: WebSocket, relay: Arc<VoiceRelay>, request: RelayRequest) {
    let (relay_end, mut bridge_end) = Link::pair(BRIDGE_CAPACITY);
    let relay_task = tokio::spawn(async move { relay.run(request, relay_end).await });
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if bridge_end.send_text(text.as_str()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("voice WebSocket receive error: {e}");
                    break;
                }
            },
            frame = bridge_end.recv() => match frame {
                Some(Frame::Text(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Frame::Close(reason)) => {
                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    break;
                }
                None => break,
            },
        }
    }

    // Dropping our end is how the relay learns the client went away.
    drop(bridge_end);
    match relay_task.await {
        Ok(Ok(summary)) => debug!(session_id = %summary.session_id, "voice bridge finished"),
        Ok(Err(e)) => warn!("voice session ended before streaming: {e}"),
        Err(e) => error!("voice relay task failed: {e}"),
    }
}
