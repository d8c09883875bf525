use crate::link::{Frame, Link};
use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub mod config;
mod consts;
mod utils;

/// Opens a websocket to the realtime speech service and exposes it as a [`Link`].
///
/// Two tasks are spawned: a writer that drains the outgoing channel into the
/// socket, and a reader that pushes every incoming text frame into the
/// incoming channel. Frames keep their arrival order in both directions and
/// the bounded channels are the only buffering between the caller and the
/// socket.
pub async fn connect(config: &config::Config) -> Result<Link> {
    let request = utils::build_request(config).context("failed to build realtime request")?;

    let (ws_stream, _) =
        tokio::time::timeout(config.connect_timeout(), tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| anyhow!("timed out connecting to the realtime service"))?
            .context("failed to connect to the realtime service")?;

    // Split the websocket into write and read halves.
    let (mut write, mut read) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(config.capacity());
    let (in_tx, in_rx) = mpsc::channel::<Frame>(config.capacity());

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                Frame::Text(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("failed to send frame upstream: {}", e);
                        break;
                    }
                }
                Frame::Close(reason) => {
                    tracing::debug!("closing upstream socket: {:?}", reason);
                    break;
                }
            }
        }
        if let Err(e) = write.close().await {
            tracing::debug!("upstream socket already closed: {}", e);
        }
    });

    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = in_tx.closed() => break,
                message = read.next() => message,
            };
            let message = match message {
                None => break,
                Some(Err(e)) => {
                    tracing::error!("failed to read upstream message: {}", e);
                    break;
                }
                Some(Ok(message)) => message,
            };
            match message {
                Message::Text(text) => {
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                        let event_type = json.get("type").and_then(|v| v.as_str());
                        let event_id = json.get("event_id").and_then(|v| v.as_str());
                        tracing::trace!(
                            "received upstream frame: {}, id={}",
                            event_type.unwrap_or("unknown"),
                            event_id.unwrap_or("unknown")
                        );
                    }
                    if in_tx.send(Frame::Text(text)).await.is_err() {
                        break;
                    }
                }
                Message::Binary(bin) => {
                    tracing::warn!("unexpected binary upstream message of {} bytes", bin.len());
                }
                Message::Close(reason) => {
                    tracing::info!("upstream connection closed: {:?}", reason);
                    let reason = reason.map(|frame| frame.reason.to_string());
                    let _ = in_tx.send(Frame::Close(reason)).await;
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(Link::new(out_tx, in_rx))
}
