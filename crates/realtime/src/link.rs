use anyhow::{Result, anyhow};
use tokio::sync::mpsc;

/// A single text-protocol frame travelling over a [`Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// The sending side is closing, with an optional human-readable reason.
    Close(Option<String>),
}

/// One end of a bounded, ordered, bidirectional frame channel.
///
/// A `Link` is how the relay talks to both of its sockets: the upstream socket
/// returned by [`crate::connect`] and the client socket bridged by the HTTP
/// layer. Dropping a `Link` closes it; the peer then observes `None` from
/// [`Link::recv`].
#[derive(Debug)]
pub struct Link {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl Link {
    pub fn new(tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>) -> Self {
        Self { tx, rx }
    }

    /// Creates two connected ends. Frames sent on one are received on the other.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        (Link::new(a_tx, b_rx), Link::new(b_tx, a_rx))
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("link closed by peer"))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::Text(text.into())).await
    }

    /// Receives the next frame, or `None` once the peer has gone away.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sends a close frame if the peer is still listening, then drops this end.
    pub async fn close(self, reason: Option<String>) {
        if !self.tx.is_closed() {
            let _ = self.tx.send(Frame::Close(reason)).await;
        }
    }
}
