use anyhow::Result;
use async_trait::async_trait;
use memoir_realtime::Link;

/// Opens the upstream realtime speech socket for one voice session.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

/// Connects to the OpenAI realtime endpoint.
pub struct OpenAiRealtimeConnector {
    config: memoir_realtime::Config,
}

impl OpenAiRealtimeConnector {
    pub fn new(config: memoir_realtime::Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RealtimeConnector for OpenAiRealtimeConnector {
    async fn connect(&self) -> Result<Link> {
        memoir_realtime::connect(&self.config).await
    }
}
