use crate::config::Config;
use anyhow::{Context, Result};
use memoir_core::analytics::ConversationAnalyzer;
use memoir_core::completion::{CompletionService, OpenAiCompletionClient};
use memoir_core::context::{ContextCache, SourceContextBuilder};
use memoir_core::controller::{ControllerConfig, ControllerDeps, ControllerScope, SessionController};
use memoir_core::ledger::{HeuristicExtractor, QuestionLedger};
use memoir_core::prompts::PromptLibrary;
use memoir_core::relay::{
    ConnectionManager, OpenAiRealtimeConnector, RealtimeConnector, RelayConfig, VoiceRelay,
};
use memoir_core::store::InMemoryStore;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// One [`SessionController`] per `(user, book, chapter)`.
///
/// A controller stays registered while it holds a session or background
/// work. Ending a conversation releases it, so the registry is bounded by the
/// scopes with a conversation in progress.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Mutex<HashMap<ControllerScope, Arc<SessionController>>>,
}

impl ControllerRegistry {
    pub fn get_or_create(
        &self,
        scope: ControllerScope,
        make: impl FnOnce(ControllerScope) -> SessionController,
    ) -> Arc<SessionController> {
        let mut controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        controllers
            .entry(scope)
            .or_insert_with_key(|scope| {
                debug!(user_id = %scope.user_id, book_id = %scope.book_id, "creating controller");
                Arc::new(make(scope.clone()))
            })
            .clone()
    }

    /// Drops the scope's controller when it is idle and no request holds it.
    pub fn release_if_idle(&self, scope: &ControllerScope) -> bool {
        let mut controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        let idle = controllers
            .get(scope)
            .is_some_and(|c| Arc::strong_count(c) == 1 && c.is_idle());
        if idle {
            controllers.remove(scope);
            debug!(user_id = %scope.user_id, book_id = %scope.book_id, "released idle controller");
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub deps: ControllerDeps,
    pub controller_config: ControllerConfig,
    pub controllers: Arc<ControllerRegistry>,
    pub relay: Arc<VoiceRelay>,
}

impl AppState {
    /// Wires the production collaborators from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let prompts = match &config.prompts_dir {
            Some(dir) => PromptLibrary::from_dir(dir)
                .with_context(|| format!("Failed to load prompts from {}", dir.display()))?,
            None => PromptLibrary::default(),
        };
        let prompts = Arc::new(prompts);
        info!("Loaded {} prompts successfully.", prompts.len());

        let mut completion = OpenAiCompletionClient::new(
            config.openai_api_key.clone(),
            config.chat_model.clone(),
            prompts.clone(),
        );
        if let Some(base_url) = &config.openai_base_url {
            completion = completion.with_base_url(base_url);
        }

        let mut realtime = memoir_realtime::ConfigBuilder::new()
            .with_api_key(config.openai_api_key.expose_secret())
            .with_connect_timeout(config.upstream_timeout);
        if let Some(model) = &config.realtime_model {
            realtime = realtime.with_model(model);
        }
        if let Some(base_url) = &config.realtime_base_url {
            realtime = realtime.with_base_url(base_url);
        }

        let state = Self::with_services(
            Arc::new(InMemoryStore::new()),
            Arc::new(completion),
            Arc::new(OpenAiRealtimeConnector::new(realtime.build())),
            prompts,
            config,
        );
        state.deps.contexts.clone().spawn_sweeper(config.context_ttl);
        Ok(state)
    }

    pub fn with_services(
        store: Arc<InMemoryStore>,
        completion: Arc<dyn CompletionService>,
        connector: Arc<dyn RealtimeConnector>,
        prompts: Arc<PromptLibrary>,
        config: &Config,
    ) -> Self {
        let contexts = Arc::new(ContextCache::new(
            Arc::new(SourceContextBuilder::new(store.clone())),
            config.context_ttl,
        ));
        let ledger = Arc::new(QuestionLedger::new(
            store.clone(),
            Arc::new(HeuristicExtractor::default()),
        ));
        let relay = VoiceRelay::new(
            connector,
            store.clone(),
            contexts.clone(),
            ledger.clone(),
            prompts,
            Arc::new(ConnectionManager::new()),
        )
        .with_config(RelayConfig {
            connect_timeout: config.upstream_timeout,
            ..RelayConfig::default()
        });

        Self {
            deps: ControllerDeps {
                conversations: store.clone(),
                drafts: store,
                completion,
                contexts,
                ledger,
                analyzer: ConversationAnalyzer::default(),
            },
            controller_config: ControllerConfig {
                history_limit: config.history_limit,
                draft_debounce: config.draft_debounce,
                ..ControllerConfig::default()
            },
            controllers: Arc::new(ControllerRegistry::default()),
            relay: Arc::new(relay),
        }
    }

    pub fn controller(&self, scope: ControllerScope) -> Arc<SessionController> {
        self.controllers.get_or_create(scope, |scope| {
            SessionController::new(scope, self.deps.clone(), self.controller_config.clone())
        })
    }

    pub fn ledger(&self) -> &Arc<QuestionLedger> {
        &self.deps.ledger
    }

    /// Signals every voice connection to close and waits briefly for them.
    pub async fn shutdown(&self, grace: Duration) {
        let manager = self.relay.manager();
        let signalled = manager.close_all().await;
        if signalled == 0 {
            return;
        }
        let deadline = tokio::time::Instant::now() + grace;
        while !manager.is_empty().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = manager.len().await;
        info!(
            remaining,
            "voice connections closed for shutdown"
        );
    }
}
