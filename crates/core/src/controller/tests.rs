use super::*;
use crate::completion::{BeginResponse, ContinueResponse, MockCompletionService};
use crate::context::SourceContextBuilder;
use crate::ledger::HeuristicExtractor;
use crate::model::Role;
use crate::store::InMemoryStore;
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

const INTERVIEW: ConversationType = ConversationType::Interview;

struct Harness {
    store: Arc<InMemoryStore>,
    ledger: Arc<QuestionLedger>,
    controller: Arc<SessionController>,
}

fn harness(completion: impl CompletionService + 'static) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(QuestionLedger::new(
        store.clone(),
        Arc::new(HeuristicExtractor::default()),
    ));
    let deps = ControllerDeps {
        conversations: store.clone(),
        drafts: store.clone(),
        completion: Arc::new(completion),
        contexts: Arc::new(ContextCache::new(
            Arc::new(SourceContextBuilder::new(store.clone())),
            Duration::from_secs(300),
        )),
        ledger: ledger.clone(),
        analyzer: ConversationAnalyzer::default(),
    };
    let controller = Arc::new(SessionController::new(
        ControllerScope::new("alice", "book-1", None),
        deps,
        ControllerConfig::default(),
    ));
    Harness {
        store,
        ledger,
        controller,
    }
}

/// Opens sessions `s1`, `s2`, ... and replies to the last user message.
fn echo_completion(opening: &'static str) -> MockCompletionService {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut completion = MockCompletionService::new();
    completion.expect_begin().returning(move |request| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BeginResponse {
            session_id: format!("s{n}"),
            assistant_text: opening.to_string(),
            goals: request.conversation_type.goals(),
        })
    });
    completion
        .expect_continue_session()
        .returning(|request| {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ContinueResponse {
                assistant_text: format!("Noted: {last}"),
            })
        });
    completion
}

#[tokio::test]
async fn serial_sends_keep_their_order_in_memory_and_in_the_store() {
    let h = harness(echo_completion("Hello! Where did you grow up?"));
    h.controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await
        .unwrap();

    for text in ["one", "two", "three"] {
        let outcome = h.controller.send_message(text).await.unwrap();
        assert_eq!(outcome.user_message.content, text);
        assert_eq!(outcome.reply.unwrap().content, format!("Noted: {text}"));
    }

    let session = h.controller.current_session().unwrap();
    let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "Hello! Where did you grow up?",
            "one",
            "Noted: one",
            "two",
            "Noted: two",
            "three",
            "Noted: three",
        ]
    );
    assert!(
        session
            .messages
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    );

    let record = h.store.find("s1", "alice").await.unwrap().unwrap();
    assert_eq!(ConversationSession::from_record(&record).messages, session.messages);
}

#[tokio::test]
async fn failed_reply_keeps_the_user_message_locally_and_persisted() {
    let mut completion = MockCompletionService::new();
    completion.expect_begin().returning(|_| {
        Ok(BeginResponse {
            session_id: "s1".into(),
            assistant_text: "Hi there.".into(),
            goals: vec![],
        })
    });
    completion
        .expect_continue_session()
        .returning(|_| Err(anyhow!("upstream 503")));
    let h = harness(completion);

    let session = h
        .controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await
        .unwrap();
    assert_eq!(session.goals, INTERVIEW.goals());

    let err = h.controller.send_message("I grew up in Perth.").await.unwrap_err();
    assert!(matches!(err, MemoirError::Service { .. }));

    let state = h.controller.snapshot();
    assert_eq!(state.phase, Phase::Active);
    assert!(state.last_error.is_some());
    let last = state.session.unwrap().messages.last().cloned().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, "I grew up in Perth.");

    let record = h.store.find("s1", "alice").await.unwrap().unwrap();
    assert_eq!(record.messages.len(), 2);
}

#[tokio::test]
async fn failed_start_leaves_no_session() {
    let mut completion = MockCompletionService::new();
    completion
        .expect_begin()
        .returning(|_| Err(anyhow!("timeout")));
    let h = harness(completion);

    let err = h
        .controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await
        .unwrap_err();

    assert_eq!(err.user_facing().title, "Could not start the conversation");
    let state = h.controller.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.session.is_none());
    assert!(h.store.list_recent("alice", 10).await.unwrap().is_empty());
}

struct GatedCompletion {
    gate: Arc<Notify>,
}

#[async_trait]
impl CompletionService for GatedCompletion {
    async fn begin(&self, request: BeginRequest) -> anyhow::Result<BeginResponse> {
        self.gate.notified().await;
        Ok(BeginResponse {
            session_id: "gated".into(),
            assistant_text: "Shall we begin?".into(),
            goals: request.conversation_type.goals(),
        })
    }

    async fn continue_session(&self, _request: ContinueRequest) -> anyhow::Result<ContinueResponse> {
        self.gate.notified().await;
        Ok(ContinueResponse {
            assistant_text: "Go on.".into(),
        })
    }
}

async fn wait_for_phase(controller: &SessionController, phase: Phase) {
    for _ in 0..100 {
        if controller.snapshot().phase == phase {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("controller never reached {phase:?}");
}

#[tokio::test]
async fn operations_in_flight_reject_a_second_call() {
    let gate = Arc::new(Notify::new());
    let h = harness(GatedCompletion { gate: gate.clone() });

    let controller = h.controller.clone();
    let first =
        tokio::spawn(async move { controller.start_conversation(INTERVIEW, ConversationMedium::Text).await });
    wait_for_phase(&h.controller, Phase::Starting).await;

    let second = h
        .controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await;
    assert!(matches!(second, Err(MemoirError::Busy { operation: "start" })));

    gate.notify_one();
    first.await.unwrap().unwrap();

    let controller = h.controller.clone();
    let sending = tokio::spawn(async move { controller.send_message("first").await });
    wait_for_phase(&h.controller, Phase::Sending).await;
    assert!(matches!(
        h.controller.send_message("second").await,
        Err(MemoirError::Busy { operation: "send" })
    ));

    gate.notify_one();
    sending.await.unwrap().unwrap();
    let messages = h.controller.current_session().unwrap().messages;
    assert_eq!(messages.len(), 3);
}

#[tokio::test]
async fn end_during_start_is_rejected_and_the_start_still_lands() {
    let gate = Arc::new(Notify::new());
    let h = harness(GatedCompletion { gate: gate.clone() });

    let controller = h.controller.clone();
    let starting =
        tokio::spawn(async move { controller.start_conversation(INTERVIEW, ConversationMedium::Text).await });
    wait_for_phase(&h.controller, Phase::Starting).await;

    assert!(matches!(
        h.controller.end_conversation().await,
        Err(MemoirError::Busy { operation: "end" })
    ));
    assert_eq!(h.controller.snapshot().phase, Phase::Starting);

    gate.notify_one();
    let session = starting.await.unwrap().unwrap();
    assert_eq!(session.session_id, "gated");
    assert_eq!(h.controller.snapshot().phase, Phase::Active);

    // Once the start has landed an end is honoured and sticks.
    h.controller.end_conversation().await.unwrap();
    let state = h.controller.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.session.is_none());
}

#[tokio::test]
async fn finished_background_tasks_do_not_accumulate() {
    let h = harness(echo_completion("What was your first job?"));
    h.controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await
        .unwrap();
    assert!(!h.controller.is_idle());

    for turn in 0..8 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.controller
            .send_message(&format!("Answer number {turn}."))
            .await
            .unwrap();
        assert!(h.controller.background_tasks() <= 1);
    }

    h.controller.end_conversation().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.controller.background_tasks(), 0);
    assert!(h.controller.is_idle());
}

#[tokio::test]
async fn perth_reply_records_exactly_one_new_question() {
    let mut completion = MockCompletionService::new();
    completion.expect_begin().returning(|request| {
        Ok(BeginResponse {
            session_id: "s1".into(),
            assistant_text: "Welcome! Where did you grow up?".into(),
            goals: request.conversation_type.goals(),
        })
    });
    completion.expect_continue_session().times(1).returning(|_| {
        Ok(ContinueResponse {
            assistant_text:
                "Perth must have been lovely. What was your favourite place to play as a child?"
                    .into(),
        })
    });
    let h = harness(completion);

    h.controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await
        .unwrap();
    h.controller.drain_background_tasks().await;
    let before = h.store.question_count().await;

    h.controller.send_message("I grew up in Perth.").await.unwrap();
    h.controller.drain_background_tasks().await;

    assert_eq!(h.store.question_count().await, before + 1);
    let newest = h
        .ledger
        .recent_questions(&ScopeKey::new("alice", "book-1"), INTERVIEW, 1)
        .await
        .unwrap();
    let question = &newest[0];
    assert_eq!(
        question.question_text,
        "What was your favourite place to play as a child?"
    );
    assert!(!question.semantic_keywords.is_empty());
    assert!(question.response_quality.is_none());
    assert_eq!(question.session_id.as_deref(), Some("s1"));
}

#[tokio::test]
async fn self_conversation_never_calls_the_completion_service() {
    let h = harness(MockCompletionService::new());

    let session = h
        .controller
        .start_self_conversation(ConversationType::Reflection)
        .await
        .unwrap();
    assert!(session.is_self_conversation);
    assert!(session.messages.is_empty());

    let outcome = h
        .controller
        .send_message("Today I found my old diary.")
        .await
        .unwrap();
    assert!(outcome.reply.is_none());
    assert_eq!(h.controller.snapshot().phase, Phase::Active);

    let record = h
        .store
        .find(&session.session_id, "alice")
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_self_conversation);
    assert_eq!(record.messages.len(), 1);
}

#[tokio::test]
async fn invalid_sends_are_rejected_before_any_call() {
    let h = harness(MockCompletionService::new());
    assert!(matches!(
        h.controller.send_message("hello").await,
        Err(MemoirError::NoActiveSession)
    ));
    assert!(matches!(
        h.controller.send_message("   \n").await,
        Err(MemoirError::Validation(_))
    ));
    assert!(matches!(
        h.controller.conversation_insights(),
        Err(MemoirError::NoActiveSession)
    ));
}

#[tokio::test]
async fn end_resume_and_history() {
    let h = harness(echo_completion("Shall we start with your school days?"));

    h.controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await
        .unwrap();
    h.controller.end_conversation().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.controller
        .start_conversation(ConversationType::Brainstorming, ConversationMedium::Text)
        .await
        .unwrap();
    h.controller.end_conversation().await.unwrap();
    assert_eq!(h.controller.snapshot().phase, Phase::Idle);
    assert!(h.controller.current_session().is_none());

    let history = h.controller.load_history().await.unwrap();
    let ids: Vec<&str> = history.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["s2", "s1"]);

    let s1 = h.controller.load_session("s1").await.unwrap();
    h.controller.resume_conversation(s1).unwrap();
    let outcome = h.controller.send_message("Mostly football.").await.unwrap();
    assert_eq!(outcome.reply.unwrap().content, "Noted: Mostly football.");
    let record = h.store.find("s1", "alice").await.unwrap().unwrap();
    assert_eq!(record.messages.len(), 3);

    assert!(matches!(
        h.controller.load_session("missing").await,
        Err(MemoirError::NotFound { .. })
    ));
}

#[tokio::test]
async fn drafts_are_flushed_on_end_and_cleared_on_send() {
    let h = harness(echo_completion("What would you like to write about?"));
    h.controller
        .start_conversation(ConversationType::Brainstorming, ConversationMedium::Text)
        .await
        .unwrap();

    h.store.set_draft("alice", "s1", "half a thought").await.unwrap();
    assert_eq!(
        h.controller.get_draft().await.unwrap().as_deref(),
        Some("half a thought")
    );
    h.controller.send_message("A chapter on my garden.").await.unwrap();
    assert_eq!(h.controller.get_draft().await.unwrap(), None);

    h.controller.set_draft("and the roses").unwrap();
    h.controller.end_conversation().await.unwrap();
    assert_eq!(
        h.store.get_draft("alice", "s1").await.unwrap().as_deref(),
        Some("and the roses")
    );
}

#[tokio::test]
async fn delete_removes_record_and_draft_once() {
    let h = harness(echo_completion("Where shall we start?"));
    h.controller
        .start_conversation(INTERVIEW, ConversationMedium::Text)
        .await
        .unwrap();
    h.store.set_draft("alice", "s1", "unsent").await.unwrap();

    let (a, b) = tokio::join!(
        h.controller.delete_conversation("s1"),
        h.controller.delete_conversation("s1")
    );
    let removed = [a.unwrap(), b.unwrap()];
    assert_eq!(removed.iter().filter(|r| **r).count(), 1);

    assert!(h.store.find("s1", "alice").await.unwrap().is_none());
    assert!(h.store.get_draft("alice", "s1").await.unwrap().is_none());
    assert!(h.controller.current_session().is_none());
    assert!(!h.controller.delete_conversation("s1").await.unwrap());
}

#[tokio::test]
async fn read_side_reports_on_the_current_session() {
    let h = harness(echo_completion("How did you feel on your wedding day?"));
    h.controller
        .start_conversation(ConversationType::Reflection, ConversationMedium::Text)
        .await
        .unwrap();
    h.controller
        .send_message("I was so happy, my mother cried all through the ceremony.")
        .await
        .unwrap();

    let insights = h.controller.conversation_insights().unwrap();
    assert_eq!(insights.message_count, 3);
    assert_eq!(insights.user_message_count, 1);
    assert!(insights.topics_discussed.contains(&"family".to_string()));
    assert!(!h.controller.continuation_suggestions().unwrap().is_empty());
    assert!(!h.controller.is_healthy_conversation().unwrap());
}
