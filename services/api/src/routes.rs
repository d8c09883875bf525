use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::voice;
use axum::extract::{FromRequestParts, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use memoir_core::MemoirError;
use memoir_core::analytics::{ConversationInsights, Suggestion};
use memoir_core::controller::{ControllerScope, SendOutcome, SessionController};
use memoir_core::ledger::QuestionStats;
use memoir_core::model::{ConversationMedium, ConversationSession, ConversationType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

pub const USER_HEADER: &str = "x-user-id";

/// The caller's user id, taken from the `x-user-id` header.
pub struct UserId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or(ApiError::MissingUser)
    }
}

#[derive(Debug, Deserialize)]
pub struct BookParams {
    pub book_id: String,
    #[serde(default)]
    pub chapter_id: Option<String>,
}

impl BookParams {
    fn scope(&self, user: &UserId) -> ControllerScope {
        ControllerScope::new(&user.0, &self.book_id, self.chapter_id.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct StartBody {
    conversation_type: ConversationType,
    #[serde(default)]
    medium: Option<ConversationMedium>,
    #[serde(default)]
    self_conversation: bool,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RatingBody {
    rating: i64,
}

#[derive(Debug, Serialize)]
struct InsightsResponse {
    insights: ConversationInsights,
    suggestions: Vec<Suggestion>,
    healthy: bool,
}

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
        )
    });

    let v1_routes = Router::new()
        .route("/conversations", post(start_conversation))
        .route("/conversations/messages", post(send_message))
        .route("/conversations/end", post(end_conversation))
        .route(
            "/conversations/draft",
            get(get_draft).put(set_draft).delete(clear_draft),
        )
        .route("/conversations/history", get(load_history))
        .route("/conversations/insights", get(insights))
        .route(
            "/conversations/{session_id}/resume",
            post(resume_conversation),
        )
        .route(
            "/conversations/{session_id}",
            axum::routing::delete(delete_conversation),
        )
        .route("/questions/{question_id}/rating", post(rate_question))
        .route("/questions/stats", get(question_stats))
        .route("/voice/ws", get(voice::voice_ws));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", v1_routes)
        .layer(trace_layer)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn controller(state: &AppState, user: &UserId, params: &BookParams) -> Arc<SessionController> {
    state.controller(params.scope(user))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "voice_connections": state.relay.manager().len().await,
    }))
}

async fn start_conversation(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
    Json(body): Json<StartBody>,
) -> ApiResult<(StatusCode, Json<ConversationSession>)> {
    let controller = controller(&state, &user, &params);
    let session = if body.self_conversation {
        controller
            .start_self_conversation(body.conversation_type)
            .await?
    } else {
        controller
            .start_conversation(
                body.conversation_type,
                body.medium.unwrap_or(ConversationMedium::Text),
            )
            .await?
    };
    Ok((StatusCode::CREATED, Json(session)))
}

async fn send_message(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Json<SendOutcome>> {
    let outcome = controller(&state, &user, &params)
        .send_message(&body.text)
        .await?;
    Ok(Json(outcome))
}

async fn resume_conversation(
    State(state): State<AppState>,
    user: UserId,
    Path(session_id): Path<String>,
    Query(params): Query<BookParams>,
) -> ApiResult<Json<ConversationSession>> {
    let controller = controller(&state, &user, &params);
    let session = controller.load_session(&session_id).await?;
    controller.resume_conversation(session.clone())?;
    Ok(Json(session))
}

async fn end_conversation(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
) -> ApiResult<StatusCode> {
    let scope = params.scope(&user);
    state.controller(scope.clone()).end_conversation().await?;
    state.controllers.release_if_idle(&scope);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_conversation(
    State(state): State<AppState>,
    user: UserId,
    Path(session_id): Path<String>,
    Query(params): Query<BookParams>,
) -> ApiResult<Json<Value>> {
    let deleted = controller(&state, &user, &params)
        .delete_conversation(&session_id)
        .await?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn get_draft(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
) -> ApiResult<Json<Value>> {
    let draft = controller(&state, &user, &params).get_draft().await?;
    Ok(Json(json!({ "draft": draft })))
}

async fn set_draft(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
    Json(body): Json<MessageBody>,
) -> ApiResult<StatusCode> {
    controller(&state, &user, &params).set_draft(&body.text)?;
    Ok(StatusCode::ACCEPTED)
}

async fn clear_draft(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
) -> ApiResult<StatusCode> {
    controller(&state, &user, &params).clear_draft().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_history(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
) -> ApiResult<Json<Vec<ConversationSession>>> {
    let history = controller(&state, &user, &params).load_history().await?;
    Ok(Json(history))
}

async fn insights(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
) -> ApiResult<Json<InsightsResponse>> {
    let controller = controller(&state, &user, &params);
    Ok(Json(InsightsResponse {
        insights: controller.conversation_insights()?,
        suggestions: controller.continuation_suggestions()?,
        healthy: controller.is_healthy_conversation()?,
    }))
}

async fn rate_question(
    State(state): State<AppState>,
    user: UserId,
    Path(question_id): Path<String>,
    Json(body): Json<RatingBody>,
) -> ApiResult<StatusCode> {
    if !state.ledger().rate(&user.0, &question_id, body.rating).await? {
        return Err(MemoirError::not_found("question", question_id).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn question_stats(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<BookParams>,
) -> ApiResult<Json<QuestionStats>> {
    let stats = state.ledger().stats(&user.0, &params.book_id).await?;
    Ok(Json(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request as HttpRequest, header};
    use memoir_core::completion::{
        BeginRequest, BeginResponse, CompletionService, ContinueRequest, ContinueResponse,
    };
    use memoir_core::model::ScopeKey;
    use memoir_core::prompts::PromptLibrary;
    use memoir_core::relay::RealtimeConnector;
    use memoir_core::store::InMemoryStore;
    use memoir_realtime::Link;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct ScriptedCompletion {
        sessions: AtomicUsize,
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        async fn begin(&self, request: BeginRequest) -> anyhow::Result<BeginResponse> {
            let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(BeginResponse {
                session_id: format!("s{n}"),
                assistant_text: "Hello! Where did you grow up?".to_string(),
                goals: request.conversation_type.goals(),
            })
        }

        async fn continue_session(
            &self,
            _request: ContinueRequest,
        ) -> anyhow::Result<ContinueResponse> {
            Ok(ContinueResponse {
                assistant_text: "What did your street in Perth look like?".to_string(),
            })
        }
    }

    struct NoUpstream;

    #[async_trait]
    impl RealtimeConnector for NoUpstream {
        async fn connect(&self) -> anyhow::Result<Link> {
            Err(anyhow!("voice is disabled in tests"))
        }
    }

    fn app() -> (AppState, Router) {
        let config = Config::from_lookup(|key| {
            (key == "OPENAI_API_KEY").then(|| "sk-test".to_string())
        })
        .unwrap();
        let state = AppState::with_services(
            Arc::new(InMemoryStore::new()),
            Arc::new(ScriptedCompletion {
                sessions: AtomicUsize::new(0),
            }),
            Arc::new(NoUpstream),
            Arc::new(PromptLibrary::default()),
            &config,
        );
        (state.clone(), create_router(state))
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> HttpRequest<Body> {
        request_as("alice", method, uri, body)
    }

    fn request_as(
        user: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> HttpRequest<Body> {
        let builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, user);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(router: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_needs_no_identity() {
        let (_, router) = app();
        let response = router
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn requests_without_a_user_are_rejected() {
        let (_, router) = app();
        let response = router
            .oneshot(
                HttpRequest::get("/v1/conversations/history?book_id=b1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn interview_round_trip_tracks_questions() {
        let (state, router) = app();

        let (status, session) = call(
            &router,
            request(
                Method::POST,
                "/v1/conversations?book_id=b1",
                Some(json!({"conversation_type": "interview"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(session["session_id"], "s1");
        assert_eq!(session["messages"].as_array().unwrap().len(), 1);

        let (status, outcome) = call(
            &router,
            request(
                Method::POST,
                "/v1/conversations/messages?book_id=b1",
                Some(json!({"text": "I grew up in Perth."})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["user_message"]["content"], "I grew up in Perth.");
        assert_eq!(
            outcome["reply"]["content"],
            "What did your street in Perth look like?"
        );

        let controller = state.controller(ControllerScope::new("alice", "b1", None));
        controller.drain_background_tasks().await;

        let (status, stats) = call(
            &router,
            request(Method::GET, "/v1/questions/stats?book_id=b1", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_questions"], 2);

        let (status, insights) = call(
            &router,
            request(Method::GET, "/v1/conversations/insights?book_id=b1", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(insights["insights"]["message_count"], 3);

        let (status, history) = call(
            &router,
            request(Method::GET, "/v1/conversations/history?book_id=b1", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(state.controllers.len(), 1);

        drop(controller);
        let (status, _) = call(
            &router,
            request(Method::POST, "/v1/conversations/end?book_id=b1", None),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.controllers.len(), 0);
    }

    #[tokio::test]
    async fn ratings_are_scoped_to_the_asking_user() {
        let (state, router) = app();
        call(
            &router,
            request(
                Method::POST,
                "/v1/conversations?book_id=b1",
                Some(json!({"conversation_type": "interview"})),
            ),
        )
        .await;
        state
            .controller(ControllerScope::new("alice", "b1", None))
            .drain_background_tasks()
            .await;
        let questions = state
            .ledger()
            .recent_questions(&ScopeKey::new("alice", "b1"), ConversationType::Interview, 10)
            .await
            .unwrap();
        assert_eq!(questions.len(), 1);
        let uri = format!("/v1/questions/{}/rating", questions[0].id);

        let (status, _) = call(
            &router,
            request_as("bob", Method::POST, &uri, Some(json!({"rating": 5}))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &router,
            request(Method::POST, &uri, Some(json!({"rating": 300}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["title"].is_string());
        assert!(body["description"].is_string());

        let (status, _) = call(
            &router,
            request(Method::POST, &uri, Some(json!({"rating": 4}))),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, stats) = call(
            &router,
            request(Method::GET, "/v1/questions/stats?book_id=b1", None),
        )
        .await;
        assert_eq!(stats["average_quality"], 4.0);
    }

    #[tokio::test]
    async fn core_errors_map_to_status_codes() {
        let (_, router) = app();

        let (status, body) = call(
            &router,
            request(
                Method::POST,
                "/v1/conversations/messages?book_id=b1",
                Some(json!({"text": "   "})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["title"].is_string());

        let (status, _) = call(
            &router,
            request(
                Method::POST,
                "/v1/conversations/messages?book_id=b1",
                Some(json!({"text": "Hello"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &router,
            request(Method::POST, "/v1/conversations/missing/resume?book_id=b1", None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &router,
            request(
                Method::POST,
                "/v1/questions/q1/rating",
                Some(json!({"rating": 9})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_record_was_removed() {
        let (_, router) = app();
        call(
            &router,
            request(
                Method::POST,
                "/v1/conversations?book_id=b1",
                Some(json!({"conversation_type": "reflection", "self_conversation": true})),
            ),
        )
        .await;
        let (_, history) = call(
            &router,
            request(Method::GET, "/v1/conversations/history?book_id=b1", None),
        )
        .await;
        let session_id = history[0]["session_id"].as_str().unwrap().to_string();

        let uri = format!("/v1/conversations/{session_id}?book_id=b1");
        let (status, body) = call(&router, request(Method::DELETE, &uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);

        let (_, body) = call(&router, request(Method::DELETE, &uri, None)).await;
        assert_eq!(body["deleted"], false);
    }
}
