//! REST surface over the lifecycle core.
//!
//! Handlers are generic over the store so the whole router can be exercised
//! against the in-memory store in tests. Error bodies are JSON everywhere;
//! store faults are logged with detail and flattened to a generic 500.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Deserializer, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::kinds::BotKind;
use crate::lifecycle::{LifecycleManager, NewBot, NewConversation, NewMessage};
use crate::store::{BotPatch, ConversationFilter, Store};

const USER_ID_HEADER: &str = "x-user-id";

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = Result<T, ApiError>;

pub fn router<S: Store>(manager: Arc<LifecycleManager<S>>) -> Router {
    Router::new()
        .route("/api/bots", post(create_bot::<S>).get(list_bots::<S>))
        .route(
            "/api/bots/:id",
            get(get_bot::<S>)
                .put(update_bot::<S>)
                .delete(delete_bot::<S>),
        )
        .route("/api/bots/:id/duplicate", post(duplicate_bot::<S>))
        .route("/api/bots/:id/metrics", post(increment_metric::<S>))
        .route(
            "/api/bots/:id/conversations",
            post(start_conversation::<S>).get(list_conversations::<S>),
        )
        .route(
            "/api/bots/:bot_id/conversations/:conversation_id/messages",
            post(append_message::<S>),
        )
        .route("/api/stats", get(user_stats::<S>))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(manager)
}

/// Caller identity, taken from the `x-user-id` header the auth proxy in
/// front of this service injects. Missing or malformed ids are a 401.
pub struct AuthedUser(pub Uuid);

#[axum::async_trait]
impl<S: Send + Sync> axum::extract::FromRequestParts<S> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("missing x-user-id header"))?;
        let user_id = Uuid::parse_str(raw)
            .map_err(|_| unauthorized("x-user-id is not a valid uuid"))?;
        Ok(AuthedUser(user_id))
    }
}

fn unauthorized(msg: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": msg })),
    )
}

fn error_response(err: LifecycleError) -> ApiError {
    match err {
        LifecycleError::Validation(msg) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": msg })),
        ),
        LifecycleError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "resource not found" })),
        ),
        LifecycleError::QuotaExceeded { limit, current } => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": format!("bot quota reached ({current}/{limit})"),
                "limitReached": true,
                "currentBots": current,
                "maxBots": limit,
            })),
        ),
        LifecycleError::Busy => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "resource busy, retry later" })),
        ),
        LifecycleError::Store(detail) => {
            log::error!("store failure: {detail}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal server error" })),
            )
        }
    }
}

/// Distinguishes an omitted field from an explicit `null`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub branding: Option<serde_json::Value>,
    #[serde(default)]
    pub features: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateBotRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub category: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub personality: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub language: Option<Option<String>>,
    #[serde(default)]
    pub branding: Option<serde_json::Value>,
    #[serde(default)]
    pub features: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
}

impl From<UpdateBotRequest> for BotPatch {
    fn from(req: UpdateBotRequest) -> Self {
        BotPatch {
            name: req.name,
            description: req.description,
            category: req.category,
            personality: req.personality,
            language: req.language,
            branding: req.branding,
            features: req.features,
            status: req.status,
        }
    }
}

fn default_metric_value() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct MetricRequest {
    #[serde(rename = "metricType")]
    pub metric_type: String,
    #[serde(default = "default_metric_value")]
    pub value: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartConversationRequest {
    #[serde(default)]
    pub end_user_name: Option<String>,
    #[serde(default)]
    pub end_user_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppendMessageRequest {
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConversationQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub message: &'static str,
}

async fn create_bot<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Json(req): Json<CreateBotRequest>,
) -> ApiResult<(StatusCode, Json<crate::shared::models::Bot>)> {
    let input = NewBot {
        name: req.name,
        kind: req.kind.as_deref().map(BotKind::parse).unwrap_or_default(),
        description: req.description,
        category: req.category,
        personality: req.personality,
        language: req.language,
        branding: req.branding,
        features: req.features,
    };
    let bot = manager
        .create_bot(user_id, input)
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(bot)))
}

async fn list_bots<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
) -> ApiResult<Json<Vec<crate::shared::models::Bot>>> {
    let bots = manager.list_bots(user_id).map_err(error_response)?;
    Ok(Json(bots))
}

async fn get_bot<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<crate::shared::models::Bot>> {
    let bot = manager.get_bot(user_id, bot_id).map_err(error_response)?;
    Ok(Json(bot))
}

async fn duplicate_bot<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<crate::shared::models::Bot>)> {
    let copy = manager
        .duplicate_bot(user_id, bot_id)
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(copy)))
}

async fn update_bot<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path(bot_id): Path<Uuid>,
    Json(req): Json<UpdateBotRequest>,
) -> ApiResult<Json<crate::shared::models::Bot>> {
    let bot = manager
        .update_bot(user_id, bot_id, req.into())
        .map_err(error_response)?;
    Ok(Json(bot))
}

async fn delete_bot<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    manager
        .delete_bot(user_id, bot_id)
        .map_err(error_response)?;
    Ok(Json(DeletedResponse { message: "deleted" }))
}

async fn increment_metric<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path(bot_id): Path<Uuid>,
    Json(req): Json<MetricRequest>,
) -> ApiResult<Json<crate::shared::models::Bot>> {
    let bot = manager
        .increment_metric(user_id, bot_id, &req.metric_type, req.value)
        .map_err(error_response)?;
    Ok(Json(bot))
}

async fn start_conversation<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path(bot_id): Path<Uuid>,
    Json(req): Json<StartConversationRequest>,
) -> ApiResult<(StatusCode, Json<crate::shared::models::Conversation>)> {
    let conversation = manager
        .start_conversation(
            user_id,
            bot_id,
            NewConversation {
                end_user_name: req.end_user_name,
                end_user_email: req.end_user_email,
            },
        )
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn list_conversations<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path(bot_id): Path<Uuid>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Vec<crate::shared::models::Conversation>>> {
    let conversations = manager
        .list_conversations(
            user_id,
            bot_id,
            ConversationFilter {
                status: query.status,
            },
        )
        .map_err(error_response)?;
    Ok(Json(conversations))
}

async fn append_message<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
    Path((bot_id, conversation_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<AppendMessageRequest>,
) -> ApiResult<(StatusCode, Json<crate::shared::models::Message>)> {
    let message = manager
        .append_message(
            user_id,
            bot_id,
            conversation_id,
            NewMessage {
                sender: req.sender,
                content: req.content,
                attachments: req.attachments,
            },
        )
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn user_stats<S: Store>(
    State(manager): State<Arc<LifecycleManager<S>>>,
    AuthedUser(user_id): AuthedUser,
) -> ApiResult<Json<crate::shared::models::UserStats>> {
    let stats = manager.stats(user_id).map_err(error_response)?;
    Ok(Json(stats))
}

async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "bothive",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_request_distinguishes_null_from_omitted() {
        let omitted: UpdateBotRequest = serde_json::from_str(r#"{"name": "Bot"}"#).unwrap();
        assert_eq!(omitted.description, None);

        let nulled: UpdateBotRequest =
            serde_json::from_str(r#"{"description": null}"#).unwrap();
        assert_eq!(nulled.description, Some(None));

        let set: UpdateBotRequest =
            serde_json::from_str(r#"{"description": "hi"}"#).unwrap();
        assert_eq!(set.description, Some(Some("hi".to_string())));
    }

    #[test]
    fn test_metric_request_value_defaults_to_one() {
        let req: MetricRequest =
            serde_json::from_str(r#"{"metricType": "message_count"}"#).unwrap();
        assert_eq!(req.value, 1);

        let explicit: MetricRequest =
            serde_json::from_str(r#"{"metricType": "user_count", "value": 7}"#).unwrap();
        assert_eq!(explicit.value, 7);
    }
}
