//! HTTP routes.
//!
//! - `/api/catalog/*`: read-only reference data for rule authoring
//! - `/api/rules`: summaries of the loaded rules
//! - `/api/events`: trigger event ingestion
//! - `/api/runs/*`: run inspection, completion signals and cancellation

use crate::error::ApiError;
use autorule_core::{EntityTypeId, NodeId, RunInstanceId};
use autorule_workflow::catalog::{Entity, EntityType, TriggerType};
use autorule_workflow::{
    ActionTypeInfo, CompletionAck, CompletionOutcome, CompletionSignal, Engine, RuleSummary,
    RunSnapshot, TriggerEvent,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/catalog/trigger-types", get(list_trigger_types))
        .route("/api/catalog/entity-types", get(list_entity_types))
        .route("/api/catalog/entities", get(list_entities))
        .route("/api/catalog/action-types", get(list_action_types))
        .route(
            "/api/catalog/action-types/{action_type}/schema",
            get(action_type_schema),
        )
        .route("/api/rules", get(list_rules))
        .route("/api/events", post(publish_event))
        .route("/api/runs/{run_id}", get(get_run))
        .route("/api/runs/{run_id}/cancel", post(cancel_run))
        .route(
            "/api/runs/{run_id}/nodes/{node_id}/complete",
            post(complete_node),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid {what} '{raw}': {e}")))
}

async fn list_trigger_types(State(state): State<AppState>) -> Json<Vec<TriggerType>> {
    Json(state.engine.catalog().list_trigger_types().to_vec())
}

async fn list_entity_types(State(state): State<AppState>) -> Json<Vec<EntityType>> {
    Json(state.engine.catalog().list_entity_types().to_vec())
}

#[derive(Debug, Deserialize)]
struct EntitiesQuery {
    entity_type_id: Option<String>,
}

async fn list_entities(
    State(state): State<AppState>,
    Query(query): Query<EntitiesQuery>,
) -> Result<Json<Vec<Entity>>, ApiError> {
    let entity_type_id = query
        .entity_type_id
        .as_deref()
        .map(|raw| parse_id::<EntityTypeId>(raw, "entity type id"))
        .transpose()?;

    let entities = state
        .engine
        .catalog()
        .list_entities(entity_type_id)
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(entities))
}

async fn list_action_types(State(state): State<AppState>) -> Json<Vec<ActionTypeInfo>> {
    Json(
        state
            .engine
            .catalog()
            .list_action_types()
            .into_iter()
            .cloned()
            .collect(),
    )
}

async fn action_type_schema(
    State(state): State<AppState>,
    Path(action_type): Path<String>,
) -> Result<Json<ActionTypeInfo>, ApiError> {
    state
        .engine
        .catalog()
        .get_action_type_schema(&action_type)
        .map(|info| Json(info.clone()))
        .map_err(|e| ApiError::NotFound(e.to_string()))
}

async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<RuleSummary>>, ApiError> {
    let rules = state
        .engine
        .rules()
        .list()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(rules))
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    run_ids: Vec<RunInstanceId>,
}

async fn publish_event(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let run_ids = state.engine.trigger(event).await?;
    Ok((StatusCode::ACCEPTED, Json(PublishResponse { run_ids })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let run_id = parse_id::<RunInstanceId>(&run_id, "run id")?;
    Ok(Json(state.engine.snapshot(run_id).await?))
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    #[serde(default = "default_cancel_reason")]
    reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled by operator".to_string()
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    let run_id = parse_id::<RunInstanceId>(&run_id, "run id")?;
    let cancelled = state.engine.cancel(run_id, &request.reason).await?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    ack: CompletionAck,
}

async fn complete_node(
    State(state): State<AppState>,
    Path((run_id, node_id)): Path<(String, String)>,
    Json(outcome): Json<CompletionOutcome>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let signal = CompletionSignal {
        run_instance_id: parse_id(&run_id, "run id")?,
        node_id: parse_id::<NodeId>(&node_id, "node id")?,
        outcome,
    };
    let ack = state.engine.complete(signal).await?;
    Ok(Json(CompleteResponse { ack }))
}
