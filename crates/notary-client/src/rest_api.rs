use crate::client::NotaryClient;
use crate::operation::Outcome;
use crate::session::SessionSnapshot;
use axum::{extract::State, Json};
use notary_common::{Action, NotaryId};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for the REST facade: the client plus the notary it fronts.
pub struct ApiState {
    pub client: Arc<NotaryClient>,
    pub notary_id: NotaryId,
}

#[derive(Serialize)]
pub struct OperationResponse {
    pub status: String,
    pub reason: Option<String>,
    pub payload: Vec<u8>,
    pub degraded: bool,
}

pub async fn start_operation(
    State(state): State<Arc<ApiState>>,
    Json(action): Json<Action>,
) -> Result<Json<OperationResponse>, String> {
    let handle = state
        .client
        .start(state.notary_id, action)
        .map_err(|e| e.to_string())?;
    let response = match handle.outcome().await {
        Outcome::Success { payload, degraded } => OperationResponse {
            status: "success".to_string(),
            reason: None,
            payload,
            degraded,
        },
        Outcome::Rejected { reason } => OperationResponse {
            status: "rejected".to_string(),
            reason: Some(reason),
            payload: vec![],
            degraded: false,
        },
        Outcome::Failed(e) => OperationResponse {
            status: "failed".to_string(),
            reason: Some(e.to_string()),
            payload: vec![],
            degraded: false,
        },
    };
    Ok(Json(response))
}

/// The snapshot returned here is the persistence format; feed it back through
/// the config's session file to survive a restart.
pub async fn session_snapshot(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<SessionSnapshot>, String> {
    state
        .client
        .session_snapshot(&state.notary_id)
        .map(Json)
        .ok_or_else(|| "no session for notary".to_string())
}

pub async fn metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
