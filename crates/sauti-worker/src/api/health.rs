//! Worker health probe.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use sauti_core::LifecycleState;

/// `GET /health` — lifecycle state, voice count, device, uptime.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let lifecycle_state = state.lifecycle.state();
    let voices = state.voices.ids().await.map(|ids| ids.len()).unwrap_or(0);

    Json(json!({
        "status": match lifecycle_state {
            LifecycleState::Ready => "healthy",
            LifecycleState::Uninitialized | LifecycleState::Loading => "initializing",
            _ => "unhealthy",
        },
        "lifecycle": lifecycle_state.as_str(),
        "voices_available": voices,
        "device": state.device,
        "uptime_seconds": state.started.elapsed().as_secs(),
    }))
}
