use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fogwatch_client::Backend;
use fogwatch_client::backend::SessionFilter;
use fogwatch_core::session::SessionView;
use fogwatch_core::stats::{self, DetectionSummary};
use fogwatch_core::SensorId;
use jiff::Timestamp;
use tracing::info;

use super::error::ApiError;
use super::models::{ApiResponse, DashboardResponse, FoggingLogRequest, SessionQueryParams};
use crate::AppState;

fn success_response<T: serde::Serialize>(
    status: StatusCode,
    data: T,
    message: Option<String>,
) -> Response {
    let api_response = ApiResponse {
        success: true,
        data: Some(data),
        message,
    };
    (status, Json(api_response)).into_response()
}

/// Reloads every resource on each request so external updates show.
pub async fn dashboard<B: Backend>(State(state): State<AppState<B>>) -> Response {
    state.dashboard.refresh(&state.credentials().await).await;
    let snapshot = state.dashboard.snapshot(&state.now()).await;

    let response = DashboardResponse {
        high_risk_sensors: snapshot.high_risk_sensors().cloned().collect(),
        recent_detections: snapshot.detection_summaries(),
        snapshot,
    };

    success_response(StatusCode::OK, response, None)
}

pub async fn list_sensors<B: Backend>(
    State(state): State<AppState<B>>,
) -> Result<Response, ApiError> {
    let sensors = state.dashboard.fetch_sensors(&state.credentials().await).await?;
    Ok(success_response(StatusCode::OK, sensors, None))
}

pub async fn list_high_risk_sensors<B: Backend>(
    State(state): State<AppState<B>>,
) -> Result<Response, ApiError> {
    let sensors = state.dashboard.fetch_sensors(&state.credentials().await).await?;
    let high_risk: Vec<_> = stats::high_risk_sensors(&sensors).cloned().collect();

    Ok(success_response(StatusCode::OK, high_risk, None))
}

pub async fn list_detections<B: Backend>(
    State(state): State<AppState<B>>,
) -> Result<Response, ApiError> {
    let detections = state
        .dashboard
        .fetch_detections(&state.credentials().await)
        .await?;
    let summaries: Vec<_> = detections.iter().map(DetectionSummary::from).collect();

    Ok(success_response(StatusCode::OK, summaries, None))
}

pub async fn list_fogging_logs<B: Backend>(
    State(state): State<AppState<B>>,
) -> Result<Response, ApiError> {
    let logs = state
        .dashboard
        .fetch_fogging_logs(&state.credentials().await)
        .await?;
    Ok(success_response(StatusCode::OK, logs, None))
}

pub async fn create_fogging_log<B: Backend>(
    State(state): State<AppState<B>>,
    Json(request): Json<FoggingLogRequest>,
) -> Result<Response, ApiError> {
    let sensor_id = request.sensor_id.trim();
    if sensor_id.is_empty() {
        return Err(ApiError::BadRequest("sensor_id is required".into()));
    }

    let credentials = state.credentials().await;
    let sensors = state.dashboard.fetch_sensors(&credentials).await?;
    if !sensors.iter().any(|sensor| sensor.id.as_str() == sensor_id) {
        return Err(ApiError::NotFound(format!("Sensor {sensor_id} not found")));
    }

    let date = request.date.unwrap_or_else(|| state.now().date());
    state
        .dashboard
        .log_fogging(
            &credentials,
            SensorId::from(sensor_id),
            date,
            request.notes.as_deref(),
        )
        .await?;
    info!(sensor_id, %date, "fogging logged via API");

    Ok(success_response(
        StatusCode::CREATED,
        state.dashboard.snapshot(&state.now()).await.fogging_logs,
        Some("Fogging activity logged".into()),
    ))
}

pub async fn list_sessions<B: Backend>(
    State(state): State<AppState<B>>,
    Query(params): Query<SessionQueryParams>,
) -> Result<Response, ApiError> {
    if let (Some(from), Some(to)) = (params.from, params.to)
        && from > to
    {
        return Err(ApiError::BadRequest("`from` must not be after `to`".into()));
    }

    let filter = SessionFilter {
        active: params.active,
        email: params.email.filter(|email| !email.trim().is_empty()),
        from: params.from,
        to: params.to,
    };

    let credentials = state.credentials().await;
    let sessions = {
        let _guard = state.session_query.lock().await;
        state.sessions.set_filter(filter).await;
        state.sessions.fetch(&credentials).await?
    };

    // The rows this request fetched, not whatever the store holds by now.
    let now = Timestamp::now();
    let views: Vec<_> = sessions
        .into_iter()
        .map(|session| SessionView::new(session, now))
        .collect();

    Ok(success_response(StatusCode::OK, views, None))
}
