pub mod error;
pub mod handlers;
pub mod models;

use axum::{Router, routing::get};
use fogwatch_client::Backend;

use crate::AppState;

pub fn router<B: Backend>() -> Router<AppState<B>> {
    Router::new()
        .route("/api/dashboard", get(handlers::dashboard::<B>))
        .route("/api/sensors", get(handlers::list_sensors::<B>))
        .route(
            "/api/sensors/high-risk",
            get(handlers::list_high_risk_sensors::<B>),
        )
        .route("/api/detections", get(handlers::list_detections::<B>))
        .route(
            "/api/fogging-logs",
            get(handlers::list_fogging_logs::<B>).post(handlers::create_fogging_log::<B>),
        )
        .route("/api/sessions", get(handlers::list_sessions::<B>))
        .route("/health", get(health_handler))
}

async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::Json;
    use fogwatch_client::backend::memory::InMemoryBackend;
    use fogwatch_client::{Credentials, Dashboard, SessionStore};
    use fogwatch_core::row::{SensorRow, UserSessionRow};
    use jiff::tz::TimeZone;
    use serde_json::json;

    use super::handlers;
    use super::models::{FoggingLogRequest, SessionQueryParams};
    use crate::AppState;

    async fn state_with_backend() -> (AppState<InMemoryBackend>, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        crate::seed::demo(&backend).await;
        let shared = Arc::new(backend.clone());

        let state = AppState::new(
            Dashboard::new(Arc::clone(&shared)),
            SessionStore::new(shared),
            Arc::new(Credentials::anonymous()),
            TimeZone::UTC,
        );
        (state, backend)
    }

    async fn state() -> AppState<InMemoryBackend> {
        state_with_backend().await.0
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn logging_fogging_for_unknown_sensor_is_not_found() {
        let state = state().await;

        let result = handlers::create_fogging_log(
            State(state),
            Json(FoggingLogRequest {
                sensor_id: "nowhere".into(),
                date: None,
                notes: None,
            }),
        )
        .await;

        let response = axum::response::IntoResponse::into_response(result.unwrap_err());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logging_fogging_clears_high_risk() {
        let state = state().await;

        let response = handlers::create_fogging_log(
            State(state.clone()),
            Json(FoggingLogRequest {
                sensor_id: "sensor-quezon-hall".into(),
                date: None,
                notes: Some("after rain".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let snapshot = state.dashboard.snapshot(&state.now()).await;
        let ids: Vec<_> = snapshot.high_risk_sensors().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["sensor-lagoon"]);
    }

    #[tokio::test]
    async fn dashboard_reflects_backend_updates_between_requests() {
        let (state, backend) = state_with_backend().await;

        let first = body_json(handlers::dashboard(State(state.clone())).await).await;
        let high_risk = first["data"]["high_risk_sensors"].as_array().unwrap().len();

        backend
            .upsert_sensor(SensorRow {
                id: "sensor-new".to_owned(),
                name: Some("New Sensor".to_owned()),
                status: Some(json!("active")),
                mosquito_level: Some(json!("high")),
                ..Default::default()
            })
            .await;

        let second = body_json(handlers::dashboard(State(state)).await).await;
        assert_eq!(
            second["data"]["high_risk_sensors"].as_array().unwrap().len(),
            high_risk + 1
        );
        assert!(
            second["data"]["sensors"]
                .as_array()
                .unwrap()
                .iter()
                .any(|sensor| sensor["id"] == "sensor-new")
        );
    }

    #[tokio::test]
    async fn session_query_returns_rows_for_its_own_filter() {
        let (state, backend) = state_with_backend().await;
        for (id, email, active) in [("a", "ops@up.edu.ph", true), ("b", "admin@up.edu.ph", false)] {
            backend
                .insert_session(UserSessionRow {
                    id: id.to_owned(),
                    user_id: format!("user-{id}"),
                    email: Some(email.to_owned()),
                    login_time: Some("2024-06-01T08:00:00Z".to_owned()),
                    is_active: Some(active),
                    ..Default::default()
                })
                .await;
        }

        let response = handlers::list_sessions(
            State(state),
            Query(SessionQueryParams {
                active: Some(false),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let body = body_json(response).await;
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "b");
        assert_eq!(rows[0]["duration"], "");
    }

    #[tokio::test]
    async fn inverted_session_range_is_rejected() {
        let state = state().await;

        let result = handlers::list_sessions(
            State(state),
            Query(SessionQueryParams {
                from: Some("2024-06-02T00:00:00Z".parse().unwrap()),
                to: Some("2024-06-01T00:00:00Z".parse().unwrap()),
                ..Default::default()
            }),
        )
        .await;

        let response = axum::response::IntoResponse::into_response(result.unwrap_err());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
