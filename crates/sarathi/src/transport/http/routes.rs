//! HTTP route handlers.
//!
//! Capability endpoints always answer 200: a fallback value is a valid,
//! if degraded, answer. The `x-sarathi-source` header says where the value
//! came from.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Serialize;

use crate::capability::{MatchInput, TranscribeInput, TranslateInput};
use crate::client::Source;
use crate::service::{BridgeService, HealthSnapshot};

pub const SOURCE_HEADER: HeaderName = HeaderName::from_static("x-sarathi-source");

#[derive(Debug, Serialize)]
pub struct TranslateResponse {
    pub translated: String,
}

fn with_source<T: Serialize>(source: Source, body: T) -> impl IntoResponse {
    let header = HeaderValue::from_str(&source.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    ([(SOURCE_HEADER, header)], Json(body))
}

async fn health_check(State(service): State<Arc<BridgeService>>) -> Json<HealthSnapshot> {
    Json(service.health())
}

async fn match_topic(
    State(service): State<Arc<BridgeService>>,
    Json(input): Json<MatchInput>,
) -> impl IntoResponse {
    let resolution = service.matcher().call_detailed(input).await;
    tracing::debug!(source = %resolution.source, topic = %resolution.value.topic, "Match resolved");
    with_source(resolution.source, resolution.value)
}

async fn translate(
    State(service): State<Arc<BridgeService>>,
    Json(input): Json<TranslateInput>,
) -> impl IntoResponse {
    let resolution = service.translator().call_detailed(input).await;
    tracing::debug!(source = %resolution.source, "Translation resolved");
    with_source(
        resolution.source,
        TranslateResponse {
            translated: resolution.value,
        },
    )
}

async fn transcribe(
    State(service): State<Arc<BridgeService>>,
    Json(input): Json<TranscribeInput>,
) -> impl IntoResponse {
    let resolution = service.transcriber().call_detailed(input).await;
    tracing::debug!(source = %resolution.source, "Transcription resolved");
    with_source(resolution.source, resolution.value)
}

async fn shutdown(State(service): State<Arc<BridgeService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<BridgeService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/match", post(match_topic))
        .route("/translate", post(translate))
        .route("/transcribe", post(transcribe))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::fake_service;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn source(response: &axum::response::Response) -> &str {
        response.headers()[&SOURCE_HEADER].to_str().unwrap()
    }

    #[tokio::test]
    async fn health_check_reports_every_bridge() {
        let service = Arc::new(fake_service());
        let app = routes(Arc::clone(&service));

        let response = app
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert!(json["version"]["sarathi"].is_string());
        assert_eq!(json["bridges"]["match"]["status"], "READY");
        assert_eq!(json["bridges"]["translate"]["breaker"]["status"], "closed");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn translate_then_cache() {
        let service = Arc::new(fake_service());
        let body = serde_json::json!({"text": "How are you", "target_lang": "ml"});

        let response = routes(Arc::clone(&service))
            .oneshot(post_json("/translate", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(source(&response), "worker");
        assert_eq!(response_json(response).await["translated"], "എങ്ങനെയുണ്ട്");

        let response = routes(Arc::clone(&service))
            .oneshot(post_json("/translate", body))
            .await
            .unwrap();
        assert_eq!(source(&response), "cache");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn match_returns_topic() {
        let service = Arc::new(fake_service());
        let response = routes(Arc::clone(&service))
            .oneshot(post_json(
                "/match",
                serde_json::json!({
                    "userQuery": "what is my balance",
                    "nativeQuery": "ബാലൻസ് എത്ര",
                    "options": ["Check bank balance", "Send money to friend"],
                    "language": "Malayalam"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["match"], "Check bank balance");
        assert_eq!(json["correctedNative"], "ബാലൻസ്");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn fallbacks_are_ordinary_responses() {
        let service = Arc::new(fake_service());
        let response = routes(Arc::clone(&service))
            .oneshot(post_json(
                "/transcribe",
                serde_json::json!({"audio": "data:audio/wav;base64,***"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(source(&response), "fallback:invalid_input");
        assert_eq!(response_json(response).await, serde_json::json!({"text": ""}));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn transcribe_accepts_data_uri() {
        let service = Arc::new(fake_service());
        let response = routes(Arc::clone(&service))
            .oneshot(post_json(
                "/transcribe",
                serde_json::json!({"audio": "data:audio/wav;base64,UklGRg==", "language": "Malayalam"}),
            ))
            .await
            .unwrap();

        assert_eq!(source(&response), "worker");
        assert_eq!(response_json(response).await["text"], "how are you");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let service = Arc::new(fake_service());
        let response = routes(Arc::clone(&service))
            .oneshot(post_json("/translate", serde_json::json!({"target_lang": "ml"})))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_triggers_service_shutdown() {
        let service = Arc::new(fake_service());
        let mut rx = service.shutdown_rx();
        let app = routes(Arc::clone(&service));

        assert!(!*rx.borrow());

        let response = app
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        service.shutdown().await;
    }
}
