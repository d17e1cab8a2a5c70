mod common;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use common::{config, fast_sink};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use surge_core::dispatcher::sink_from_config;
use surge_core::{
    CampaignRequest, DeliveryError, DryRunEmitter, Engine, ExitStatus, HttpSink,
    NotificationSink, SinkPayload,
};

#[derive(Clone, Default)]
struct Received {
    payloads: Arc<Mutex<Vec<SinkPayload>>>,
}

async fn ingest(
    State(received): State<Received>,
    headers: HeaderMap,
    Json(payload): Json<SinkPayload>,
) -> StatusCode {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer test-token-123");
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }
    received.payloads.lock().push(payload);
    StatusCode::ACCEPTED
}

async fn serve() -> (String, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/ingest", post(ingest))
        .with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/ingest"), received)
}

#[tokio::test]
async fn test_http_sink_sends_bearer_token() {
    let (url, received) = serve().await;
    let sink = HttpSink::new(url, Some("test-token-123".to_string()), Duration::from_secs(2)).unwrap();

    sink.push(&SinkPayload::default()).await.unwrap();
    assert_eq!(received.payloads.lock().len(), 1);
}

#[tokio::test]
async fn test_http_sink_rejection_is_typed() {
    let (url, received) = serve().await;
    let sink = HttpSink::new(url, Some("wrong".to_string()), Duration::from_secs(2)).unwrap();

    let err = sink.push(&SinkPayload::default()).await.unwrap_err();
    assert_eq!(err, DeliveryError::Rejected(401));
    assert!(received.payloads.lock().is_empty());
}

#[tokio::test]
async fn test_http_sink_unreachable_is_transport_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let sink = HttpSink::new(
        format!("http://127.0.0.1:{port}/ingest"),
        None,
        Duration::from_secs(2),
    )
    .unwrap();
    assert!(matches!(
        sink.push(&SinkPayload::default()).await,
        Err(DeliveryError::Transport(_))
    ));
}

#[tokio::test]
async fn test_engine_delivers_campaign_over_http() {
    let (url, received) = serve().await;
    let mut sink_config = fast_sink();
    sink_config.url = Some(url);
    sink_config.token = Some("test-token-123".to_string());

    let sink = sink_from_config(&sink_config).unwrap();
    let engine = Engine::start(config(sink_config), Arc::new(DryRunEmitter::new()), sink).unwrap();

    let status = engine
        .run_campaign(CampaignRequest {
            profile: "fast".to_string(),
            target: "127.0.0.1".to_string(),
            count: Some(60),
            ..CampaignRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(status.units_emitted, 60);

    let report = engine.shutdown().await;
    assert_eq!(report.status, ExitStatus::Success);

    let payloads = received.payloads.lock();
    let mut seqs: Vec<u64> = payloads
        .iter()
        .flat_map(|p| p.events.iter().map(|e| e.seq))
        .collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..60).collect::<Vec<_>>());
    assert!(payloads.iter().any(|p| p.summary.is_some()));
    assert!(payloads.iter().any(|p| p.notice.is_some()));
}
