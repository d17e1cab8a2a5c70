use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use surge_core::{DryRunEmitter, Engine, LogSink, SurgeConfig};
use surge_sim::router;

fn config() -> SurgeConfig {
    let mut config = SurgeConfig::default();
    config.emitter.dry_run = true;
    config.sink.flush_interval_ms = 50;
    config.shutdown_timeout_ms = 2000;
    config.profiles.insert(
        "quick".to_string(),
        json!({
            "protocolMix": {"TCP": 0.5, "UDP": 0.5},
            "targetRatePerSecond": 1000.0,
            "payloadSizeRange": [32, 64],
            "anomalyRate": 0.1,
            "count": 20
        }),
    );
    config.profiles.insert(
        "endless".to_string(),
        json!({
            "protocolMix": {"UDP": 1.0},
            "targetRatePerSecond": 20.0,
            "payloadSizeRange": [0, 16],
            "durationSecs": 3600.0
        }),
    );
    config.profiles.insert(
        "broken".to_string(),
        json!({
            "protocolMix": {"UDP": 1.0},
            "targetRatePerSecond": -1.0,
            "payloadSizeRange": [0, 16],
            "count": 5
        }),
    );
    config
}

async fn serve() -> (String, Arc<Engine>) {
    let engine = Arc::new(
        Engine::start(config(), Arc::new(DryRunEmitter::new()), Arc::new(LogSink)).unwrap(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(&engine));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), engine)
}

async fn start(base: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("{base}/campaigns"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn get(base: &str, path: &str) -> (u16, Value) {
    let response = reqwest::get(format!("{base}{path}")).await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn wait_for_state(base: &str, id: &str, state: &str) -> Value {
    for _ in 0..200 {
        let (_, body) = get(base, &format!("/campaigns/{id}")).await;
        if body["data"]["state"] == state {
            return body["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("campaign {id} never reached {state}");
}

#[tokio::test]
async fn test_list_profiles_reports_rejected_entries() {
    let (base, _engine) = serve().await;
    let (status, body) = get(&base, "/profiles").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);

    let names: Vec<&str> = body["data"]["profiles"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["endless", "quick"]);

    let rejected = body["data"]["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["name"], "broken");
}

#[tokio::test]
async fn test_start_and_poll_until_completed() {
    let (base, _engine) = serve().await;
    let (status, body) = start(&base, json!({"profile": "quick", "target": "127.0.0.1"})).await;
    assert_eq!(status, 200);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let done = wait_for_state(&base, &id, "Completed").await;
    assert_eq!(done["unitsEmitted"], 20);
    assert_eq!(done["profile"], "quick");

    let (_, all) = get(&base, "/campaigns").await;
    assert_eq!(all["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_stop_running_campaign() {
    let (base, _engine) = serve().await;
    let (_, body) = start(&base, json!({"profile": "endless", "target": "127.0.0.1"})).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/campaigns/{id}/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let stopped: Value = response.json().await.unwrap();
    let state = stopped["data"]["state"].as_str().unwrap();
    assert!(state == "Cancelling" || state == "Completed", "{state}");

    wait_for_state(&base, &id, "Completed").await;
}

#[tokio::test]
async fn test_errors_use_envelope_and_status() {
    let (base, _engine) = serve().await;

    let (status, body) = start(&base, json!({"profile": "nope", "target": "127.0.0.1"})).await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = start(
        &base,
        json!({"profile": "quick", "target": "127.0.0.1", "count": 0}),
    )
    .await;
    assert_eq!(status, 400);

    let (status, body) = get(&base, "/campaigns/not-a-uuid").await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);

    let (status, _) = get(&base, &format!("/campaigns/{}", uuid::Uuid::new_v4())).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let (base, _engine) = serve().await;
    let (_, body) = start(&base, json!({"profile": "quick", "target": "127.0.0.1"})).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    wait_for_state(&base, &id, "Completed").await;

    let text = reqwest::get(format!("{base}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("surge_units_total"));
    assert!(text.contains("surge_campaigns_running 0"));
}

#[tokio::test]
async fn test_start_after_shutdown_is_unavailable() {
    let (base, engine) = serve().await;
    engine.shutdown().await;

    let (status, body) = start(&base, json!({"profile": "quick", "target": "127.0.0.1"})).await;
    assert_eq!(status, 503);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_monitor_lifecycle() {
    let (base, _engine) = serve().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/monitors"))
        .json(&json!({"target": "127.0.0.1", "ports": [port], "intervalMs": 50}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let mut last = Value::Null;
    for _ in 0..100 {
        let (_, body) = get(&base, &format!("/monitors/{id}")).await;
        if body["data"]["rounds"].as_u64().unwrap_or(0) >= 1 {
            last = body["data"]["last"].clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(last["reachable"], true);
    assert_eq!(last["ports"][0]["state"], "open");

    let (_, all) = get(&base, "/monitors").await;
    assert_eq!(all["data"].as_array().unwrap().len(), 1);

    let response = client
        .post(format!("{base}/monitors/{id}/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let stopped: Value = response.json().await.unwrap();
    assert_eq!(stopped["data"]["active"], false);
}

#[tokio::test]
async fn test_monitor_errors_use_envelope_and_status() {
    let (base, _engine) = serve().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/monitors"))
        .json(&json!({"target": "127.0.0.1", "ports": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = client
        .post(format!("{base}/monitors"))
        .json(&json!({"target": "lab.local:99999"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let (status, body) = get(&base, "/monitors/not-a-uuid").await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);
}
