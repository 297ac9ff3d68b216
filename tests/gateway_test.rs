//! Integration tests for the vitalgate HTTP gateway

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use vitalgate::server::run;
use vitalgate::{Config, ProviderKind};

const WEBHOOK_SECRET: &str = "integration-test-secret";

fn test_config() -> Config {
    let mut config = Config::default();
    config.port = 0;
    config.vault_secret = "integration-test-vault".to_string();
    for provider in ProviderKind::ALL {
        config
            .providers
            .webhook_secrets
            .insert(provider, WEBHOOK_SECRET.to_string());
    }
    config
}

fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn sign_with_ampersand(body: &[u8], secret: &str) -> String {
    let mut signed = body.to_vec();
    signed.push(b'&');
    sign(&signed, secret)
}

async fn start_server() -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let (addr, shutdown_tx) = run(test_config()).await.expect("Failed to start server");
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, shutdown_tx)
}

/// Register a connected push device and return its serial number.
async fn connect_push_device(
    client: &reqwest::Client,
    addr: std::net::SocketAddr,
    provider: &str,
    serial: &str,
) -> serde_json::Value {
    let response = client
        .post(format!("http://{addr}/devices/connect"))
        .json(&serde_json::json!({
            "patient_id": "patient-1",
            "provider": provider,
            "serial_number": serial,
        }))
        .send()
        .await
        .expect("Failed to send connect request");
    assert!(response.status().is_success());
    response.json().await.expect("Failed to parse JSON")
}

fn healthkit_body(serial: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "device": {"serialNumber": serial},
        "samples": [
            {"type": "heartRate", "startDate": "2024-03-01T08:15:00Z", "value": 72.0},
            {"type": "oxygenSaturation", "startDate": "2024-03-01T08:20:00Z", "value": 0.97}
        ]
    }))
    .unwrap()
}

async fn sample_count(
    client: &reqwest::Client,
    addr: std::net::SocketAddr,
    metric: &str,
) -> u64 {
    let body: serde_json::Value = client
        .get(format!(
            "http://{addr}/patients/patient-1/samples/{metric}/count"
        ))
        .send()
        .await
        .expect("Failed to send count request")
        .json()
        .await
        .expect("Failed to parse JSON");
    body["count"].as_u64().unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, shutdown_tx) = start_server().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert!(body["version"].as_str().is_some());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_push_connect_returns_token_once() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    let body = connect_push_device(&client, addr, "apple-watch", "AW-100").await;
    assert_eq!(body["device"]["state"], "authorized");
    assert_eq!(body["device"]["provider"], "apple-watch");
    assert_eq!(body["push_token"].as_str().unwrap().len(), 32);

    // The device endpoint never returns credential material.
    let device_id = body["device"]["id"].as_str().unwrap();
    let device: serde_json::Value = client
        .get(format!("http://{addr}/devices/{device_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(device.get("credential").is_none());
    assert!(device.get("push_token").is_none());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_signed_webhook_is_ingested_and_replay_is_idempotent() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    connect_push_device(&client, addr, "apple-watch", "AW-200").await;

    let body = healthkit_body("AW-200");
    let signature = sign(&body, WEBHOOK_SECRET);

    let response = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .header("x-healthkit-signature", &signature)
        .body(body.clone())
        .send()
        .await
        .expect("Failed to send webhook");
    assert!(response.status().is_success());
    let result: serde_json::Value = response.json().await.unwrap();
    assert_eq!(result["processed"], 2);

    assert_eq!(sample_count(&client, addr, "heart_rate").await, 1);
    assert_eq!(sample_count(&client, addr, "blood_oxygen").await, 1);

    // Replaying the exact same webhook overwrites, never duplicates.
    let replay = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .header("x-healthkit-signature", &signature)
        .body(body)
        .send()
        .await
        .expect("Failed to send replay");
    assert!(replay.status().is_success());
    assert_eq!(sample_count(&client, addr, "heart_rate").await, 1);
    assert_eq!(sample_count(&client, addr, "blood_oxygen").await, 1);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_webhook_with_bad_signature_rejected() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    connect_push_device(&client, addr, "apple-watch", "AW-300").await;

    let body = healthkit_body("AW-300");
    let bad_signature = sign(&body, "wrong-secret");

    let response = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .header("x-healthkit-signature", &bad_signature)
        .body(body.clone())
        .send()
        .await
        .expect("Failed to send webhook");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Missing signature header is also a 401.
    let response = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .body(body)
        .send()
        .await
        .expect("Failed to send webhook");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Nothing was stored.
    assert_eq!(sample_count(&client, addr, "heart_rate").await, 0);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_webhook_for_unknown_serial_rejected() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    // No device registered at all for this serial.
    let body = healthkit_body("AW-UNREGISTERED");
    let signature = sign(&body, WEBHOOK_SECRET);

    let response = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .header("x-healthkit-signature", &signature)
        .body(body)
        .send()
        .await
        .expect("Failed to send webhook");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_malformed_webhook_body_rejected() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    let body = b"this is not json".to_vec();
    let signature = sign(&body, WEBHOOK_SECRET);

    let response = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .header("x-healthkit-signature", &signature)
        .body(body)
        .send()
        .await
        .expect("Failed to send webhook");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_unknown_provider_tag_rejected() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/webhooks/pebble"))
        .body("{}")
        .send()
        .await
        .expect("Failed to send webhook");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // Pull providers have no webhook surface.
    let response = client
        .post(format!("http://{addr}/webhooks/fitbit"))
        .body("{}")
        .send()
        .await
        .expect("Failed to send webhook");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_samsung_signature_includes_trailing_ampersand() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    connect_push_device(&client, addr, "samsung", "SM-R960").await;

    let body = serde_json::to_vec(&serde_json::json!({
        "device": {"serial": "SM-R960"},
        "records": [
            {"recordType": "HeartRateRecord", "time": "2024-03-01T07:00:00Z", "beatsPerMinute": 64}
        ]
    }))
    .unwrap();

    // A raw-body signature must be rejected for samsung.
    let raw_signature = sign(&body, WEBHOOK_SECRET);
    let response = client
        .post(format!("http://{addr}/webhooks/samsung"))
        .header("x-samsung-signature", &raw_signature)
        .body(body.clone())
        .send()
        .await
        .expect("Failed to send webhook");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // The body-plus-ampersand signature is the valid one.
    let signature = sign_with_ampersand(&body, WEBHOOK_SECRET);
    let response = client
        .post(format!("http://{addr}/webhooks/samsung"))
        .header("x-samsung-signature", &signature)
        .body(body)
        .send()
        .await
        .expect("Failed to send webhook");
    assert!(response.status().is_success());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_concurrent_replays_store_one_sample() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    connect_push_device(&client, addr, "apple-watch", "AW-400").await;

    let body = serde_json::to_vec(&serde_json::json!({
        "device": {"serialNumber": "AW-400"},
        "samples": [
            {"type": "heartRate", "startDate": "2024-03-01T08:15:00Z", "value": 72.0}
        ]
    }))
    .unwrap();
    let signature = sign(&body, WEBHOOK_SECRET);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let body = body.clone();
        let signature = signature.clone();
        handles.push(tokio::spawn(async move {
            client
                .post(format!("http://{addr}/webhooks/apple-watch"))
                .header("x-healthkit-signature", &signature)
                .body(body)
                .send()
                .await
                .expect("Failed to send webhook")
                .status()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert_eq!(sample_count(&client, addr, "heart_rate").await, 1);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_disconnected_device_stops_matching_webhooks() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    let connected = connect_push_device(&client, addr, "apple-watch", "AW-500").await;
    let device_id = connected["device"]["id"].as_str().unwrap();

    let body = healthkit_body("AW-500");
    let signature = sign(&body, WEBHOOK_SECRET);

    let response = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .header("x-healthkit-signature", &signature)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let response = client
        .delete(format!("http://{addr}/devices/{device_id}"))
        .send()
        .await
        .expect("Failed to disconnect");
    assert!(response.status().is_success());
    let disconnected: serde_json::Value = response.json().await.unwrap();
    assert_eq!(disconnected["state"], "disconnected");

    // Same valid signature, but the device no longer matches.
    let response = client
        .post(format!("http://{addr}/webhooks/apple-watch"))
        .header("x-healthkit-signature", &signature)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // Historical samples survive disconnection.
    assert_eq!(sample_count(&client, addr, "heart_rate").await, 1);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_pull_connect_returns_authorization_url() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/devices/connect"))
        .json(&serde_json::json!({
            "patient_id": "patient-2",
            "provider": "fitbit",
        }))
        .send()
        .await
        .expect("Failed to send connect request");
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["device"]["state"], "pending_auth");
    let url = body["authorization_url"].as_str().unwrap();
    assert!(url.contains("state="));
    assert!(body.get("push_token").is_none());

    // A bogus callback state is rejected.
    let response = client
        .get(format!("http://{addr}/oauth/callback?state=bogus&code=abc"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_trend_requires_enough_samples() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "http://{addr}/patients/patient-1/trends/resting_heart_rate"
        ))
        .send()
        .await
        .expect("Failed to send trend request");
    assert_eq!(
        response.status(),
        reqwest::StatusCode::UNPROCESSABLE_ENTITY
    );

    // Unknown metric names are a 400, not a 404 or 422.
    let response = client
        .get(format!("http://{addr}/patients/patient-1/trends/bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let _ = shutdown_tx.send(());
}
