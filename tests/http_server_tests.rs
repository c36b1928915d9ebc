mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{ORIGIN, TestEngine, signable_zone, test_engine};
use zonesign::http_server::HttpServer;
use zonesign::model::NsecMode;

async fn send(t: &TestEngine, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let app = HttpServer::router(t.engine.clone());
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_check() {
    let t = test_engine();
    let (status, body) = send(&t, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_enable_generate_and_sign_over_http() {
    let t = test_engine();
    let zone = t.engine.keystore().provision_zone(ORIGIN).unwrap();

    let (status, body) = send(
        &t,
        "POST",
        &format!("/dnssec/zones/{}/enable", zone.id),
        Some(json!({ "algorithm": 13, "nsec_mode": "NSEC3", "auto_sign": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["zone"]["dnssec_enabled"], true);

    for is_ksk in [true, false] {
        let (status, body) = send(
            &t,
            "POST",
            &format!("/dnssec/keys/{}/generate", zone.id),
            Some(json!({ "algorithm": "ECDSAP256SHA256", "is_ksk": is_ksk })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["key"]["flags"], if is_ksk { 257 } else { 256 });
        assert!(body["key"].get("private_key").is_none());
    }

    let (_, body) = send(&t, "GET", &format!("/dnssec/keys/{}", zone.id), None).await;
    assert_eq!(body["keys"].as_array().unwrap().len(), 2);

    let (status, body) = send(&t, "GET", &format!("/dnssec/keys/{}/ds", zone.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ds_records"].as_array().unwrap().len(), 2);

    let (status, body) = send(
        &t,
        "POST",
        &format!("/dnssec/zones/{}/sign", zone.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    assert_eq!(body["entry"]["reason"], "manual");
    assert_eq!(body["entry"]["priority"], 10);

    let (_, body) = send(&t, "GET", &format!("/dnssec/zones/{}", zone.id), None).await;
    assert_eq!(body["zone"]["active_key_count"], 2);
    assert_eq!(body["policy"]["nsec_mode"], "NSEC3");
    assert_eq!(body["queue"]["status"], "pending");

    let (_, body) = send(&t, "GET", &format!("/dnssec/logs/{}?limit=2", zone.id), None).await;
    assert_eq!(body["logs"].as_array().unwrap().len(), 2);
    assert!(body["total"].as_u64().unwrap() >= 4);
}

#[tokio::test]
async fn test_rsa_1024_is_bad_request() {
    let t = test_engine();
    let zone = t.engine.keystore().provision_zone(ORIGIN).unwrap();
    send(
        &t,
        "POST",
        &format!("/dnssec/zones/{}/enable", zone.id),
        Some(json!({ "algorithm": 8, "nsec_mode": "NSEC", "auto_sign": false })),
    )
    .await;

    let (status, body) = send(
        &t,
        "POST",
        &format!("/dnssec/keys/{}/generate", zone.id),
        Some(json!({ "algorithm": 8, "key_size": 1024, "is_ksk": true })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "invalid_key_size");
    assert!(t.engine.keystore().keys(zone.id).is_empty());
}

#[tokio::test]
async fn test_error_status_codes() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);

    let (status, body) = send(&t, "GET", "/dnssec/zones/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "zone_not_found");

    let (status, body) = send(
        &t,
        "POST",
        &format!("/dnssec/zones/{}/enable", zone.id),
        Some(json!({ "algorithm": 13 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_enabled");

    let (status, body) = send(
        &t,
        "POST",
        &format!("/dnssec/keys/{}/generate", zone.id),
        Some(json!({ "algorithm": "BOGUS" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_algorithm");

    t.engine.request_sign(zone.id, None).unwrap();
    let ksk = t
        .engine
        .keystore()
        .active_keys(zone.id)
        .into_iter()
        .find(|k| k.is_ksk)
        .unwrap();
    let (status, body) = send(&t, "DELETE", &format!("/dnssec/keys/{}", ksk.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "key_in_use");
}

#[tokio::test]
async fn test_disable_over_http() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec3, false);
    t.engine.request_sign(zone.id, None).unwrap();

    let (status, body) = send(
        &t,
        "POST",
        &format!("/dnssec/zones/{}/disable", zone.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["deactivated_keys"].as_array().unwrap().len(), 2);
    assert_eq!(body["cancelled_entries"], 1);

    let (_, body) = send(&t, "GET", "/dnssec/zones", None).await;
    let zones = body["zones"].as_array().unwrap();
    assert_eq!(zones[0]["active_key_count"], 0);
    assert_eq!(zones[0]["dnssec_enabled"], false);

    let (_, body) = send(&t, "GET", &format!("/dnssec/queue?zone_id={}", zone.id), None).await;
    assert!(body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .all(|e| e["status"] != "pending"));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = test_engine();
    signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);

    let app = HttpServer::router(t.engine.clone());
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("zonesign_active_keys 2"));
}
