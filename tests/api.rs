//! HTTP surface tests, driven through the router without a socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use sightline::api::{router, AppState};
use sightline::config::ApiConfig;

fn app() -> Router {
    let (engine, _) = common::tour_engine();
    let config = ApiConfig {
        port: 0,
        host: "127.0.0.1".to_string(),
        request_timeout: Duration::from_secs(5),
        cors_enabled: true,
    };
    router(Arc::new(AppState { engine }), &config)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

fn item_ids(body: &Value) -> Vec<String> {
    body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["mediaId"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn health_reports_model_state() {
    let app = app();
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["modelsReady"], false);
}

#[tokio::test]
async fn malformed_limit_uses_the_default() {
    let app = app();
    let (status, body) = get(&app, "/api/recommendations/popular?limit=abc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 20);
    assert_eq!(body["strategy"], "popular");
    assert_eq!(body["items"][0]["matchReason"], "popular");
}

#[tokio::test]
async fn unknown_strategy_is_a_bad_request() {
    let app = app();
    let (status, body) = get(&app, "/api/recommendations/bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _) = get(&app, "/api/recommendations").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn nearest_reports_unresolved_city() {
    let app = app();
    let (status, body) = get(&app, "/api/recommendations/nearest?ip=10.0.0.1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "CITY_UNRESOLVED");
    assert_eq!(body["error"]["details"]["source"], "unresolved");
    assert_eq!(body["error"]["details"]["clientIp"], "10.0.0.1");
}

#[tokio::test]
async fn nearest_honours_city_override_and_proxy_header() {
    let app = app();
    let (status, body) = get(&app, "/api/recommendations?strategy=nearest&cityId=tehran").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["city"]["source"], "override");
    assert_eq!(item_ids(&body)[0], "azadi-sunset");

    let request = Request::get("/api/recommendations/nearest")
        .header("x-forwarded-for", "5.160.3.4, 10.0.0.1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["city"]["source"], "ip");

    let (status, body) = get(&app, "/api/recommendations/nearby?cityId=tehran").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["strategy"], "nearest");
}

#[tokio::test]
async fn dislike_hides_the_batch_next_time() {
    let app = app();
    let (status, event) = post_json(
        &app,
        "/api/recommendations/feedback",
        json!({
            "userId": "u1",
            "action": "popular",
            "liked": false,
            "shownMediaIds": ["azadi-sunset", "hafez-tomb"],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(event["userId"], "u1");

    let (status, body) = get(&app, "/api/recommendations/popular?userId=u1&version=A").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["excludedCount"], 2);
    assert_eq!(item_ids(&body), vec!["naqsh-square"]);
}

#[tokio::test]
async fn feedback_without_user_is_rejected() {
    let app = app();
    let (status, _) = post_json(
        &app,
        "/api/recommendations/feedback",
        json!({ "userId": "  ", "action": "random", "liked": true }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn train_then_status() {
    let app = app();
    let (status, report) = post_json(&app, "/api/train", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["trained"], true);
    assert_eq!(report["mediaSamples"], 30);

    let (_, status_body) = get(&app, "/api/ml/status").await;
    assert_eq!(status_body["modelsReady"], true);
    assert_eq!(status_body["mediaModelUsers"], 6);

    let (_, health) = get(&app, "/health").await;
    assert_eq!(health["modelsReady"], true);
}

#[tokio::test]
async fn catalog_routes() {
    let app = app();

    let (status, cities) = get(&app, "/api/cities").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cities.as_array().unwrap().len(), 6);

    let (status, places) = get(&app, "/api/places/city/tehran").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(places.as_array().unwrap().len(), 3);

    let (status, body) = get(&app, "/api/places/city/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, feed) = get(&app, "/api/media?userId=alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(feed["ratedLow"][0]["mediaId"], "khaju-bridge");

    let (status, interests) = get(&app, "/api/users/alice/interests").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(interests["cities"][0]["id"], "tehran");
}

#[tokio::test]
async fn user_ratings_listing() {
    let app = app();
    let (status, body) = get(&app, "/api/users/alice/ratings").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userId"], "alice");
    assert_eq!(body["count"], 6);

    let items = body["items"].as_array().unwrap();
    assert_eq!(items[0]["mediaId"], "azadi-sunset");
    assert_eq!(items[0]["rate"], 5.0);
    assert_eq!(items[0]["liked"], true);
    assert_eq!(items[0]["media"]["title"], "Azadi Tower at sunset");
    let last = &items[5];
    assert_eq!(last["mediaId"], "khaju-bridge");
    assert_eq!(last["liked"], false);

    let (status, body) = get(&app, "/api/users/nobody/ratings").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn ab_summary_window() {
    let app = app();
    let (status, body) = get(&app, "/api/recommendations/ab/summary?days=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["days"], 7);
    assert_eq!(body["totalEvents"], 0);

    let (_, body) = get(&app, "/api/recommendations/ab/summary?days=9999").await;
    assert_eq!(body["days"], 365);
}
