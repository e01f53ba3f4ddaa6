use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;

use catcher_server::routes;
use catcher_server::state::AppState;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

pub fn setup_test_app() -> Router {
    routes::router(Arc::new(AppState::new(Some(TEST_ADMIN_TOKEN.to_string()))))
}

pub fn setup_test_app_no_auth() -> Router {
    routes::router(Arc::new(AppState::new(None)))
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authorized(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    request
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}
