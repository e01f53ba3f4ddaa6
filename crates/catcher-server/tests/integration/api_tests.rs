use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use crate::common::{
    TEST_ADMIN_TOKEN, authorized, body_json, json_request, setup_test_app, setup_test_app_no_auth,
};

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app();

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["kill"], false);
}

#[tokio::test]
async fn unknown_group_reads_null() {
    let app = setup_test_app();

    let response = app
        .oneshot(Request::get("/v1/signals/team").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["group"], "TEAM");
    assert!(json["value"].is_null());
}

#[tokio::test]
async fn set_and_get_group_signal() {
    let app = setup_test_app();

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/v1/signals/night%20shift",
            json!({ "value": "run" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["group"], "NIGHT_SHIFT");
    assert_eq!(json["value"], "RUN");

    // Stored under the sanitised key.
    let response = app
        .clone()
        .oneshot(
            Request::get("/v1/signals/NIGHT_SHIFT")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["value"], "RUN");
    assert!(json["updated_at"].is_string());

    let response = app
        .oneshot(Request::get("/v1/signals").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["signals"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn null_clears_a_group_signal() {
    let app = setup_test_app();

    app.clone()
        .oneshot(json_request("PUT", "/v1/signals/TEAM", json!({ "value": "STOP" })))
        .await
        .unwrap();
    let response = app
        .clone()
        .oneshot(json_request("PUT", "/v1/signals/TEAM", json!({ "value": null })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::get("/v1/signals/TEAM").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(body_json(response).await["value"].is_null());
}

#[tokio::test]
async fn invalid_signal_value_returns_400() {
    let app = setup_test_app();

    for value in ["PAUSE", "KILL"] {
        let response = app
            .clone()
            .oneshot(json_request("PUT", "/v1/signals/TEAM", json!({ "value": value })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "validation_error");
    }
}

#[tokio::test]
async fn kill_write_without_token_returns_401() {
    let app = setup_test_app();

    let response = app
        .oneshot(json_request("PUT", "/v1/kill", json!({ "active": true })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn kill_write_with_wrong_token_returns_401() {
    let app = setup_test_app();

    let request = authorized(
        json_request("PUT", "/v1/kill", json!({ "active": true })),
        "wrong-token",
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth();

    let request = authorized(
        json_request("PUT", "/v1/kill", json!({ "active": true })),
        "any-token",
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "forbidden");
}

#[tokio::test]
async fn kill_switch_round_trip() {
    let app = setup_test_app();

    let request = authorized(
        json_request("PUT", "/v1/kill", json!({ "active": true })),
        TEST_ADMIN_TOKEN,
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["active"], true);
    assert!(json["since"].is_string());

    // Reads are public.
    let response = app
        .clone()
        .oneshot(Request::get("/v1/kill").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(response).await["active"], true);

    let request = authorized(
        json_request("PUT", "/v1/kill", json!({ "active": false })),
        TEST_ADMIN_TOKEN,
    );
    let response = app.oneshot(request).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["active"], false);
    assert!(json["since"].is_null());
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = setup_test_app();

    let response = app
        .oneshot(
            Request::get("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["paths"]["/v1/kill"].is_object());
}
