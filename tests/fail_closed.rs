//! The authorization path before any policy load: with no evaluator
//! published, every request must be denied, never approved or errored.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use docker_socket_authorizer::settings::Settings;
use docker_socket_authorizer::web;

#[tokio::test]
async fn authorize_without_evaluator_is_forbidden() {
    // No settings file loaded and no policies loaded in this process.
    let router = web::authorizer_router(&Settings::default());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/authorize")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(String::from_utf8_lossy(&bytes), "Forbidden\n");
}
