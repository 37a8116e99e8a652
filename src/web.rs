//! The HTTP surface: the authorization endpoint, read-only reflection
//! endpoints, administrative reload endpoints, and metrics exposition, served
//! on the configured unix or TCP listeners.
//!
//! The authorization path is fail-closed: every branch ends in an explicit
//! status write, and nothing but the decision's `ok` produces a 200.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use miette::{miette, IntoDiagnostic, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::input;
use crate::logging;
use crate::metrics::telemetry;
use crate::policy::loader;
use crate::policy::meta::{META_POLICY, QUERY};
use crate::policy::watcher;
use crate::settings::{self, Settings};
use crate::shutdown;

pub fn authorizer_router(settings: &Settings) -> Router {
    let mut router = Router::new()
        .route("/authorize", any(authorize))
        .route("/reflection/input", get(reflect_input))
        .route("/reflection/query", get(reflect_query))
        .route("/reflection/meta-policy", get(reflect_meta_policy))
        .route("/reflection/configuration", get(reflect_configuration))
        .route(
            "/reflection/default-configuration",
            get(reflect_default_configuration),
        )
        .route("/reload/configuration", any(reload_configuration))
        .route("/reload/policies", any(reload_policies))
        .route("/reload/reopen-log-file", any(reload_reopen_log_file));

    if settings.authorizer.includes_metrics {
        router = router.route(&settings.metrics.path, get(serve_metrics));
    }

    router.layer(TraceLayer::new_for_http())
}

pub fn metrics_router(settings: &Settings) -> Router {
    Router::new()
        .route(&settings.metrics.path, get(serve_metrics))
        .layer(TraceLayer::new_for_http())
}

// ─── Authorization ──────────────────────────────────────────────────────

async fn authorize(request: Request) -> Response {
    let settings = settings::active();

    let input = match input::make_input(request).await {
        Ok(input) => input,
        Err(error) => {
            tracing::error!(%error, "Unable to construct input");
            telemetry().errors.inc();
            return internal_server_error();
        }
    };

    // Capture the active evaluator once; evaluation and write-back below
    // must not observe a reload that lands mid-request.
    let Some(evaluator) = loader::active() else {
        tracing::error!("No evaluator loaded; denying");
        telemetry().denied.inc();
        return forbidden();
    };

    let input_json = input.to_json();
    let logged_input = settings.log.input.project(&input_json);

    let decision = match evaluator.evaluate(&input_json).await {
        Ok(decision) => decision,
        Err(error) => {
            tracing::error!(%error, "Error applying policy");
            telemetry().errors.inc();
            return internal_server_error();
        }
    };

    let decision_json = serde_json::to_value(&decision).unwrap_or_default();
    let logged_result = settings.log.detailed_result.project(&decision_json);

    if let Err(error) = evaluator.write_back(&decision.to_store) {
        tracing::error!(%error, "Error writing to policy storage");
        telemetry().errors.inc();
        return internal_server_error();
    }

    let logged_input = logged_input.unwrap_or(Value::Null);
    let logged_result = logged_result.unwrap_or(Value::Null);
    if decision.ok {
        telemetry().approved.inc();
        tracing::info!(input = %logged_input, result = %logged_result, "Request approved");
        return (StatusCode::OK, "OK\n").into_response();
    }

    // Deny by default: anything that is not an explicit approval lands here.
    telemetry().denied.inc();
    tracing::info!(input = %logged_input, result = %logged_result, "Request denied");
    forbidden()
}

// ─── Reflection ─────────────────────────────────────────────────────────

async fn reflect_input(request: Request) -> Response {
    if !settings::active().reflection.enabled {
        return not_found();
    }
    match input::make_input(request).await {
        Ok(input) => Json(input.to_json()).into_response(),
        Err(error) => {
            tracing::error!(%error, "Unable to construct input (likely a bug)");
            (StatusCode::INTERNAL_SERVER_ERROR, "Unable to construct input\n").into_response()
        }
    }
}

async fn reflect_query() -> Response {
    if !settings::active().reflection.enabled {
        return not_found();
    }
    ([(header::CONTENT_TYPE, "text/plain")], QUERY).into_response()
}

async fn reflect_meta_policy() -> Response {
    if !settings::active().reflection.enabled {
        return not_found();
    }
    ([(header::CONTENT_TYPE, "text/plain")], META_POLICY).into_response()
}

async fn reflect_configuration() -> Response {
    let settings = settings::active();
    if !settings.reflection.enabled {
        return not_found();
    }
    match serde_json::to_value(settings.as_ref()) {
        Ok(value) => Json(value).into_response(),
        Err(error) => {
            tracing::error!(%error, "Unable to marshal configuration (likely a bug)");
            (StatusCode::INTERNAL_SERVER_ERROR, "Unable to marshal configuration\n")
                .into_response()
        }
    }
}

async fn reflect_default_configuration() -> Response {
    if !settings::active().reflection.enabled {
        return not_found();
    }
    match serde_json::to_value(Settings::default()) {
        Ok(value) => Json(value).into_response(),
        Err(error) => {
            tracing::error!(%error, "Unable to marshal default configuration (likely a bug)");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to marshal default configuration\n",
            )
                .into_response()
        }
    }
}

// ─── Reload ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ReloadConfigurationResults {
    configuration: String,
    old_policy_watcher: String,
    new_policy_watcher: String,
    logger: String,
}

async fn reload_configuration(request: Request) -> Response {
    if !settings::active().reload.configuration {
        return not_found();
    }
    if let Some(response) = require_post(&request) {
        return response;
    }

    let new_settings = match settings::load() {
        Ok(settings) => settings,
        Err(error) => {
            tracing::warn!(%error, "Unable to reload config");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "Unable to reload configuration",
                    "reason": error.to_string(),
                })),
            )
                .into_response();
        }
    };

    // The snapshot pointer has swapped, so the reload as such succeeded;
    // everything below is reported per-subsystem in the response body.
    let mut results = ReloadConfigurationResults {
        configuration: "Reloaded OK (NOTE: some configuration values require a restart to change)"
            .to_string(),
        old_policy_watcher: "Did not attempt to stop".to_string(),
        new_policy_watcher: "Did not attempt to start".to_string(),
        logger: "Did not attempt to reopen".to_string(),
    };

    match logging::configure_logger() {
        Ok(()) => results.logger = "Reopened OK".to_string(),
        Err(error) => {
            tracing::error!(%error, "Unable to reopen log file");
            results.logger = format!("Unable to reopen log file: {error}");
        }
    }

    let original_watcher = watcher::active();
    if original_watcher.is_some() && !new_settings.policy.watch_directories {
        if let Some(original) = &original_watcher {
            original.close();
        }
        results.old_policy_watcher =
            "Stopped OK (because policy.watch_directories changed)".to_string();
        // Losing this swap just means another reload got there first; the
        // old watcher is closed either way.
        let _ = watcher::swap_active(&original_watcher, None);
    }

    if new_settings.policy.watch_directories {
        match watcher::watch_policies() {
            Err(error) => {
                tracing::error!(%error, "Unable to establish policy watcher");
                results.new_policy_watcher =
                    format!("Unable to establish policy watcher: {error}");
            }
            Ok(new_watcher) => {
                // The new watcher is live; only now is it safe to stop the
                // old one without leaving the directories unwatched.
                if let Some(original) = &original_watcher {
                    original.close();
                    results.old_policy_watcher =
                        "Stopped OK (restarting because we are watching policy directories)"
                            .to_string();
                }
                if watcher::swap_active(&original_watcher, Some(new_watcher.clone())) {
                    results.new_policy_watcher = "Started OK".to_string();
                } else {
                    new_watcher.close();
                    results.new_policy_watcher =
                        "Discarded OK (another reload already replaced the policy watcher)"
                            .to_string();
                }
            }
        }
    }

    (StatusCode::OK, Json(results)).into_response()
}

async fn reload_policies(request: Request) -> Response {
    if !settings::active().reload.policies {
        return not_found();
    }
    if let Some(response) = require_post(&request) {
        return response;
    }

    match loader::load_policies().await {
        Ok(()) => (StatusCode::OK, "Reloaded OK\n").into_response(),
        Err(error) => {
            tracing::warn!(%error, "Unable to reload policies");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Unable to reload policies: {error}\n"),
            )
                .into_response()
        }
    }
}

async fn reload_reopen_log_file(request: Request) -> Response {
    if !settings::active().reload.reopen_log_file {
        return not_found();
    }
    if let Some(response) = require_post(&request) {
        return response;
    }

    match logging::configure_logger() {
        Ok(()) => (StatusCode::OK, "Reloaded OK\n").into_response(),
        Err(error) => {
            tracing::warn!(%error, "Unable to reopen log file");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Unable to reopen log file: {error}\n"),
            )
                .into_response()
        }
    }
}

// ─── Metrics ────────────────────────────────────────────────────────────

async fn serve_metrics() -> Response {
    if !settings::active().metrics.enabled {
        return not_found();
    }
    match telemetry().render() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "Unable to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Unable to encode metrics\n").into_response()
        }
    }
}

// ─── Listeners ──────────────────────────────────────────────────────────

fn require_post(request: &Request) -> Option<Response> {
    if request.method() != Method::POST {
        return Some(
            (
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed (use POST)\n",
            )
                .into_response(),
        );
    }
    None
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 page not found\n").into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Forbidden\n").into_response()
}

fn internal_server_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n").into_response()
}

enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

async fn bind(listener: &settings::Listener) -> Result<BoundListener> {
    match listener.kind.as_str() {
        "tcp" => Ok(BoundListener::Tcp(
            TcpListener::bind(&listener.address).await.into_diagnostic()?,
        )),
        "unix" => {
            let path = Path::new(&listener.address);
            // A socket left behind by a previous run would fail the bind.
            if path.exists() {
                std::fs::remove_file(path).into_diagnostic()?;
            }
            Ok(BoundListener::Unix(
                UnixListener::bind(path).into_diagnostic()?,
                path.to_path_buf(),
            ))
        }
        other => Err(miette!("unsupported listener type `{other}`")),
    }
}

/// Serve a router on a bound listener. The server is registered with the
/// shutdown coordinator; if its accept loop ends on its own, that is fatal
/// and triggers shutdown.
fn spawn_server(name: &'static str, listener: BoundListener, router: Router<()>) {
    let token = CancellationToken::new();

    match listener {
        BoundListener::Tcp(tcp) => {
            shutdown::on_shutdown(name, {
                let token = token.clone();
                move || token.cancel()
            });
            tokio::spawn(async move {
                let service = router.into_make_service_with_connect_info::<SocketAddr>();
                let result = axum::serve(tcp, service)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
                if let Err(error) = &result {
                    tracing::error!(%error, server = name, "Server error");
                }
                let _ = shutdown::shutdown(&format!("{name} exited"), tracing::Level::ERROR);
            });
        }
        BoundListener::Unix(unix, socket_path) => {
            shutdown::on_shutdown(name, {
                let token = token.clone();
                let socket_path = socket_path.clone();
                move || {
                    token.cancel();
                    let _ = std::fs::remove_file(socket_path);
                }
            });
            tokio::spawn(async move {
                let service = router.into_make_service();
                let result = axum::serve(unix, service)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
                if let Err(error) = &result {
                    tracing::error!(%error, server = name, "Server error");
                }
                let _ = shutdown::shutdown(&format!("{name} exited"), tracing::Level::ERROR);
            });
        }
    }
}

/// Bind and start the authorization server.
pub async fn initialize_auth_server(settings: &Settings) -> Result<()> {
    let router = authorizer_router(settings);
    let listener = bind(&settings.authorizer.listener).await?;
    spawn_server("auth server", listener, router);
    tracing::info!(
        listener_type = %settings.authorizer.listener.kind,
        address = %settings.authorizer.listener.address,
        "Authorization server listening"
    );
    Ok(())
}

/// Bind and start the dedicated metrics server. The listener is always
/// bound; `metrics.enabled` gates each request, so it can be toggled by a
/// configuration reload without restarting.
pub async fn initialize_metrics_server(settings: &Settings) -> Result<()> {
    let router = metrics_router(settings);
    let listener = bind(&settings.metrics.listener).await?;
    spawn_server("metrics server", listener, router);
    tracing::info!(
        listener_type = %settings.metrics.listener.kind,
        address = %settings.metrics.listener.address,
        "Metrics server listening"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn request(method: &str, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_reflection_serves_builtin_sources() {
        let _guard = settings::TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        settings::publish_for_tests(Settings::default());
        let router = authorizer_router(&Settings::default());

        let response = router
            .clone()
            .oneshot(request("GET", "/reflection/query"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, QUERY);

        let response = router
            .oneshot(request("GET", "/reflection/meta-policy"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, META_POLICY);
    }

    #[tokio::test]
    async fn test_reflection_disabled_is_not_found() {
        let _guard = settings::TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let mut settings = Settings::default();
        settings.reflection.enabled = false;
        settings::publish_for_tests(settings);

        let router = authorizer_router(&Settings::default());
        let response = router
            .oneshot(request("GET", "/reflection/query"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        settings::publish_for_tests(Settings::default());
    }

    #[tokio::test]
    async fn test_reload_routes_require_post() {
        let _guard = settings::TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        settings::publish_for_tests(Settings::default());
        let router = authorizer_router(&Settings::default());

        let response = router
            .oneshot(request("GET", "/reload/policies"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_metrics_route_render() {
        let _guard = settings::TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        settings::publish_for_tests(Settings::default());
        let router = metrics_router(&Settings::default());

        let response = router.oneshot(request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("docker_sock_authorizer"));
    }
}
