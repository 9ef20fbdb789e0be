use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};

use crate::{
    models::{DeleteProxyRequest, ProxyRequest},
    utils::{errors::ProxyError, state::AppState},
};

fn read_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ProxyError> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        tracing::warn!("Rejected request body: {rejection}");
        ProxyError::InvalidInput("Failed to read the request body.".to_string())
    })
}

// Handler to create a reverse-proxy virtual host, optionally with TLS
pub async fn create_proxy(
    State(appstate): State<AppState>,
    payload: Result<Json<ProxyRequest>, JsonRejection>,
) -> Result<StatusCode, ProxyError> {
    let request = read_body(payload)?;
    appstate.proxy_manager.create(request).await?;
    Ok(StatusCode::ACCEPTED)
}

// Handler to remove a reverse-proxy virtual host, acknowledged unconditionally
pub async fn delete_proxy(
    State(appstate): State<AppState>,
    payload: Result<Json<DeleteProxyRequest>, JsonRejection>,
) -> Result<StatusCode, ProxyError> {
    let request = read_body(payload)?;
    appstate.proxy_manager.delete(request).await;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        test_app_state, test_app_state_with_linker, AcmeFailure, FakeAcme, RecordingReload,
        StuckLinker, TestDirs,
    };
    use axum::{
        body::{to_bytes, Body},
        extract::Request,
        http::{header, Method},
        response::Response,
        routing::post,
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn create_test_router(app_state: AppState) -> Router {
        Router::new()
            .route("/proxy/create", post(create_proxy))
            .route("/proxy/delete", post(delete_proxy))
            .with_state(app_state)
    }

    async fn post_json(app: &Router, uri: &str, body: String) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn error_message(response: Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        body["error"].as_str().unwrap().to_string()
    }

    fn document(dirs: &TestDirs) -> std::path::PathBuf {
        dirs.available().join("app.example.com_8080.conf")
    }

    fn link(dirs: &TestDirs) -> std::path::PathBuf {
        dirs.enabled().join("app.example.com_8080.conf")
    }

    fn plain_body() -> String {
        json!({"domain": "app.example.com", "ip": "10.0.0.5", "port": "8080"}).to_string()
    }

    #[tokio::test]
    async fn test_create_plain_proxy() {
        let dirs = TestDirs::new();
        let reload = RecordingReload::new();
        let app = create_test_router(test_app_state(&dirs, reload.clone(), FakeAcme::new(AcmeFailure::Never)));

        let response = post_json(&app, "/proxy/create", plain_body()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let config = std::fs::read_to_string(document(&dirs)).unwrap();
        assert!(!config.contains("ssl"));
        assert!(config.contains("location /.well-known/acme-challenge/"));
        assert_eq!(std::fs::read_link(link(&dirs)).unwrap(), document(&dirs));
        assert_eq!(reload.count(), 1);
    }

    #[tokio::test]
    async fn test_create_then_delete_leaves_nothing() {
        let dirs = TestDirs::new();
        let app = create_test_router(test_app_state(
            &dirs,
            RecordingReload::new(),
            FakeAcme::new(AcmeFailure::Never),
        ));

        let response = post_json(&app, "/proxy/create", plain_body()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = post_json(
            &app,
            "/proxy/delete",
            json!({"domain": "app.example.com", "port": 8080}).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        assert!(!document(&dirs).exists());
        assert!(std::fs::symlink_metadata(link(&dirs)).is_err());
    }

    #[tokio::test]
    async fn test_create_with_supplied_certificate() {
        let dirs = TestDirs::new();
        let reload = RecordingReload::new();
        let app = create_test_router(test_app_state(&dirs, reload.clone(), FakeAcme::new(AcmeFailure::Never)));

        let body = json!({
            "domain": "app.example.com",
            "ip": "10.0.0.5",
            "port": "8080",
            "ssl": true,
            "use_lets_encrypt": false,
            "ssl_cert": "CERTIFICATE BYTES",
            "ssl_key": "KEY BYTES",
        });
        let response = post_json(&app, "/proxy/create", body.to_string()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let cert_path = dirs.certs().join("app.example.com/cert.pem");
        let key_path = dirs.certs().join("app.example.com/key.pem");
        assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), "CERTIFICATE BYTES");
        assert_eq!(std::fs::read_to_string(&key_path).unwrap(), "KEY BYTES");

        let config = std::fs::read_to_string(document(&dirs)).unwrap();
        assert!(config.contains(&format!("ssl_certificate {};", cert_path.display())));
        assert!(config.contains(&format!("ssl_certificate_key {};", key_path.display())));
        assert!(config.contains("listen 443 ssl http2;"));
        // plain activation, then the secured one
        assert_eq!(reload.count(), 2);
    }

    #[tokio::test]
    async fn test_create_with_acme_certificate() {
        let dirs = TestDirs::new();
        let acme = FakeAcme::new(AcmeFailure::Never);
        let app = create_test_router(test_app_state(&dirs, RecordingReload::new(), acme.clone()));

        let body = json!({
            "domain": "app.example.com",
            "ip": "10.0.0.5",
            "port": "8080",
            "ssl": true,
            "use_lets_encrypt": true,
            "client_email": "ops@example.com",
        });
        let response = post_json(&app, "/proxy/create", body.to_string()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        assert_eq!(acme.registrations(), vec!["ops@example.com"]);
        assert!(dirs.certs().join("app.example.com/cert.pem").exists());
        let config = std::fs::read_to_string(document(&dirs)).unwrap();
        assert!(config.contains("listen 443 ssl http2;"));
    }

    #[tokio::test]
    async fn test_acme_failures_are_distinguishable() {
        let body = json!({
            "domain": "app.example.com",
            "ip": "10.0.0.5",
            "port": "8080",
            "ssl": true,
            "use_lets_encrypt": true,
            "client_email": "ops@example.com",
        })
        .to_string();

        let mut messages = Vec::new();
        for failure in [AcmeFailure::Registration, AcmeFailure::Issuance] {
            let dirs = TestDirs::new();
            let app = create_test_router(test_app_state(&dirs, RecordingReload::new(), FakeAcme::new(failure)));

            let response = post_json(&app, "/proxy/create", body.clone()).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            messages.push(error_message(response).await);

            assert!(!dirs.certs().join("app.example.com/cert.pem").exists());
            assert!(!dirs.certs().join("app.example.com/key.pem").exists());
        }

        assert!(messages[0].contains("registration failed"));
        assert!(messages[1].contains("issuance failed"));
        assert_ne!(messages[0], messages[1]);
    }

    #[tokio::test]
    async fn test_recreate_overwrites_document() {
        let dirs = TestDirs::new();
        let app = create_test_router(test_app_state(
            &dirs,
            RecordingReload::new(),
            FakeAcme::new(AcmeFailure::Never),
        ));

        let response = post_json(&app, "/proxy/create", plain_body()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        std::fs::write(document(&dirs), "stale").unwrap();
        let response = post_json(&app, "/proxy/create", plain_body()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let config = std::fs::read_to_string(document(&dirs)).unwrap();
        assert!(config.contains("proxy_pass http://10.0.0.5:8080;"));
        assert_eq!(std::fs::read_dir(dirs.enabled()).unwrap().count(), 1);
        assert_eq!(std::fs::read_link(link(&dirs)).unwrap(), document(&dirs));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let dirs = TestDirs::new();
        let app = create_test_router(test_app_state(
            &dirs,
            RecordingReload::new(),
            FakeAcme::new(AcmeFailure::Never),
        ));

        let response = post_json(&app, "/proxy/create", "{not json".to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_message(response).await, "Failed to read the request body.");

        let body = json!({"domain": "App.example.com", "ip": "10.0.0.5", "port": "8080"});
        let response = post_json(&app, "/proxy/create", body.to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_message(response).await, "The domain must be lowercase.");

        // resolves, but not to the allocation
        let body = json!({"domain": "app.example.com", "ip": "10.0.0.99", "port": "8080"});
        let response = post_json(&app, "/proxy/create", body.to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(response).await.contains("[10.0.0.5]"));

        assert_eq!(std::fs::read_dir(dirs.available()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_reload_failure_is_internal() {
        let dirs = TestDirs::new();
        let app = create_test_router(test_app_state(
            &dirs,
            RecordingReload::failing(),
            FakeAcme::new(AcmeFailure::Never),
        ));

        let response = post_json(&app, "/proxy/create", plain_body()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            error_message(response).await,
            "Internal error while reloading the web server."
        );
    }

    #[tokio::test]
    async fn test_delete_keeps_document_when_link_removal_fails() {
        let dirs = TestDirs::new();
        let reload = RecordingReload::new();
        let app = create_test_router(test_app_state_with_linker(
            &dirs,
            StuckLinker,
            reload.clone(),
            FakeAcme::new(AcmeFailure::Never),
        ));

        let response = post_json(&app, "/proxy/create", plain_body()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = post_json(
            &app,
            "/proxy/delete",
            json!({"domain": "app.example.com", "port": "8080"}).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // the remaining link still points at an existing document
        assert_eq!(std::fs::read_link(link(&dirs)).unwrap(), document(&dirs));
        assert!(document(&dirs).exists());
        assert_eq!(reload.count(), 2);
    }

    #[tokio::test]
    async fn test_delete_is_always_accepted() {
        let dirs = TestDirs::new();
        let reload = RecordingReload::failing();
        let app = create_test_router(test_app_state(&dirs, reload.clone(), FakeAcme::new(AcmeFailure::Never)));

        let response = post_json(
            &app,
            "/proxy/delete",
            json!({"domain": "missing.example.com", "port": "25565"}).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = post_json(
            &app,
            "/proxy/delete",
            json!({"domain": "../../etc", "port": "80"}).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // the reload is attempted both times even though it fails
        assert_eq!(reload.count(), 2);
    }
}
