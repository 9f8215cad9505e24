use std::collections::BTreeMap;

use axum::{body, body::Body, http::Request};
use dumper::RetentionPolicy;
use shared::{domain::FlashLevel, protocol::ListingPage};
use tower::ServiceExt;

use super::*;

async fn test_app(root: &std::path::Path, current_name: Option<&str>) -> Router {
    let database_url = format!(
        "sqlite://{}",
        root.join("source.db").to_string_lossy().replace('\\', "/")
    );
    let mut types = BTreeMap::new();
    types.insert(BackupType::manual(), RetentionPolicy { max_files: 5 });
    let dumper = Dumper::new(&database_url, root.join("backups"), types)
        .await
        .expect("dumper");
    sqlx::query("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")
        .execute(dumper.pool())
        .await
        .expect("seed table");

    let api = ApiContext {
        dumper,
        flash: FlashStore::default(),
        translator: Translator,
        download_file_name_current: current_name.map(str::to_string),
    };

    let mut users = HashMap::new();
    users.insert(
        "admin-token".to_string(),
        AdminUser {
            name: "admin".to_string(),
            permissions: HashMap::from([(
                "modules".to_string(),
                vec!["database_backup".to_string()],
            )]),
        },
    );
    users.insert(
        "intern-token".to_string(),
        AdminUser {
            name: "intern".to_string(),
            permissions: HashMap::new(),
        },
    );

    build_router(Arc::new(AppState { api, users }))
}

async fn listing(app: &Router, token: &str) -> ListingPage {
    let request = Request::get(MODULE_ROUTE)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("listing page")
}

#[tokio::test]
async fn healthz_reports_ok_without_auth() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), None).await;

    let request = Request::get("/healthz").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), None).await;

    let request = Request::get(MODULE_ROUTE).body(Body::empty()).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::get(MODULE_ROUTE)
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_permission_never_reaches_the_dispatch_branches() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), None).await;

    for uri in [
        format!("{MODULE_ROUTE}?create=manual"),
        format!("{MODULE_ROUTE}?download=backup__x.sql.gz"),
        MODULE_ROUTE.to_string(),
    ] {
        let request = Request::get(uri.as_str())
            .header("authorization", "Bearer intern-token")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "uri {uri}");
    }

    let page = listing(&app, "admin-token").await;
    assert!(page.backup_types["manual"].is_empty(), "no backup was created");
}

#[tokio::test]
async fn manual_create_redirects_and_queues_a_confirmation() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), None).await;

    let request = Request::get(format!("{MODULE_ROUTE}?create=manual"))
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        HeaderValue::from_static(MODULE_ROUTE)
    );

    let page = listing(&app, "admin-token").await;
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].level, FlashLevel::Confirmation);
    assert_eq!(page.backup_types["manual"].len(), 1);
}

#[tokio::test]
async fn unregistered_create_type_warns_and_fails_softly() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), None).await;

    let request = Request::get(format!("{MODULE_ROUTE}?create=weekly"))
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let page = listing(&app, "admin-token").await;
    let levels: Vec<FlashLevel> = page.messages.iter().map(|m| m.level).collect();
    assert_eq!(levels, vec![FlashLevel::Warning, FlashLevel::Error]);
}

#[tokio::test]
async fn unresolved_download_redirects_with_an_error_message() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), None).await;

    let request = Request::get(format!("{MODULE_ROUTE}?download=backup__missing.sql.gz"))
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let page = listing(&app, "admin-token").await;
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].level, FlashLevel::Error);
}

#[tokio::test]
async fn download_serves_the_file_under_the_configured_current_name() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), Some("current_db")).await;

    let request = Request::get(format!("{MODULE_ROUTE}?create=manual"))
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .expect("request");
    app.clone().oneshot(request).await.expect("response");
    let page = listing(&app, "admin-token").await;
    let file_name = page.backup_types["manual"][0].file_name.clone();

    let request = Request::get(format!("{MODULE_ROUTE}?download={file_name}"))
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        HeaderValue::from_static("application/gzip")
    );
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        HeaderValue::from_static("attachment; filename=\"current_db.sql.gz\"")
    );

    let request = Request::get(format!(
        "{MODULE_ROUTE}?download={file_name}&backupType=manual"
    ))
    .header("authorization", "Bearer admin-token")
    .body(Body::empty())
    .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .expect("header");
    assert_eq!(disposition, format!("attachment; filename=\"{file_name}\""));
}

#[tokio::test]
async fn listing_carries_the_referer_as_back_url() {
    let root = tempfile::tempdir().expect("tempdir");
    let app = test_app(root.path(), None).await;

    let request = Request::get(MODULE_ROUTE)
        .header("authorization", "Bearer admin-token")
        .header("referer", "/admin")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let page: ListingPage = serde_json::from_slice(&bytes).expect("listing page");
    assert_eq!(page.back_url, "/admin");
}
