use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dumper::Dumper;
use serde::Deserialize;
use server_api::{
    create_backup, download_backup, list_backups, AdminUser, ApiContext, FlashStore,
    ResolvedDownload, Translator,
};
use shared::{
    domain::BackupType,
    error::{ApiError, ErrorCode},
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod config;
mod scheduler;

use config::{load_settings, prepare_database_url};

/// Canonical URL of the backup module; create and failed-download branches
/// redirect back here.
const MODULE_ROUTE: &str = "/backup";

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    /// Bearer token to the user it authenticates.
    users: HashMap<String, AdminUser>,
}

#[derive(Debug, Deserialize)]
struct ModuleQuery {
    create: Option<String>,
    download: Option<String>,
    #[serde(rename = "backupType")]
    backup_type: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let dumper = Dumper::new(&database_url, &settings.backup_dir, settings.retention())
        .await
        .map_err(|err| {
            error!(
                %database_url,
                error = %err,
                "failed to open source database; verify parent directory exists and permissions are correct"
            );
            err
        })?;

    if settings.users.is_empty() {
        warn!("no admin users configured; every request will be rejected");
    }

    let api = ApiContext {
        dumper: dumper.clone(),
        flash: FlashStore::default(),
        translator: Translator,
        download_file_name_current: settings.download_file_name_current.clone(),
    };

    scheduler::spawn_schedules(&dumper, settings.schedules());

    let users = settings
        .users
        .iter()
        .map(|entry| (entry.token.clone(), entry.as_admin_user()))
        .collect();
    let state = AppState { api, users };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(MODULE_ROUTE, get(backup_module))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// The module's single entry action: dispatches to create, download, or the
/// listing depending on which query parameters are present.
async fn backup_module(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ModuleQuery>,
) -> Result<Response, (StatusCode, Json<ApiError>)> {
    let user = authenticate(&state, &headers)?;

    if let Some(create_type) = non_empty(query.create.as_deref()) {
        create_backup(&state.api, &user, create_type)
            .await
            .map_err(reject)?;
        return Ok(see_other());
    }

    if let Some(file_name) = non_empty(query.download.as_deref()) {
        let backup_type = non_empty(query.backup_type.as_deref()).map(BackupType::from);
        let resolved = download_backup(&state.api, &user, file_name, backup_type)
            .await
            .map_err(reject)?;
        return match resolved {
            Some(download) => serve_file(download).await,
            None => Ok(see_other()),
        };
    }

    let back_url = headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("/");
    let page = list_backups(&state.api, &user, back_url)
        .await
        .map_err(reject)?;
    Ok(Json(page).into_response())
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AdminUser, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| reject(ApiError::new(ErrorCode::Unauthorized, "missing bearer token")))?;

    state
        .users
        .get(token)
        .cloned()
        .ok_or_else(|| reject(ApiError::new(ErrorCode::Unauthorized, "unknown token")))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn see_other() -> Response {
    (
        StatusCode::SEE_OTHER,
        [(header::LOCATION, HeaderValue::from_static(MODULE_ROUTE))],
    )
        .into_response()
}

async fn serve_file(download: ResolvedDownload) -> Result<Response, (StatusCode, Json<ApiError>)> {
    let bytes = tokio::fs::read(&download.file.path).await.map_err(|err| {
        error!(
            path = %download.file.path.display(),
            error = %err,
            "failed to read backup file"
        );
        reject(ApiError::new(
            ErrorCode::Internal,
            "failed to read backup file",
        ))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/gzip"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        download.download_name
    )) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((StatusCode::OK, headers, bytes).into_response())
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match &err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
