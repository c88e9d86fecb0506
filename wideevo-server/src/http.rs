use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, instrument};

use crate::codec::ImageJpegEncoder;
use crate::config;
use crate::metadata::CameraIdentity;
use crate::pipeline::{Batch, PhotoPipeline};
use crate::store::{self, BatchStore, StoredBatch};

#[derive(Clone)]
pub struct AppState {
    pub cfg: config::SharedConfig,
    pub batches: Arc<BatchStore>,
}

#[derive(Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub start_index: Option<u32>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePhoto {
    pub filename: String,
    pub original_name: String,
    pub width: u32,
    pub height: u32,
    pub size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPhoto {
    pub name: String,
    pub reason: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: u64,
    pub archive_name: String,
    pub created_at: DateTime<Utc>,
    pub done: Vec<DonePhoto>,
    pub errors: Vec<FailedPhoto>,
}

impl BatchSummary {
    fn new(batch_id: u64, stored: &StoredBatch) -> Self {
        Self {
            batch_id,
            archive_name: stored.archive_name.clone(),
            created_at: stored.created_at,
            done: stored
                .outcome
                .done
                .iter()
                .map(|p| DonePhoto {
                    filename: p.filename.clone(),
                    original_name: p.original_name.clone(),
                    width: p.width,
                    height: p.height,
                    size: p.bytes.len(),
                })
                .collect(),
            errors: stored
                .outcome
                .errors
                .iter()
                .map(|(name, reason)| FailedPhoto {
                    name: name.clone(),
                    reason: reason.clone(),
                })
                .collect(),
        }
    }
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 5xx");
    } else if status.is_client_error() {
        tracing::warn!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 4xx");
    }
    res
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<config::Config>, StatusCode> {
    config::ConfigManager::to_struct(&state.cfg)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[instrument(err, skip_all)]
pub async fn patch_settings(
    State(state): State<AppState>,
    Json(payload): Json<SettingsUpdate>,
) -> Result<Json<config::BatchSettings>, StatusCode> {
    if let Some(p) = &payload.prefix {
        config::ConfigManager::set_prefix(&state.cfg, p)
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;
    }
    if let Some(s) = payload.start_index {
        config::ConfigManager::set_start_index(&state.cfg, s)
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;
    }
    if let Some(q) = payload.quality {
        config::ConfigManager::set_quality(&state.cfg, q)
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;
    }
    if let Some(w) = payload.workers {
        config::ConfigManager::set_workers(&state.cfg, w)
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;
    }
    config::ConfigManager::save(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(cfg.batch))
}

/// Every `file` part is one input photo. Optional `prefix` / `start_index`
/// text parts override the configured defaults for this batch only.
pub async fn create_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<BatchSummary>, StatusCode> {
    let mut inputs: Vec<(String, Vec<u8>)> = Vec::new();
    let mut prefix: Option<String> = None;
    let mut start_index: Option<u32> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let part = field.name().map(|s| s.to_string());
        match part.as_deref() {
            Some("file") => {
                let name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("upload-{}", inputs.len() + 1));
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| StatusCode::BAD_REQUEST)?
                    .to_vec();
                inputs.push((name, bytes));
            }
            Some("prefix") => {
                let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                config::validate_prefix(&text).map_err(|_| StatusCode::BAD_REQUEST)?;
                prefix = Some(text);
            }
            Some("start_index") => {
                let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                start_index = Some(text.trim().parse().map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            _ => {}
        }
    }
    if inputs.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let settings = &cfg.batch;
    let encoder = ImageJpegEncoder::new(settings.quality());
    let quality = encoder.quality();
    let pipeline = Arc::new(PhotoPipeline::new(
        &CameraIdentity::from(&cfg.camera),
        Arc::new(encoder),
    ));
    let total = inputs.len();
    let prefix = prefix.unwrap_or_else(|| settings.prefix().to_string());
    tracing::debug!(total, quality, prefix = %prefix, "batch started");
    let mut batch = Batch::new(
        inputs,
        Some(&prefix),
        Some(start_index.unwrap_or(settings.start_index())),
    );
    batch.process_concurrent(pipeline, settings.workers()).await;
    let outcome = batch.into_outcome();
    let (done, failed) = (outcome.done.len(), outcome.errors.len());

    let id = state.batches.insert(outcome, settings.archive_name());
    tracing::info!(batch = id, total, done, failed, "batch finished");
    let stored = state.batches.get(id).ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(BatchSummary::new(id, &stored)))
}

pub async fn get_batch(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Json<BatchSummary>, StatusCode> {
    let stored = state.batches.get(id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(BatchSummary::new(id, &stored)))
}

pub async fn get_photo(
    Path((id, filename)): Path<(u64, String)>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    if filename.contains('/') || filename.contains("..") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let stored = state.batches.get(id).ok_or(StatusCode::NOT_FOUND)?;
    let photo = stored.photo(&filename).ok_or(StatusCode::NOT_FOUND)?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", photo.filename),
            ),
        ],
        photo.bytes.clone(),
    )
        .into_response())
}

/// All finished photos of a batch as one zip, named after `archive_name`.
pub async fn get_archive(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let stored = state.batches.get(id).ok_or(StatusCode::NOT_FOUND)?;
    if stored.outcome.done.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    let bytes = store::build_archive(&stored.outcome.done).map_err(|e| {
        tracing::error!(batch = id, error = %e, "failed to build archive");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", stored.archive_name),
            ),
        ],
        bytes,
    )
        .into_response())
}

pub async fn delete_batch(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> StatusCode {
    if state.batches.remove(id) {
        tracing::info!(batch = id, "batch removed");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let api = Router::new()
        .route("/config", get(get_config))
        .route("/settings", patch(patch_settings))
        .route(
            "/batches",
            post(create_batch).layer(DefaultBodyLimit::disable()),
        )
        .route("/batches/{id}", get(get_batch).delete(delete_batch))
        .route("/batches/{id}/archive", get(get_archive))
        .route("/batches/{id}/photos/{filename}", get(get_photo))
        .with_state(state)
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses));

    Router::new().nest("/api", api)
}

/// Serve the HTTP API. If `bind` is Some it is parsed as a socket address, otherwise
/// defaults to 0.0.0.0:8080.
pub async fn serve(app: Router, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BatchOutcome, EncodedPhoto};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "wideevo-test-boundary";

    async fn test_app() -> (TempDir, AppState, Router) {
        let dir = TempDir::new().unwrap();
        let cfg = config::ConfigManager::load(Some(dir.path().join("wideevo.toml")))
            .await
            .unwrap();
        config::ConfigManager::set_workers(&cfg, 2).await.unwrap();
        let state = AppState {
            cfg,
            batches: Arc::new(BatchStore::new()),
        };
        let app = router(state.clone());
        (dir, state, app)
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::new(w, h))
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn text_part(body: &mut Vec<u8>, name: &str, value: &str) {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }

    fn file_part(body: &mut Vec<u8>, filename: &str, bytes: &[u8]) {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }

    fn upload(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/batches")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn fetch(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(res: Response) -> Vec<u8> {
        to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    /// Uploads one landscape PNG plus one undecodable file with overrides.
    async fn create_sample_batch(app: &Router) -> serde_json::Value {
        let mut body = Vec::new();
        text_part(&mut body, "prefix", "IMG_");
        text_part(&mut body, "start_index", "7");
        file_part(&mut body, "a.png", &png(40, 30));
        file_part(&mut body, "notes.txt", b"not an image");
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let res = app.clone().oneshot(upload(body)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        serde_json::from_slice(&body_bytes(res).await).unwrap()
    }

    #[tokio::test]
    async fn upload_applies_overrides_and_reports_failures() {
        let (_dir, _state, app) = test_app().await;
        let json = create_sample_batch(&app).await;

        assert_eq!(json["done"].as_array().unwrap().len(), 1);
        assert_eq!(json["done"][0]["filename"], "IMG_0007.JPG");
        assert_eq!(json["done"][0]["originalName"], "a.png");
        assert_eq!(json["done"][0]["width"], 2560);
        assert_eq!(json["done"][0]["height"], 1920);
        assert_eq!(json["errors"][0]["name"], "notes.txt");
        assert_eq!(json["archiveName"], "WideEvo_Photos.zip");
    }

    #[tokio::test]
    async fn upload_without_files_is_rejected() {
        let (_dir, _state, app) = test_app().await;
        let mut body = Vec::new();
        text_part(&mut body, "prefix", "IMG_");
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        let res = app.oneshot(upload(body)).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn photo_download_checks_batch_and_name() {
        let (_dir, _state, app) = test_app().await;
        let json = create_sample_batch(&app).await;
        let id = json["batchId"].as_u64().unwrap();

        let res = app
            .clone()
            .oneshot(fetch(&format!("/api/batches/{id}/photos/IMG_0007.JPG")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/jpeg");
        let jpeg = body_bytes(res).await;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let missing = app
            .clone()
            .oneshot(fetch(&format!("/api/batches/{id}/photos/IMG_0008.JPG")))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let unknown_batch = app
            .clone()
            .oneshot(fetch(&format!("/api/batches/{}/photos/IMG_0007.JPG", id + 100)))
            .await
            .unwrap();
        assert_eq!(unknown_batch.status(), StatusCode::NOT_FOUND);

        let traversal = app
            .clone()
            .oneshot(fetch(&format!("/api/batches/{id}/photos/..%2Fwideevo.toml")))
            .await
            .unwrap();
        assert_eq!(traversal.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn archive_bundles_finished_photos() {
        let (_dir, _state, app) = test_app().await;
        let json = create_sample_batch(&app).await;
        let id = json["batchId"].as_u64().unwrap();

        let res = app
            .clone()
            .oneshot(fetch(&format!("/api/batches/{id}/archive")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/zip");
        assert_eq!(
            res.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"WideEvo_Photos.zip\""
        );
        let mut archive = zip::ZipArchive::new(Cursor::new(body_bytes(res).await)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut jpeg = Vec::new();
        archive
            .by_name("IMG_0007.JPG")
            .unwrap()
            .read_to_end(&mut jpeg)
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let missing = app
            .oneshot(fetch(&format!("/api/batches/{}/archive", id + 100)))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_patch_validates_and_persists() {
        let (dir, _state, app) = test_app().await;
        let patch = |body: &'static str| {
            Request::builder()
                .method("PATCH")
                .uri("/api/settings")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let rejected = app.clone().oneshot(patch(r#"{"quality":0}"#)).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        let ok = app.clone().oneshot(patch(r#"{"quality":80}"#)).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(ok).await).unwrap();
        assert_eq!(json["quality"], 80);
        let on_disk = std::fs::read_to_string(dir.path().join("wideevo.toml")).unwrap();
        assert!(on_disk.contains("quality = 80"));
    }

    #[tokio::test]
    async fn delete_removes_the_batch_once() {
        let (_dir, state, app) = test_app().await;
        let json = create_sample_batch(&app).await;
        let id = json["batchId"].as_u64().unwrap();
        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/batches/{id}"))
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(first.status(), StatusCode::NO_CONTENT);
        assert!(state.batches.get(id).is_none());
        let second = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
        let gone = app
            .oneshot(fetch(&format!("/api/batches/{id}")))
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn summary_uses_camel_case_keys() {
        let store = BatchStore::new();
        let outcome = BatchOutcome {
            done: vec![EncodedPhoto {
                filename: "DSCF0001.JPG".into(),
                width: 2560,
                height: 1920,
                original_name: "IMG_1.png".into(),
                bytes: vec![0xFF, 0xD8, 0xFF, 0xD9],
            }],
            errors: vec![("notes.txt".into(), "failed to decode image: bad".into())],
        };
        let id = store.insert(outcome, "WideEvo_Photos.zip");
        let summary = BatchSummary::new(id, &store.get(id).unwrap());
        let json = serde_json::to_value(&summary).unwrap();

        assert_eq!(json["batchId"], id);
        assert_eq!(json["archiveName"], "WideEvo_Photos.zip");
        assert!(json["createdAt"].is_string());
        assert_eq!(json["done"][0]["filename"], "DSCF0001.JPG");
        assert_eq!(json["done"][0]["originalName"], "IMG_1.png");
        assert_eq!(json["done"][0]["size"], 4);
        assert_eq!(json["errors"][0]["name"], "notes.txt");
        assert!(json["errors"][0]["reason"].as_str().unwrap().contains("decode"));
    }
}
