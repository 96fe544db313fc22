//! OTA and vision HTTP server.
//!
//! The Watcher firmware bootstraps against this server: it POSTs a check-in
//! to `/ota` and receives the WebSocket URL to connect to, may poll
//! `/ota/version` / `/ota/firmware` for updates, and uploads camera JPEGs to
//! `/vision/explain` for scene description.
//!
//! Response shapes on `/vision/explain` are the firmware's contract
//! (`{"success": bool, "message": str}`), not ours to change.

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::bridge::Bridge;

const FIRMWARE_PATH: &str = "/data/firmware.bin";
const LAST_PHOTO_PATH: &str = "/data/last_photo.jpg";

pub async fn serve(bridge: Arc<Bridge>, port: u16) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ota/version", get(handle_version))
        .route("/ota/firmware", get(handle_firmware))
        .route("/ota", post(handle_checkin))
        .route("/ota/", post(handle_checkin))
        .route("/vision/explain", post(handle_vision_explain))
        .layer(DefaultBodyLimit::max(8 * 1024 * 1024))
        .layer(cors)
        .with_state(bridge);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind OTA server on port {port}"))?;
    tracing::info!("OTA HTTP server started on port {port}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "build": "1",
    }))
}

async fn handle_firmware() -> impl IntoResponse {
    match tokio::fs::read(FIRMWARE_PATH).await {
        Ok(bytes) => (
            StatusCode::OK,
            [("Content-Type", "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Firmware not found").into_response(),
    }
}

/// Device check-in. The reply tells the firmware where the WebSocket server
/// lives: the host the device used to reach us, unless `host_ip` overrides.
async fn handle_checkin(
    State(bridge): State<Arc<Bridge>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let device_info: serde_json::Value = serde_json::from_str(&body).unwrap_or(json!({}));

    let version = device_info
        .pointer("/application/version")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let device_ip = device_info
        .pointer("/board/ip")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let mac = device_info
        .get("mac_address")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    tracing::info!("OTA check-in: device={mac}, version={version}, ip={device_ip}");

    let host = headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(':').next())
        .unwrap_or("127.0.0.1")
        .to_string();
    bridge.note_ota_host(&host);

    let ws_host = bridge.options.host_ip.as_deref().unwrap_or(&host);
    let ws_url = format!("ws://{}:{}/ws", ws_host, bridge.options.websocket_port);
    tracing::info!("OTA response: websocket={ws_url}");

    Json(json!({
        "server_time": {
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "timezone_offset": 0,
        },
        "websocket": {"url": ws_url},
        "firmware": {},
    }))
}

/// JPEG upload from the device camera; replies with the AI description.
async fn handle_vision_explain(
    State(bridge): State<Arc<Bridge>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut image: Option<Vec<u8>> = None;
    let mut question = "What do you see?".to_string();

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or("").to_string();
                let has_filename = field.file_name().is_some();
                if name == "file" || has_filename {
                    match field.bytes().await {
                        Ok(bytes) => image = Some(bytes.to_vec()),
                        Err(e) => {
                            tracing::warn!("Failed to read image part: {e}");
                        }
                    }
                } else if name == "question" {
                    if let Ok(text) = field.text().await {
                        question = text;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Vision explain error: {e}");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"success": false, "message": e.to_string()})),
                );
            }
        }
    }

    let Some(image) = image else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "No image received"})),
        );
    };

    tracing::info!(
        "Received camera image: {} bytes, question: {question}",
        image.len()
    );

    bridge.ingest_camera_frame(image.clone()).await;

    if let Err(e) = persist_last_photo(&image) {
        tracing::debug!("Could not persist last photo: {e:#}");
    }

    let description = match bridge.llm.vision(&image, &question).await {
        Ok(analysis) => analysis.description,
        Err(e) => {
            tracing::warn!("LLM vision analysis failed: {e:#}");
            format!("Photo captured ({} bytes)", image.len())
        }
    };

    let _ = bridge
        .mqtt
        .publish_state("sensor", "last_event", clip(&description, 255))
        .await;

    (
        StatusCode::OK,
        Json(json!({"success": true, "message": description})),
    )
}

fn persist_last_photo(image: &[u8]) -> Result<()> {
    if let Some(parent) = Path::new(LAST_PHOTO_PATH).parent() {
        if !parent.exists() {
            anyhow::bail!("{} does not exist", parent.display());
        }
    }
    std::fs::write(LAST_PHOTO_PATH, image)?;
    Ok(())
}

fn clip(s: &str, max: usize) -> String {
    s.char_indices()
        .nth(max)
        .map(|(idx, _)| s[..idx].to_string())
        .unwrap_or_else(|| s.to_string())
}
