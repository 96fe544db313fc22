//! Device WebSocket server.
//!
//! The Watcher firmware dials `ws://<bridge>:<websocket_port>/ws` after its
//! OTA check-in. One device connection is active at a time; a newer
//! connection simply takes over the outbound channel.

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::bridge::Bridge;

pub async fn serve(bridge: Arc<Bridge>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/ws", get(upgrade_handler))
        .with_state(bridge);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind WebSocket server on port {port}"))?;
    tracing::info!("WebSocket server started on port {port}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn upgrade_handler(State(bridge): State<Arc<Bridge>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_device(bridge, socket))
}

async fn handle_device(bridge: Arc<Bridge>, socket: WebSocket) {
    tracing::info!("Device connected");

    let (generation, mut outbound) = bridge.device.attach();
    bridge.on_device_connected().await;

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            command = outbound.recv() => {
                let Some(command) = command else { break };
                if let Err(e) = sink.send(Message::Text(command.into())).await {
                    tracing::warn!("WebSocket send failed: {e}");
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        bridge.process_device_message(text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        bridge.handle_binary_frame(data.len());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::warn!("Device disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    bridge.device.detach(generation);
    bridge.on_device_disconnected().await;
}
