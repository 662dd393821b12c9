use std::sync::Arc;

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::core::engine::{ConnectionRoomEngine, Directive};
use crate::core::connection::ConnectionId;

/// Handle one WebSocket connection for its whole lifetime
pub async fn handle_ws_client(ws: WebSocket, engine: Arc<ConnectionRoomEngine>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Forward engine-originated messages out to the socket
    tokio::task::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_tx.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let conn_id = ConnectionId::new();
    if let Err(e) = engine.register_connection(conn_id, tx) {
        info!("Rejecting connection: {}", e);
        return;
    }

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if msg.is_text() {
                    let Ok(text) = msg.to_str() else {
                        continue;
                    };
                    match engine.handle_message(conn_id, text) {
                        Ok(Directive::Continue) => {}
                        Ok(Directive::Close) => break,
                        Err(e) => {
                            error!("Engine error on connection {}: {}", conn_id, e);
                            break;
                        }
                    }
                } else if msg.is_ping() {
                    // Protocol-level pings also count as liveness
                    if let Err(e) = engine.touch_connection(conn_id) {
                        error!("Heartbeat refresh failed for {}: {}", conn_id, e);
                    }
                } else if msg.is_close() {
                    break;
                }
            }
            Err(e) => {
                debug!("WebSocket error on {}: {}", conn_id, e);
                break;
            }
        }
    }

    if let Err(e) = engine.handle_disconnect(conn_id) {
        error!("Failed to clean up connection {}: {}", conn_id, e);
    }
}
