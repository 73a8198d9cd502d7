// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! WebSocket push-stream endpoint
//!
//! Each accepted connection becomes one hub subscriber and receives UTF-8
//! text events, one per channel update, until the client disconnects. A send
//! failure terminates only that connection; ingestion never waits on
//! subscriber I/O.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{BroadcastHub, ChannelUpdate};

/// Bind the push-stream listener and serve subscribers until shutdown.
pub async fn serve_push_streams(
    hub: Arc<BroadcastHub>,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Push-stream server listening on ws://{}", addr);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        let subscriber = hub.clone().open_subscriber();
                        tokio::spawn(handle_connection(stream, addr, subscriber));
                    }
                    Err(e) => {
                        error!("Push-stream accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Push-stream server shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, mut subscriber: super::Subscriber) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("New push-stream connection from {} (id: {})", addr, subscriber.id);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let welcome = serde_json::json!({
        "type": "welcome",
        "subscriber_id": subscriber.id,
        "server": "fleetwatch",
        "version": env!("CARGO_PKG_VERSION"),
    });

    if let Err(e) = ws_sender.send(Message::Text(welcome.to_string().into())).await {
        warn!("Failed to send welcome to {}: {}", addr, e);
        return;
    }

    loop {
        tokio::select! {
            // Client side: pings and disconnects.
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from {}: {}", addr, text);
                        if let Ok(cmd) = serde_json::from_str::<serde_json::Value>(&text) {
                            if cmd.get("type").and_then(|v| v.as_str()) == Some("ping") {
                                let pong = serde_json::json!({"type": "pong"});
                                let _ = ws_sender.send(Message::Text(pong.to_string().into())).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Push stream closed by client {}", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Err(e)) => {
                        warn!("Push stream error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            // Hub side: one text event per channel update.
            update = subscriber.next_update() => {
                match update {
                    Some(update) => {
                        if let Err(e) = ws_sender.send(Message::Text(frame(&update).into())).await {
                            warn!("Failed to push to {}: {}", addr, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    info!("Push-stream client {} disconnected", addr);
}

/// Wrap a channel update in the event envelope the dashboard consumes.
fn frame(update: &ChannelUpdate) -> String {
    let data = serde_json::from_str::<serde_json::Value>(&update.payload)
        .unwrap_or_else(|_| serde_json::Value::String(update.payload.clone()));

    serde_json::json!({
        "channel": update.channel.id(),
        "data": data,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Channel;

    #[test]
    fn frame_embeds_json_payloads_verbatim() {
        let update = ChannelUpdate {
            channel: Channel::Speed,
            payload: r#"{"vehicleId":"v1","speedExp":true}"#.to_string(),
        };
        let framed: serde_json::Value = serde_json::from_str(&frame(&update)).unwrap();
        assert_eq!(framed["channel"], 6);
        assert_eq!(framed["data"]["vehicleId"], "v1");
        assert_eq!(framed["data"]["speedExp"], true);
    }

    #[test]
    fn frame_falls_back_to_plain_text() {
        let update = ChannelUpdate {
            channel: Channel::Position,
            payload: "not json".to_string(),
        };
        let framed: serde_json::Value = serde_json::from_str(&frame(&update)).unwrap();
        assert_eq!(framed["data"], "not json");
    }
}
