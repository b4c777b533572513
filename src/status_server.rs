// src/status_server.rs
//
// WebSocket endpoint for dashboards.
// Each client gets the current device status on connect, then a status
// message whenever it changes and every link event (log entries excluded)
// as JSON text frames.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::events::LinkEvent;
use crate::link::{ConnectionState, LinkManager, LinkState};

#[derive(Debug, Serialize)]
struct StatusMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    status: &'static str,
}

/// Coarse device status as shown to dashboards
pub fn status_label(state: &ConnectionState) -> &'static str {
    match state.state {
        LinkState::Connected => "connected",
        LinkState::Connecting => "connecting",
        LinkState::Abandoned => "failed",
        LinkState::Disconnected | LinkState::ShuttingDown => "disconnected",
    }
}

fn status_message(label: &'static str) -> String {
    let message = StatusMessage {
        kind: "arduino-status",
        status: label,
    };
    serde_json::to_string(&message).unwrap_or_default()
}

/// Bind `addr` and serve dashboards until the link shuts down.
/// Returns the bound address (useful with port 0) and the accept task.
pub async fn spawn_status_server(
    addr: &str,
    manager: LinkManager,
) -> Result<(SocketAddr, JoinHandle<()>), String> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind status server on {}: {}", addr, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to read status server address: {}", e))?;

    tlog!("[status] Listening on ws://{}", local_addr);

    let mut events = manager.subscribe();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, peer, manager).await {
                                tlog!("[status] Client {} error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tlog!("[status] Accept error: {}", e),
                },
                event = events.recv() => match event {
                    Ok(LinkEvent::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    _ => {}
                },
            }
        }
        tlog!("[status] Status server stopped");
    });

    Ok((local_addr, handle))
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    manager: LinkManager,
) -> Result<(), String> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| format!("Handshake failed: {}", e))?;
    let (mut write, mut read) = ws_stream.split();

    let mut status = manager.watch_status();
    let mut events = manager.subscribe();
    tlog!("[status] Client {} connected", peer);

    let mut last_label = status_label(&status.borrow_and_update());
    write
        .send(Message::Text(status_message(last_label).into()))
        .await
        .map_err(|e| e.to_string())?;

    loop {
        // Events first so the final `shutdown` is delivered before the status channel closes
        let outgoing = tokio::select! {
            biased;

            event = events.recv() => match event {
                Ok(LinkEvent::Log(_)) => continue,
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tlog!("[status] Failed to encode {} event: {}", event.name(), e);
                        continue;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tlog!("[status] Client {} lagged, skipped {} events", peer, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let label = status_label(&status.borrow_and_update());
                if label == last_label {
                    continue;
                }
                last_label = label;
                status_message(label)
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        if write.send(Message::Text(outgoing.into())).await.is_err() {
            break;
        }
    }

    tlog!("[status] Client {} disconnected", peer);
    Ok(())
}
