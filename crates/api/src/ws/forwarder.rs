use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::broadcast;
use forgefleet_events::StatusEvent;

use crate::ws::manager::WsManager;

/// Relay broadcaster events to WebSocket clients until the broadcaster
/// is dropped.
pub fn start_status_forwarder(
    mut receiver: broadcast::Receiver<StatusEvent>,
    ws_manager: Arc<WsManager>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(
                                job_id = event.job_id(),
                                error = %e,
                                "Failed to serialize status event",
                            );
                            continue;
                        }
                    };
                    ws_manager
                        .send_job_event(event.job_id(), Message::Text(text.into()))
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Status forwarder lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Status broadcaster closed, forwarder stopping");
                    break;
                }
            }
        }
    })
}
