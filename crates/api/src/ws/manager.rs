use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};
use forgefleet_core::types::{DbId, Timestamp};

/// Outbound half of a client's frame queue.
pub type FrameSender = mpsc::UnboundedSender<Message>;

/// One status-stream client.
struct Client {
    /// `Some(id)` scopes the client to a single job.
    job_filter: Option<DbId>,
    frames: FrameSender,
    connected_at: Timestamp,
}

impl Client {
    fn follows(&self, job_id: DbId) -> bool {
        self.job_filter.map_or(true, |id| id == job_id)
    }

    /// Queue a frame. `false` once the socket task has gone away.
    fn push(&self, frame: Message) -> bool {
        self.frames.send(frame).is_ok()
    }
}

/// Registry of connected status-stream clients, keyed by connection id.
///
/// Fed by the one forwarder receiver; per-job scoping for `?job_id=`
/// sockets happens here through each client's filter.
#[derive(Default)]
pub struct WsManager {
    clients: RwLock<HashMap<String, Client>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and hand back the receiving end of its frame
    /// queue for the socket task to drain.
    pub async fn add(
        &self,
        conn_id: String,
        job_filter: Option<DbId>,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (frames, rx) = mpsc::unbounded_channel();
        let client = Client {
            job_filter,
            frames,
            connected_at: chrono::Utc::now(),
        };
        self.clients.write().await.insert(conn_id, client);
        rx
    }

    pub async fn remove(&self, conn_id: &str) {
        if let Some(client) = self.clients.write().await.remove(conn_id) {
            let connected_for = chrono::Utc::now() - client.connected_at;
            tracing::debug!(
                conn_id,
                job_filter = ?client.job_filter,
                connected_secs = connected_for.num_seconds(),
                "Status client removed",
            );
        }
    }

    /// Queue `message` for every client following `job_id`. Returns how
    /// many clients accepted it.
    pub async fn send_job_event(&self, job_id: DbId, message: Message) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|client| client.follows(job_id))
            .filter(|client| client.push(message.clone()))
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Close every client and forget them.
    pub async fn shutdown_all(&self) {
        let mut clients = self.clients.write().await;
        for client in clients.values() {
            client.push(Message::Close(None));
        }
        tracing::info!(count = clients.len(), "Closed all status clients");
        clients.clear();
    }

    pub async fn ping_all(&self) {
        for client in self.clients.read().await.values() {
            client.push(Message::Ping(Bytes::new()));
        }
    }
}
