//! WebSocket status stream.
//!
//! Clients connect to `/api/v1/ws` for every job or `/api/v1/ws?job_id=N`
//! for one job. The forwarder relays [`StatusEvent`]s from the broadcaster
//! to matching connections; the heartbeat keeps idle sockets alive.
//!
//! [`StatusEvent`]: forgefleet_events::StatusEvent

mod forwarder;
mod handler;
mod heartbeat;
pub mod manager;

pub use forwarder::start_status_forwarder;
pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
