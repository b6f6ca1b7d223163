//! Job status fan-out for forgefleet.
//!
//! - [`StatusBroadcaster`] -- in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`StatusEvent`] -- the wire envelope pushed to status subscribers.
//! - [`JobSubscription`] -- a receiver filtered to a single job.

pub mod bus;

pub use bus::{JobSubscription, StatusBroadcaster, StatusEvent};
