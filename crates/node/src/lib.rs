//! Client library for Forge / SD-WebUI compute nodes.
//!
//! Provides the [`NodeClient`](client::NodeClient) seam and its HTTP
//! implementation, Server-Sent Events decoding for the Gradio queue,
//! event parsing and normalization, submission payload building and the
//! tolerant model-catalog lookup.

pub mod api;
pub mod catalog;
pub mod client;
pub mod messages;
pub mod normalize;
pub mod payload;
pub mod registry;
pub mod sse;
