//! Request handlers, one module per domain.
//!
//! Every handler takes the connection state and the parsed envelope,
//! enqueues its response on the writer, and never touches the sink directly.

pub mod auth;
pub mod console_log;
pub mod game;
pub mod info;
pub mod telemetry;
pub mod upload;
