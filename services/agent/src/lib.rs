// agent: CapyDeploy on-device agent library.
// Exposes modules for integration testing.

pub mod artwork;
pub mod bridge;
pub mod config;
pub mod console_log;
pub mod data_channel;
pub mod discovery;
pub mod game_log;
pub mod handlers;
pub mod pairing;
pub mod server;
pub mod settings;
pub mod steam;
pub mod telemetry;
pub mod uploads;
pub mod vdf;
