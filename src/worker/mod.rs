//! The worker process: hosts the engine and owns the session's real state.
//!
//! - **Session (`session.rs`)**: ordered start/stop/reload with alerts
//! - **RPC server (`rpc_server.rs`)**: WorkerService plus subscriber push
//! - **Command server (`command_server.rs`)**: telemetry streams for control surfaces
//! - **Engine (`engine.rs`)**: the hosted engine process

pub mod command_server;
pub mod engine;
pub mod hub;
pub mod netdev;
pub mod owner;
pub mod port_file;
pub mod rpc_server;
pub mod session;

pub use rpc_server::run_worker;
