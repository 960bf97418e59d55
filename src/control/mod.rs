//! The control surface: the in-process side that drives the worker.
//!
//! - **Machine (`machine.rs`)**: the authoritative session state machine
//! - **Actor (`actor.rs`)**: serializes every session mutation
//! - **Worker connection (`worker_connection.rs`)**: bind/unbind with loss retry
//! - **RPC worker (`rpc_worker.rs`)**: connect-or-spawn and event relay over tarpc
//! - **Telemetry (`telemetry.rs`)**: status/log/group/mode command streams
//! - **Surface (`surface.rs`)**: the public request API
//! - **Bridge (`bridge.rs`)**: JSON-lines transport of the surface over stdio

pub mod actor;
pub mod apps;
pub mod bridge;
pub mod machine;
pub mod rpc_worker;
pub mod surface;
pub mod telemetry;
pub mod traffic;
pub mod worker_connection;

pub use surface::ControlSurface;
