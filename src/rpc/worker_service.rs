//! Worker service definitions for control ↔ worker RPC.

use crate::rpc::{AlertEvent, ConnectionQuery, SessionStatus, StartRequest, WorkerResult};

/// Service exposed by the worker to control processes.
#[tarpc::service]
pub trait WorkerService {
    /// Authenticate with the worker.
    /// Must be called first before any other RPC operations except `ping`.
    async fn authenticate(token: String) -> WorkerResult<()>;

    /// Ask the worker to start a session. Returns once the request is queued;
    /// the outcome arrives as status and alert events.
    async fn start(request: StartRequest) -> WorkerResult<()>;

    /// Ask the worker to stop its session (service-close).
    async fn close() -> WorkerResult<()>;

    /// Restart the engine with the configuration it was started with.
    async fn reload() -> WorkerResult<()>;

    /// Current worker-side session status.
    async fn status() -> WorkerResult<SessionStatus>;

    /// Resolve the uid owning a local socket.
    async fn find_connection_owner(query: ConnectionQuery) -> WorkerResult<u32>;

    /// Get worker build SHA for version checking.
    async fn build_sha() -> String;

    /// Liveness check. Does not require authentication.
    async fn ping() -> bool;
}

/// Callback service for push notifications (worker → subscriber).
/// Subscribers implement this service; the worker calls into it.
#[tarpc::service]
pub trait EventCallback {
    /// Called when the worker-side session status changes.
    async fn status_changed(status: SessionStatus);

    /// Called when a start attempt fails. A Stopped status follows.
    async fn alert(event: AlertEvent);

    /// Ping to check if subscriber is still alive. Returns true if healthy.
    async fn ping() -> bool;
}
