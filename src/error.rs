//! Failure taxonomy shared by the worker and the control surface.
//!
//! Failures inside the worker's startup path become an [`AlertEvent`] and end
//! the session; failures of control-surface requests are [`SessionError`]s
//! returned to the caller.

use serde::{Deserialize, Serialize};

/// Known failure categories carried by alerts.
///
/// The discriminants are the wire ordinals and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    RequestVpnPermission = 0,
    RequestNotificationPermission = 1,
    RequestLocationPermission = 2,
    EmptyConfiguration = 3,
    StartCommandServer = 4,
    CreateService = 5,
    StartService = 6,
    VpnNoAddress = 7,
}

impl AlertKind {
    #[cfg(test)]
    pub const ALL: [AlertKind; 8] = [
        AlertKind::RequestVpnPermission,
        AlertKind::RequestNotificationPermission,
        AlertKind::RequestLocationPermission,
        AlertKind::EmptyConfiguration,
        AlertKind::StartCommandServer,
        AlertKind::CreateService,
        AlertKind::StartService,
        AlertKind::VpnNoAddress,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    #[cfg(test)]
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }
}

/// A discrete failure notification. Always paired with a Stopped status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub message: Option<String>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, message: Option<String>) -> Self {
        Self { kind, message }
    }

    /// Human-readable text shown to the user for this alert.
    pub fn describe(&self) -> String {
        let detail = self.message.as_deref().filter(|m| !m.is_empty());
        match (self.kind, detail) {
            (AlertKind::EmptyConfiguration, _) => "Empty configuration".to_string(),
            (AlertKind::StartService, Some(msg)) => format!("Failed to start service: {}", msg),
            (AlertKind::StartService, None) => "Failed to start service".to_string(),
            (AlertKind::CreateService, Some(msg)) => format!("Failed to create service: {}", msg),
            (AlertKind::CreateService, None) => "Failed to create service".to_string(),
            (AlertKind::VpnNoAddress, _) => "No VPN address configured".to_string(),
            (_, Some(msg)) => format!("Error: {}", msg),
            (_, None) => "Unknown issue".to_string(),
        }
    }
}

impl std::fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Errors surfaced by the session machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    EmptyConfiguration,
    EngineCreateFailed(String),
    EngineStartFailed(String),
    CommandEndpointStartFailed(String),
    NoVpnAddress,
    /// The worker lacks the privileges to open a tunnel device.
    PermissionRequestFailed,
    /// No context capable of launching the worker.
    ActivityUnavailable,
    ConnectionOwnerLookupFailed(String),
    BindingFailed(String),
    InvalidMode(String),
    Storage(String),
}

impl SessionError {
    /// Stable code reported to control-surface callers.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::ActivityUnavailable => "ACTIVITY_UNAVAILABLE",
            SessionError::PermissionRequestFailed => "VPN_PERMISSION_DENIED",
            SessionError::InvalidMode(_) => "INVALID_MODE",
            SessionError::Storage(_) => "CONFIG_SAVE_ERROR",
            SessionError::BindingFailed(_) => "BINDING_FAILED",
            SessionError::ConnectionOwnerLookupFailed(_) => "CONNECTION_OWNER_NOT_FOUND",
            SessionError::EmptyConfiguration
            | SessionError::EngineCreateFailed(_)
            | SessionError::EngineStartFailed(_)
            | SessionError::CommandEndpointStartFailed(_)
            | SessionError::NoVpnAddress => "START_VPN_ERROR",
        }
    }

    /// The alert raised when this error ends a worker start attempt.
    pub fn to_alert(&self) -> Option<AlertEvent> {
        let (kind, message) = match self {
            SessionError::EmptyConfiguration => (AlertKind::EmptyConfiguration, None),
            SessionError::EngineCreateFailed(m) => (AlertKind::CreateService, Some(m.clone())),
            SessionError::EngineStartFailed(m) => (AlertKind::StartService, Some(m.clone())),
            SessionError::CommandEndpointStartFailed(m) => {
                (AlertKind::StartCommandServer, Some(m.clone()))
            }
            SessionError::NoVpnAddress => (AlertKind::VpnNoAddress, None),
            SessionError::PermissionRequestFailed => (AlertKind::RequestVpnPermission, None),
            _ => return None,
        };
        Some(AlertEvent::new(kind, message))
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::EmptyConfiguration => write!(f, "Empty configuration"),
            SessionError::EngineCreateFailed(m) => write!(f, "Failed to create engine: {}", m),
            SessionError::EngineStartFailed(m) => write!(f, "Failed to start engine: {}", m),
            SessionError::CommandEndpointStartFailed(m) => {
                write!(f, "Failed to start command server: {}", m)
            }
            SessionError::NoVpnAddress => write!(f, "No VPN address configured"),
            SessionError::PermissionRequestFailed => write!(f, "VPN permission denied"),
            SessionError::ActivityUnavailable => write!(f, "No context available to start"),
            SessionError::ConnectionOwnerLookupFailed(m) => {
                write!(f, "Connection owner not found: {}", m)
            }
            SessionError::BindingFailed(m) => write!(f, "Failed to bind worker: {}", m),
            SessionError::InvalidMode(m) => write!(f, "Invalid mode: {}", m),
            SessionError::Storage(m) => write!(f, "Storage error: {}", m),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
