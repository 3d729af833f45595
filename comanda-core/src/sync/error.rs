//! Sync error types.

use thiserror::Error;

/// Errors that can occur while talking to the server.
///
/// The first five variants are the ones a user ever sees. Everything else is
/// transport plumbing that ends up as [`SyncError::ChannelDisconnected`] from
/// the caller's point of view.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The device has no network
    #[error("No network connection")]
    NoConnectivity,

    /// The channel to the server is not connected
    #[error("Not connected to the server")]
    ChannelDisconnected,

    /// No acknowledgment arrived in time
    #[error("No response from the server")]
    Timeout,

    /// The server answered with `ok: false`
    #[error("Server rejected the request: {0}")]
    ServerRejected(String),

    /// The server answered with something we could not decode
    #[error("Malformed server response: {0}")]
    MalformedResponse(String),

    /// Packet encoding/decoding error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// HTTP error while probing the server
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Message shown when the server rejects without saying why, or answers
/// with a body we cannot read.
pub const GENERIC_REJECTION: &str = "request failed";

impl SyncError {
    /// Short message suitable for showing to the user as-is.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::NoConnectivity => "no internet".to_string(),
            SyncError::ChannelDisconnected => "no connection".to_string(),
            SyncError::Timeout => "no response".to_string(),
            SyncError::ServerRejected(message) => message.clone(),
            SyncError::MalformedResponse(_) => GENERIC_REJECTION.to_string(),
            SyncError::Protocol(_) | SyncError::WebSocket(_) | SyncError::Http(_) => {
                "no connection".to_string()
            }
        }
    }

    /// Errors detected on this device, before anything reached the server.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SyncError::NoConnectivity | SyncError::ChannelDisconnected | SyncError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_is_verbatim() {
        let err = SyncError::ServerRejected("Usuário já bloqueado".to_string());
        assert_eq!(err.user_message(), "Usuário já bloqueado");
        assert!(!err.is_local());
    }

    #[test]
    fn test_malformed_reads_as_generic_rejection() {
        let err = SyncError::MalformedResponse("expected object".to_string());
        assert_eq!(err.user_message(), GENERIC_REJECTION);
    }

    #[test]
    fn test_local_errors() {
        assert!(SyncError::Timeout.is_local());
        assert!(SyncError::NoConnectivity.is_local());
        assert_eq!(SyncError::Timeout.user_message(), "no response");
        assert_eq!(SyncError::ChannelDisconnected.user_message(), "no connection");
    }
}
