//! Error definitions for the client module.

use crate::client::ConnectionState;
use crate::payload::PayloadError;
use thiserror::Error;

/// Errors surfaced by [`MqttClient`](crate::MqttClient) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// `connect()` was called while a previous start is still in effect.
    #[error("client already started; call stop() before connecting again")]
    AlreadyStarted,

    /// An operation that needs a live broker session ran without one.
    #[error("not connected to broker (state: {state:?})")]
    NotConnected { state: ConnectionState },

    /// The broker could not be reached, rejected the session, or dropped it.
    /// Reported through the state channel as well; never retried internally.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection handshake did not complete within the configured bound.
    #[error("timed out waiting for broker connection")]
    ConnectTimeout,

    /// Handing a publish to the transport failed.
    #[error("publish failed: {0}")]
    PublishFailed(#[from] rumqttc::ClientError),

    /// The payload is not representable in the supported JSON encoding.
    /// Raised synchronously, before any network I/O.
    #[error("serialization failed: {0}")]
    Serialization(#[from] PayloadError),
}
