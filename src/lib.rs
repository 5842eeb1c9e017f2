//! # modlink
//!
//! A minimal MQTT client wrapper for modules on a shared broker: announce
//! presence on an interval, answer discovery pings, and publish/receive
//! JSON-encoded messages on bound topics.
//!
//! The crate is a facade over [`rumqttc`]; connection handling, QoS, and
//! write serialization are the transport's job. What this crate adds is the
//! lifecycle glue: subscribe-on-connect with explicit per-topic dispatch, a
//! cancellable presence timer, and typed payloads with the bus's
//! extended-JSON datetime convention.
//!
//! ```rust,no_run
//! use modlink::{ClientConfig, MqttClient, TopicBinding};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("broker.local", "camera");
//! let mut client = MqttClient::new(config, vec![TopicBinding::discovery()]);
//! client.connect()?;
//! client.wait_connected(Duration::from_secs(5)).await?;
//! // ... the presence timer is now announcing "camera" every 10 seconds.
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod payload;

pub use client::{ClientError, ConnectionState, MessageHandler, MqttClient, TopicBinding};
pub use config::{ClientConfig, ConfigError, Credentials, PresenceConfig};
pub use payload::{Payload, PayloadError};

// The transport's QoS type is part of the public API (publish and handler
// signatures).
pub use rumqttc::QoS;
