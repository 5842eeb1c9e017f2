//! # MQTT client module
//!
//! The client facade and its supporting pieces:
//!
//! ```text
//! client/
//! ├── handle.rs   - MqttClient facade (connect / stop / publish)
//! ├── worker.rs   - network event loop task
//! ├── presence.rs - recurring presence announcement task
//! ├── dispatch.rs - topic bindings and message routing
//! └── error.rs    - error taxonomy
//! ```
//!
//! The facade owns all registration state: topic filters map to handlers in
//! an explicit [`dispatch::Dispatcher`], consulted by the worker for every
//! incoming message. The worker and the presence task are the only two units
//! of background execution; both stop within a bounded window when the
//! client is stopped.

pub mod dispatch;
pub mod error;
pub mod handle;
mod presence;
pub mod worker;

pub use dispatch::{
    topic_matches, MessageHandler, TopicBinding, DATA_OUTPUT_TOPIC, DISCOVERY_INIT_RESPONSE_TOPIC,
    DISCOVERY_INIT_TOPIC,
};
pub use error::ClientError;
pub use handle::MqttClient;
pub use worker::ConnectionState;
