//! MQTT client facade - presence, discovery, and typed JSON publishing
//!
//! Provides the high-level interface over the transport: construction from a
//! [`ClientConfig`] plus topic bindings, a non-blocking `connect`, guaranteed
//! teardown in `stop`, and publish operations for extended-JSON payloads.

use crate::client::dispatch::{Dispatcher, TopicBinding, DATA_OUTPUT_TOPIC};
use crate::client::error::ClientError;
use crate::client::worker::{spawn_worker, ConnectionState, WorkerContext};
use crate::config::ClientConfig;
use crate::payload::Payload;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, NetworkOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period for the worker task to wind down during `stop`.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Request-channel capacity between the facade and the transport.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// A presence-publishing, topic-subscribing MQTT client.
///
/// The client wraps one broker connection. On connect it subscribes every
/// configured [`TopicBinding`] (QoS 2 on the receive side), announces the
/// module on the presence topic, and keeps announcing it on the configured
/// interval until stopped.
///
/// # Lifecycle
///
/// ```text
/// Disconnected --connect()--> Connecting --(ConnAck)--> Connected
///      ^                                                    |
///      +---------- stop() or transport loss ----------------+
/// ```
///
/// `connect` fails fast with [`ClientError::AlreadyStarted`] while a previous
/// start is in effect, so no second presence timer can ever be created. The
/// client does not reconnect on its own; observe [`MqttClient::watch_state`]
/// and call `connect` again if a supervising retry loop is wanted.
///
/// # Examples
///
/// ```rust,no_run
/// use modlink::{ClientConfig, MqttClient, Payload, TopicBinding};
/// use rumqttc::QoS;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("broker.local", "camera");
/// let bindings = vec![
///     TopicBinding::discovery(),
///     TopicBinding::with_handler("mod/camera/control", |topic, payload, _qos| {
///         println!("{}: {} bytes", topic, payload.len());
///     }),
/// ];
///
/// let mut client = MqttClient::new(config, bindings);
/// client.connect()?;
/// client.wait_connected(Duration::from_secs(5)).await?;
///
/// let reading: Payload = [("lux", Payload::from(812))].into_iter().collect();
/// client.publish("mod/camera/telemetry", &reading, QoS::AtMostOnce).await?;
///
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct MqttClient {
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl MqttClient {
    /// Builds a client from its immutable configuration and topic bindings.
    ///
    /// Credentials, keep-alive, connect timeout, and device binding are all
    /// applied to the transport options here, before any connection attempt.
    /// No network activity happens until [`MqttClient::connect`].
    pub fn new(config: ClientConfig, bindings: Vec<TopicBinding>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(bindings));
        let (client, event_loop) = create_transport(&config);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            dispatcher,
            client,
            event_loop: Some(event_loop),
            state_tx,
            state_rx,
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    /// Starts the connection and the network worker.
    ///
    /// Returns immediately; the handshake completes asynchronously. Once the
    /// broker acknowledges, the worker subscribes all bindings, publishes
    /// the one-shot presence message, and starts the recurring presence
    /// task. Connection failures are reported through the state channel
    /// (back to `Disconnected`), never by blocking this call.
    ///
    /// # Errors
    ///
    /// [`ClientError::AlreadyStarted`] if the state is not `Disconnected`.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if *self.state_rx.borrow() != ConnectionState::Disconnected {
            return Err(ClientError::AlreadyStarted);
        }

        // A fresh transport pair is needed after a previous run consumed the
        // event loop.
        let event_loop = match self.event_loop.take() {
            Some(event_loop) => event_loop,
            None => {
                let (client, event_loop) = create_transport(&self.config);
                self.client = client;
                event_loop
            }
        };
        // The previous worker (if any) has already exited; its handle is
        // stale at this point.
        self.worker.take();
        self.cancel = CancellationToken::new();

        info!(
            "Connecting '{}' to {}:{}",
            self.config.module_name, self.config.host, self.config.port
        );
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let ctx = WorkerContext {
            client: self.client.clone(),
            dispatcher: self.dispatcher.clone(),
            state_tx: self.state_tx.clone(),
            cancel: self.cancel.clone(),
            module_name: self.config.module_name.clone(),
            presence: self.config.presence.clone(),
        };
        self.worker = Some(spawn_worker(ctx, event_loop));
        Ok(())
    }

    /// Stops the network worker, cancels the presence task, and disconnects.
    ///
    /// Every teardown step runs even if an earlier one fails; failures are
    /// logged, never propagated. Safe to call before `connect` ever ran and
    /// safe to call concurrently with in-flight publishes. When this
    /// returns, no further presence message will be published.
    pub async fn stop(&mut self) {
        info!("Stopping MQTT client '{}'", self.config.module_name);
        self.cancel.cancel();

        if let Some(mut handle) = self.worker.take() {
            match time::timeout(STOP_GRACE_PERIOD, &mut handle).await {
                Ok(Ok(())) => debug!("Network worker shut down cleanly"),
                Ok(Err(e)) => warn!("Network worker ended abnormally: {}", e),
                Err(_) => {
                    warn!("Network worker missed the stop grace period; aborting");
                    handle.abort();
                }
            }
        }

        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not delivered: {}", e);
        }

        let _ = self.state_tx.send(ConnectionState::Disconnected);
        info!("MQTT client stopped");
    }

    /// Publishes `payload` to `topic` at the requested QoS.
    ///
    /// The payload is encoded as extended JSON before any network I/O, so
    /// serialization problems surface synchronously as
    /// [`ClientError::Serialization`]. Publishing before the client is
    /// connected fails deterministically with [`ClientError::NotConnected`].
    /// Delivery confirmation for QoS 1/2 is handled inside the transport.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &Payload,
        qos: QoS,
    ) -> Result<(), ClientError> {
        let bytes = payload.encode_extended()?;
        self.ensure_connected()?;
        self.client.publish(topic, qos, false, bytes).await?;
        debug!("Published to '{}' at {:?}", topic, qos);
        Ok(())
    }

    /// Forwards queued values to `mod/discovery/data-output` as plain JSON
    /// (datetimes as RFC 3339 text, no extended wrapper) at QoS 0.
    pub async fn publish_queue(&self, values: &Payload) -> Result<(), ClientError> {
        let bytes = values.encode_plain()?;
        self.ensure_connected()?;
        self.client
            .publish(DATA_OUTPUT_TOPIC, QoS::AtMostOnce, false, bytes)
            .await?;
        debug!("Forwarded queue payload to '{}'", DATA_OUTPUT_TOPIC);
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A watch subscription on the connection state, for supervising retry
    /// loops in the caller.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Waits until the broker has acknowledged the connection.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionFailed`] if the state reaches `Disconnected`
    /// first, [`ClientError::ConnectTimeout`] if neither happens within
    /// `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => {
                        return Err(ClientError::ConnectionFailed(
                            "connection closed before broker acknowledgment".to_string(),
                        ))
                    }
                    ConnectionState::Connecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::ConnectionFailed(
                        "state channel closed".to_string(),
                    ));
                }
            }
        };
        match time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectTimeout),
        }
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        let state = *self.state_rx.borrow();
        if state != ConnectionState::Connected {
            return Err(ClientError::NotConnected { state });
        }
        Ok(())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Background tasks must not outlive the handle. Graceful teardown is
        // stop()'s job; this only severs the tasks.
        self.cancel.cancel();
        if let Some(handle) = self.worker.take() {
            handle.abort();
        }
    }
}

/// Builds the transport pair with all construction-time options applied.
fn create_transport(config: &ClientConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&config.module_name, &config.host, config.port);
    options.set_keep_alive(config.keep_alive());
    if let Some(credentials) = &config.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(config.connect_timeout_secs);
    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    if let Some(device) = &config.bind_device {
        network_options.set_bind_device(device);
    }
    #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
    if config.bind_device.is_some() {
        warn!("bind_device is not supported on this platform; ignoring");
    }
    event_loop.set_network_options(network_options);

    (client, event_loop)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points at a port nothing listens on; connections are refused at once.
    fn unreachable_config(module: &str) -> ClientConfig {
        ClientConfig::new("127.0.0.1", module)
            .with_port(1)
            .with_presence(crate::config::PresenceConfig {
                enabled: true,
                period_secs: 1,
                topic: "mod/presence".to_string(),
            })
    }

    #[tokio::test]
    async fn publish_before_connect_fails_deterministically() {
        let client = MqttClient::new(unreachable_config("test-publish"), Vec::new());
        let payload: Payload = [("v", Payload::from(1))].into_iter().collect();

        let err = client
            .publish("mod/telemetry", &payload, QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));

        let err = client.publish_queue(&payload).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn serialization_errors_surface_before_connection_checks() {
        let client = MqttClient::new(unreachable_config("test-serialize"), Vec::new());
        let err = client
            .publish("mod/telemetry", &Payload::Float(f64::NAN), QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Serialization(_)));
    }

    #[tokio::test]
    async fn second_connect_fails_fast() {
        let mut client = MqttClient::new(unreachable_config("test-double"), Vec::new());
        client.connect().unwrap();

        let err = client.connect().unwrap_err();
        assert!(matches!(err, ClientError::AlreadyStarted));

        client.stop().await;
    }

    #[tokio::test]
    async fn stop_before_connect_is_a_no_op() {
        let mut client = MqttClient::new(unreachable_config("test-stop"), Vec::new());
        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_broker_returns_to_disconnected() {
        let mut client = MqttClient::new(unreachable_config("test-refused"), Vec::new());
        client.connect().unwrap();

        let err = client
            .wait_connected(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectionFailed(_) | ClientError::ConnectTimeout
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.stop().await;
    }

    #[tokio::test]
    async fn connect_is_allowed_again_after_stop() {
        let mut client = MqttClient::new(unreachable_config("test-restart"), Vec::new());
        client.connect().unwrap();
        client.stop().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.connect().unwrap();
        client.stop().await;
    }

    #[tokio::test]
    async fn wait_connected_gives_up_without_broker() {
        // RFC 5737 TEST-NET address: either blackholed (state stays
        // Connecting until our deadline) or rejected by the local stack
        // (state drops to Disconnected). Both must end the wait.
        let config = ClientConfig::new("192.0.2.1", "test-timeout");
        let mut client = MqttClient::new(config, Vec::new());
        client.connect().unwrap();

        let err = client
            .wait_connected(Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectTimeout | ClientError::ConnectionFailed(_)
        ));

        client.stop().await;
    }
}
