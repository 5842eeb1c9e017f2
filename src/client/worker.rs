//! The network worker task.
//!
//! One tokio task owns the rumqttc event loop. Polling it drives the TCP
//! connect and handshake; on ConnAck the worker subscribes every configured
//! binding, announces presence, and starts the recurring presence task.
//! Incoming publishes are routed through the dispatcher on this task's own
//! execution context.
//!
//! The worker never reconnects. A broker disconnect or transport error moves
//! the state to `Disconnected` and ends the task; supervising retry loops
//! belong to the caller.

use crate::client::dispatch::Dispatcher;
use crate::client::presence::{presence_payload, spawn_presence};
use crate::config::PresenceConfig;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, QoS};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Connection lifecycle of the client. Owned by the worker; callers observe
/// it through the watch channel and influence it only via connect/stop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the worker needs besides the event loop itself.
pub(crate) struct WorkerContext {
    pub client: AsyncClient,
    pub dispatcher: Arc<Dispatcher>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub cancel: CancellationToken,
    pub module_name: String,
    pub presence: PresenceConfig,
}

pub(crate) fn spawn_worker(ctx: WorkerContext, event_loop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(run(ctx, event_loop))
}

async fn run(ctx: WorkerContext, mut event_loop: EventLoop) {
    info!("Network worker started");
    let presence_cancel = ctx.cancel.child_token();
    let mut presence_task: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            // Shutdown wins over further event processing.
            _ = ctx.cancel.cancelled() => {
                debug!("Network worker cancelled");
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        error!("Broker refused connection: {:?}", ack.code);
                        break;
                    }
                    on_connected(&ctx, &presence_cancel, &mut presence_task).await;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    trace!(
                        "Received message on '{}' ({} bytes, {:?})",
                        publish.topic,
                        publish.payload.len(),
                        publish.qos
                    );
                    let replies =
                        ctx.dispatcher
                            .dispatch(&publish.topic, &publish.payload, publish.qos);
                    for (topic, payload) in replies {
                        send_reply(&ctx.client, &topic, &payload).await;
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    warn!("Broker initiated disconnect");
                    break;
                }
                Ok(event) => trace!("Transport event: {:?}", event),
                Err(e) => {
                    error!("Connection error: {}", e);
                    break;
                }
            }
        }
    }

    // Guaranteed teardown order: stop the presence timer, then report the
    // state. Awaiting the task means no tick can fire once the worker has
    // been joined.
    presence_cancel.cancel();
    if let Some(task) = presence_task.take() {
        let _ = task.await;
    }
    let _ = ctx.state_tx.send(ConnectionState::Disconnected);
    info!("Network worker stopped");
}

/// ConnAck handling: subscribe all bindings at QoS 2 on the receive side,
/// announce presence immediately, then start the recurring task (once).
async fn on_connected(
    ctx: &WorkerContext,
    presence_cancel: &CancellationToken,
    presence_task: &mut Option<JoinHandle<()>>,
) {
    info!("Connected to broker");
    let _ = ctx.state_tx.send(ConnectionState::Connected);

    for filter in ctx.dispatcher.filters() {
        match ctx.client.subscribe(filter, QoS::ExactlyOnce).await {
            Ok(()) => debug!("Subscribed to '{}'", filter),
            Err(e) => error!("Failed to subscribe to '{}': {}", filter, e),
        }
    }

    if !ctx.presence.enabled {
        return;
    }
    let message = match presence_payload(&ctx.module_name).encode_extended() {
        Ok(message) => message,
        Err(e) => {
            error!("Failed to encode presence payload: {}", e);
            return;
        }
    };

    debug!("Announcing presence on '{}'", ctx.presence.topic);
    if let Err(e) = ctx
        .client
        .publish(&ctx.presence.topic, QoS::AtMostOnce, false, message.clone())
        .await
    {
        warn!("Initial presence publish failed: {}", e);
    }

    if presence_task.is_none() {
        *presence_task = Some(spawn_presence(
            ctx.client.clone(),
            ctx.presence.topic.clone(),
            message,
            ctx.presence.period(),
            presence_cancel.clone(),
        ));
    }
}

async fn send_reply(client: &AsyncClient, topic: &str, payload: &crate::payload::Payload) {
    let bytes = match payload.encode_extended() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode reply for '{}': {}", topic, e);
            return;
        }
    };
    debug!("Publishing canned reply to '{}'", topic);
    if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, bytes).await {
        warn!("Reply publish to '{}' failed: {}", topic, e);
    }
}
