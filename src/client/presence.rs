//! The recurring presence announcement task.
//!
//! Publishes `{"type": <module_name>}` to the presence topic at QoS 0 on a
//! fixed interval. Cancellation is cooperative via a [`CancellationToken`]
//! and takes effect within one tick interval.

use crate::payload::Payload;
use rumqttc::{AsyncClient, QoS};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The presence message body for `module_name`.
pub(crate) fn presence_payload(module_name: &str) -> Payload {
    [("type", Payload::from(module_name))].into_iter().collect()
}

/// Interval loop: awaits either the next tick or cancellation. The first
/// tick fires one full period after start; the immediate announcement on
/// connect is the worker's job.
pub(crate) async fn run_presence<F, Fut>(period: Duration, cancel: CancellationToken, mut publish: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Presence task cancelled");
                break;
            }
            _ = ticker.tick() => publish().await,
        }
    }
}

/// Spawns the presence task. `message` is the pre-encoded presence body; the
/// task owns a clone of the transport client and publishes independently of
/// message dispatch.
pub(crate) fn spawn_presence(
    client: AsyncClient,
    topic: String,
    message: Vec<u8>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Presence task started (topic '{}', every {:?})", topic, period);
        run_presence(period, cancel, move || {
            let client = client.clone();
            let topic = topic.clone();
            let message = message.clone();
            async move {
                if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, message).await {
                    warn!("Presence publish failed: {}", e);
                }
            }
        })
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn presence_payload_carries_module_type() {
        let bytes = presence_payload("camera").encode_extended().unwrap();
        assert_eq!(bytes, br#"{"type":"camera"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_configured_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = count.clone();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_presence(
            Duration::from_secs(1),
            cancel.clone(),
            move || {
                let count = count_in.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        // Half a period in, nothing has fired yet.
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_fires_after_cancellation() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = count.clone();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_presence(
            Duration::from_secs(1),
            cancel.clone(),
            move || {
                let count = count_in.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        task.await.unwrap();
        let at_cancel = count.load(Ordering::SeqCst);
        assert_eq!(at_cancel, 2);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_prompt_between_ticks() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_presence(
            Duration::from_secs(3600),
            cancel.clone(),
            || async {},
        ));

        time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        // Joins without waiting out the hour-long tick.
        task.await.unwrap();
    }
}
