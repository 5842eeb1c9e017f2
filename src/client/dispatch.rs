//! Topic bindings and message dispatch.
//!
//! The dispatcher is an explicit mapping from topic filter to action, owned
//! by the client and consulted directly when the worker receives a publish.
//! Nothing is registered inside the MQTT library itself.

use crate::payload::Payload;
use rumqttc::QoS;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{trace, warn};

/// Discovery handshake request topic.
pub const DISCOVERY_INIT_TOPIC: &str = "mod/discovery/init";
/// Topic the discovery acknowledgment is published to.
pub const DISCOVERY_INIT_RESPONSE_TOPIC: &str = "mod/discovery/init-response";
/// Queue-forwarding topic (plain-JSON path).
pub const DATA_OUTPUT_TOPIC: &str = "mod/discovery/data-output";

/// Callback invoked for messages arriving on a bound topic filter.
///
/// Handlers run on the network worker's own task; a slow handler delays
/// delivery of subsequent messages, so return promptly or hand long work to
/// another task.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8], QoS) + Send + Sync>;

/// What to do when a message matches a binding's filter.
enum BindingAction {
    /// Subscribe only; messages are received but nothing runs locally.
    Subscribe,
    /// Invoke a caller-supplied handler.
    Invoke(MessageHandler),
    /// Publish a canned payload to another topic.
    Reply { topic: String, payload: Payload },
}

/// One (topic filter, optional action) pair supplied at construction.
///
/// Filters should be unique within one client; duplicates fall under
/// broker-level subscription semantics and are logged, not rejected.
pub struct TopicBinding {
    filter: String,
    action: BindingAction,
}

impl TopicBinding {
    /// Binding that subscribes `filter` and runs `handler` for each message.
    pub fn with_handler<F>(filter: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &[u8], QoS) + Send + Sync + 'static,
    {
        Self {
            filter: filter.into(),
            action: BindingAction::Invoke(Arc::new(handler)),
        }
    }

    /// Binding that subscribes `filter` without a local handler.
    pub fn subscribe_only(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            action: BindingAction::Subscribe,
        }
    }

    /// Binding that answers every message on `filter` by publishing
    /// `payload` to `reply_topic`.
    pub fn reply(
        filter: impl Into<String>,
        reply_topic: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            filter: filter.into(),
            action: BindingAction::Reply {
                topic: reply_topic.into(),
                payload,
            },
        }
    }

    /// The opt-in discovery handshake: a message on `mod/discovery/init` is
    /// answered with `{"loaded": true}` on `mod/discovery/init-response`.
    pub fn discovery() -> Self {
        Self::reply(
            DISCOVERY_INIT_TOPIC,
            DISCOVERY_INIT_RESPONSE_TOPIC,
            [("loaded", Payload::from(true))].into_iter().collect(),
        )
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Owns the binding list and routes incoming messages to their actions.
pub(crate) struct Dispatcher {
    bindings: Vec<TopicBinding>,
}

impl Dispatcher {
    pub(crate) fn new(bindings: Vec<TopicBinding>) -> Self {
        let mut seen = HashSet::new();
        for binding in &bindings {
            if !seen.insert(binding.filter.as_str()) {
                warn!(
                    "Duplicate topic filter '{}'; broker subscription semantics apply",
                    binding.filter
                );
            }
        }
        Self { bindings }
    }

    /// Filters to subscribe on connect, in binding order.
    pub(crate) fn filters(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.filter.as_str())
    }

    /// Routes one received message. Handlers run inline; canned replies are
    /// returned so the caller can publish them with its own client handle.
    pub(crate) fn dispatch(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Vec<(String, Payload)> {
        let mut replies = Vec::new();
        for binding in &self.bindings {
            if !topic_matches(&binding.filter, topic) {
                continue;
            }
            match &binding.action {
                BindingAction::Subscribe => {
                    trace!("Message on '{}' consumed by subscribe-only binding", topic);
                }
                BindingAction::Invoke(handler) => handler(topic, payload, qos),
                BindingAction::Reply {
                    topic: reply_topic,
                    payload: reply,
                } => replies.push((reply_topic.clone(), reply.clone())),
            }
        }
        replies
    }
}

/// MQTT topic-filter matching: `+` matches exactly one level, a trailing
/// `#` matches any remainder (including none). Filters beginning with a
/// wildcard do not match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn exact_filters_match_exactly() {
        assert!(topic_matches("mod/presence", "mod/presence"));
        assert!(!topic_matches("mod/presence", "mod/presence/extra"));
        assert!(!topic_matches("mod/presence/extra", "mod/presence"));
    }

    #[test]
    fn plus_matches_one_level() {
        assert!(topic_matches("mod/+/init", "mod/discovery/init"));
        assert!(!topic_matches("mod/+/init", "mod/a/b/init"));
        assert!(!topic_matches("mod/+", "mod"));
    }

    #[test]
    fn hash_matches_any_remainder() {
        assert!(topic_matches("mod/#", "mod/discovery/init"));
        assert!(topic_matches("mod/#", "mod"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn wildcards_skip_dollar_topics() {
        assert!(!topic_matches("#", "$SYS/broker/load"));
        assert!(!topic_matches("+/broker/load", "$SYS/broker/load"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/load"));
    }

    #[test]
    fn handler_runs_once_per_message() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let count_in = count.clone();
        let seen_in = seen.clone();

        let dispatcher = Dispatcher::new(vec![
            TopicBinding::with_handler("mod/telemetry/#", move |topic, payload, qos| {
                count_in.fetch_add(1, Ordering::SeqCst);
                seen_in
                    .lock()
                    .unwrap()
                    .push((topic.to_string(), payload.to_vec(), qos));
            }),
            TopicBinding::subscribe_only("mod/other"),
        ]);

        let replies = dispatcher.dispatch("mod/telemetry/cpu", b"{\"v\":1}", QoS::AtLeastOnce);
        assert!(replies.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let events = seen.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[(
                "mod/telemetry/cpu".to_string(),
                b"{\"v\":1}".to_vec(),
                QoS::AtLeastOnce
            )]
        );
    }

    #[test]
    fn unmatched_topics_reach_no_binding() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = count.clone();
        let dispatcher = Dispatcher::new(vec![TopicBinding::with_handler(
            "mod/telemetry",
            move |_, _, _| {
                count_in.fetch_add(1, Ordering::SeqCst);
            },
        )]);

        dispatcher.dispatch("mod/presence", b"{}", QoS::AtMostOnce);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discovery_binding_produces_loaded_reply() {
        let dispatcher = Dispatcher::new(vec![TopicBinding::discovery()]);
        let replies = dispatcher.dispatch(DISCOVERY_INIT_TOPIC, b"{}", QoS::AtMostOnce);

        assert_eq!(replies.len(), 1);
        let (topic, payload) = &replies[0];
        assert_eq!(topic, DISCOVERY_INIT_RESPONSE_TOPIC);
        assert_eq!(payload.encode_extended().unwrap(), br#"{"loaded":true}"#);
    }

    #[test]
    fn filters_keep_binding_order() {
        let dispatcher = Dispatcher::new(vec![
            TopicBinding::subscribe_only("b"),
            TopicBinding::subscribe_only("a"),
        ]);
        let filters: Vec<&str> = dispatcher.filters().collect();
        assert_eq!(filters, vec!["b", "a"]);
    }
}
