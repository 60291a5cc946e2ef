use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use minfac::{Registered, ServiceCollection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{recovery::Recovery, value::Payload};

mod error;
mod handlers;

pub use error::*;
pub use handlers::*;

crate::uuid_wrapper::wrapped_uuid!(EventId);
crate::uuid_wrapper::wrapped_uuid!(SubscriptionId);

pub(crate) fn register_services(c: &mut ServiceCollection) {
    c.register_shared(|| Arc::new(Recovery::new()));
    c.with::<Registered<Arc<Recovery>>>()
        .register_shared(|recovery| Arc::new(Broker::with_default_channels(recovery)));
}

/// Outcome of a handler's payload validation. `errors` is empty iff `ok`;
/// warnings may be present either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for ValidationOutcome {
    fn default() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationOutcome {
    pub fn error(&mut self, message: impl Into<String>) {
        self.ok = false;
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// A validated, normalised message as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: EventId,
    pub channel: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishResult {
    pub success: bool,
    pub event_id: EventId,
    pub subscribers_notified: usize,
    pub errors: Vec<String>,
}

/// Subscription metadata exposed for introspection (without the callback).
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub channel: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub messages_published: u64,
    pub messages_failed: u64,
    pub subscriber_count: usize,
}

type SubscriberCallback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    created_at: DateTime<Utc>,
    callback: SubscriberCallback,
}

/// Process-wide message broker: registry of typed channels, thread-safe
/// pub/sub and subscriber-error isolation. One instance per process,
/// obtained through the service provider; components never look it up
/// through globals.
///
/// Locking: the handler lock is held only during register/unregister/lookup,
/// the subscription lock only while mutating or snapshotting the subscriber
/// list. Callbacks always run outside both locks, so two publishes on the
/// same channel from one task reach every subscriber in publish order.
pub struct Broker {
    handlers: RwLock<IndexMap<String, Arc<dyn ChannelHandler>>>,
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    published: AtomicU64,
    failed: AtomicU64,
    subscriber_count: AtomicUsize,
    recovery: Arc<Recovery>,
}

impl Broker {
    /// Composition-root entry point: a broker with the built-in channels
    /// (`direction_result`, `angle_value`, `ai_alert`) registered.
    pub fn with_default_channels(recovery: Arc<Recovery>) -> Self {
        let broker = Self::empty(recovery);
        for handler in [
            Arc::new(DirectionHandler) as Arc<dyn ChannelHandler>,
            Arc::new(AngleHandler),
            Arc::new(AiAlertHandler),
        ] {
            let channel = handler.type_name().to_owned();
            broker
                .register(&channel, handler, false)
                .expect("Built-in channels cannot conflict on a fresh broker");
        }
        info!("Broker initialized with default channels");
        broker
    }

    fn empty(recovery: Arc<Recovery>) -> Self {
        Self {
            handlers: Default::default(),
            subscribers: Default::default(),
            published: Default::default(),
            failed: Default::default(),
            subscriber_count: Default::default(),
            recovery,
        }
    }

    pub fn recovery(&self) -> &Arc<Recovery> {
        &self.recovery
    }

    /// Registers a handler for `channel`. When overriding, the existing
    /// subscriber list is preserved so consumers keep receiving events.
    pub fn register(
        &self,
        channel: &str,
        handler: Arc<dyn ChannelHandler>,
        allow_override: bool,
    ) -> Result<(), RegisterError> {
        if handler.type_name() != channel {
            return Err(RegisterError::InvalidHandler {
                requested: channel.to_owned(),
                actual: handler.type_name().to_owned(),
            });
        }

        {
            let mut handlers = self.handlers.write().expect("Not poisoned");
            if handlers.contains_key(channel) {
                if !allow_override {
                    return Err(RegisterError::AlreadyRegistered(channel.to_owned()));
                }
                warn!("Overriding existing handler for channel: {channel}");
            }
            handlers.insert(channel.to_owned(), handler);
        }

        self.subscribers
            .lock()
            .expect("Not poisoned")
            .entry(channel.to_owned())
            .or_default();

        info!("Registered channel: {channel}");
        Ok(())
    }

    /// Removes the handler but keeps the subscribers, so a later
    /// re-registration restores delivery to them.
    pub fn unregister(&self, channel: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .expect("Not poisoned")
            .shift_remove(channel)
            .is_some();
        if removed {
            info!("Unregistered channel: {channel}");
        } else {
            warn!("Cannot unregister channel '{channel}': not registered");
        }
        removed
    }

    pub fn is_registered(&self, channel: &str) -> bool {
        self.handlers
            .read()
            .expect("Not poisoned")
            .contains_key(channel)
    }

    pub fn registered_channels(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("Not poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn handler(&self, channel: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers
            .read()
            .expect("Not poisoned")
            .get(channel)
            .cloned()
    }

    pub fn subscribe(
        &self,
        channel: &str,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, SubscribeError> {
        if !self.is_registered(channel) {
            return Err(SubscribeError::UnknownChannel {
                channel: channel.to_owned(),
                available: self.registered_channels(),
            });
        }

        let subscription = Subscription {
            id: SubscriptionId::new_v4(),
            created_at: Utc::now(),
            callback: Arc::new(callback),
        };
        let id = subscription.id;

        let mut subscribers = self.subscribers.lock().expect("Not poisoned");
        let list = subscribers.entry(channel.to_owned()).or_default();
        list.push(subscription);
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        info!(
            subscriber_id = %id,
            "Subscriber registered for channel '{channel}' (total for this channel: {})",
            list.len()
        );
        Ok(id)
    }

    /// Returns false when the subscription is unknown; repeating the call is
    /// harmless.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().expect("Not poisoned");
        let Some(list) = subscribers.get_mut(channel) else {
            warn!("Cannot unsubscribe {id}: channel '{channel}' not found");
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        if list.len() == before {
            warn!("Cannot unsubscribe {id}: subscription not found");
            return false;
        }
        self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        info!(
            "Unsubscribed {id} from '{channel}' (remaining for this channel: {})",
            list.len()
        );
        true
    }

    pub fn subscriber_count_for(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .expect("Not poisoned")
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn subscription_infos(&self, channel: &str) -> Vec<SubscriptionInfo> {
        self.subscribers
            .lock()
            .expect("Not poisoned")
            .get(channel)
            .map(|list| {
                list.iter()
                    .map(|s| SubscriptionInfo {
                        id: s.id,
                        channel: channel.to_owned(),
                        created_at: s.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validates, normalises and fans out a payload. Subscriber panics are
    /// caught and logged with the subscription id; they never propagate to
    /// the publisher and never affect the remaining subscribers.
    pub fn publish(&self, channel: &str, payload: Payload) -> Result<PublishResult, PublishError> {
        let Some(handler) = self.handler(channel) else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::UnknownChannel(channel.to_owned()));
        };

        let event_id = EventId::new_v4();
        let outcome = handler.validate(&payload);
        if !outcome.ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.recovery
                .report_validation_failure(event_id, channel, &outcome);
            return Ok(PublishResult {
                success: false,
                event_id,
                subscribers_notified: 0,
                errors: outcome.errors,
            });
        }

        let event = Event {
            id: event_id,
            channel: channel.to_owned(),
            payload: handler.process(payload),
            created_at: Utc::now(),
        };

        // Copy under lock, invoke outside of it
        let snapshot = self
            .subscribers
            .lock()
            .expect("Not poisoned")
            .get(channel)
            .cloned()
            .unwrap_or_default();

        let mut notified = 0;
        for subscription in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| (subscription.callback)(&event))) {
                Ok(()) => notified += 1,
                Err(panic) => {
                    self.recovery.report_subscriber_failure(
                        subscription.id,
                        event.id,
                        &panic_detail(panic),
                    );
                }
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            message_id = %event.id,
            message_type = channel,
            "Published event, notified {notified}/{} subscribers",
            snapshot.len()
        );

        Ok(PublishResult {
            success: true,
            event_id: event.id,
            subscribers_notified: notified,
            errors: Vec::new(),
        })
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            messages_published: self.published.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            subscriber_count: self.subscriber_count.load(Ordering::Relaxed),
        }
    }

    /// Clears handlers and subscribers. The instance stays usable for
    /// re-registration afterwards.
    pub fn shutdown(&self) {
        info!("Shutting down broker");
        self.subscribers.lock().expect("Not poisoned").clear();
        self.handlers.write().expect("Not poisoned").clear();
        self.subscriber_count.store(0, Ordering::Relaxed);
    }
}

fn panic_detail(panic: Box<dyn std::any::Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(x) => *x,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(x) => (*x).to_owned(),
            Err(_) => "opaque panic payload".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn broker() -> Broker {
        Broker::with_default_channels(Arc::new(Recovery::new()))
    }

    fn payload(value: serde_json::Value) -> Payload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn basic_direction_publish() {
        let broker = broker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        broker
            .subscribe("direction_result", move |e| {
                seen_clone.lock().unwrap().push(e.payload.clone());
            })
            .unwrap();

        let result = broker
            .publish(
                "direction_result",
                payload(json!({"command": "forward", "timestamp": "2025-01-01T00:00:00Z"})),
            )
            .unwrap();

        assert!(result.success);
        assert_eq!(result.subscribers_notified, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["command"], json!("forward"));
    }

    #[test]
    fn invalid_angle_is_rejected_without_notification() {
        let broker = broker();
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = invoked.clone();
        broker
            .subscribe("angle_value", move |_| {
                invoked_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let result = broker
            .publish("angle_value", payload(json!({"angle": 500})))
            .unwrap();

        assert!(!result.success);
        assert!(result.errors[0].contains("[-180, 360]"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(broker.stats().messages_failed, 1);
        assert_eq!(broker.stats().messages_published, 0);
    }

    #[test]
    fn register_rejects_duplicates_unless_override() {
        let broker = broker();
        let result = broker.register(
            "direction_result",
            Arc::new(PassthroughHandler::new("direction_result")),
            false,
        );
        assert_eq!(
            result,
            Err(RegisterError::AlreadyRegistered("direction_result".into()))
        );
        assert!(broker
            .register(
                "direction_result",
                Arc::new(PassthroughHandler::new("direction_result")),
                true,
            )
            .is_ok());
    }

    #[test]
    fn register_rejects_mismatched_type_name() {
        let broker = broker();
        assert_eq!(
            broker.register("alpha", Arc::new(PassthroughHandler::new("beta")), false),
            Err(RegisterError::InvalidHandler {
                requested: "alpha".into(),
                actual: "beta".into()
            })
        );
    }

    #[test]
    fn override_preserves_subscribers() {
        let broker = broker();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        broker
            .subscribe("direction_result", move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        broker
            .register(
                "direction_result",
                Arc::new(PassthroughHandler::new("direction_result")),
                true,
            )
            .unwrap();

        broker
            .publish("direction_result", payload(json!({"anything": true})))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_keeps_subscribers_for_reregistration() {
        let broker = broker();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        broker
            .subscribe("angle_value", move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(broker.unregister("angle_value"));
        assert_eq!(
            broker.publish("angle_value", payload(json!({"angle": 1}))),
            Err(PublishError::UnknownChannel("angle_value".into()))
        );

        broker
            .register("angle_value", Arc::new(AngleHandler), false)
            .unwrap();
        broker
            .publish("angle_value", payload(json!({"angle": 1})))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let broker = broker();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = broker
            .subscribe("ai_alert", move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(broker.unsubscribe("ai_alert", id));
        assert!(!broker.unsubscribe("ai_alert", id));
        assert!(!broker.unsubscribe("unknown", id));

        broker
            .publish(
                "ai_alert",
                payload(json!({"alert_type": "person_detected", "severity": "low"})),
            )
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_to_unknown_channel_fails() {
        let broker = broker();
        match broker.subscribe("nope", |_| {}) {
            Err(SubscribeError::UnknownChannel { channel, available }) => {
                assert_eq!(channel, "nope");
                assert_eq!(available.len(), 3);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let broker = broker();
        let records = Arc::new(Mutex::new(Vec::new()));

        broker
            .subscribe("direction_result", |_| panic!("subscriber bug"))
            .unwrap();
        for name in ["s2", "s3"] {
            let records = records.clone();
            broker
                .subscribe("direction_result", move |_| {
                    records.lock().unwrap().push(name);
                })
                .unwrap();
        }

        let result = broker
            .publish("direction_result", payload(json!({"command": "forward"})))
            .unwrap();

        assert!(result.success);
        assert_eq!(result.subscribers_notified, 2);
        assert_eq!(&*records.lock().unwrap(), &["s2", "s3"]);
    }

    #[test]
    fn subscribers_receive_events_in_publish_order() {
        let broker = broker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        broker
            .subscribe("angle_value", move |e| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push(e.payload["angle"].as_f64().unwrap());
            })
            .unwrap();

        for angle in [10.0, 20.0, 30.0] {
            broker
                .publish("angle_value", payload(json!({ "angle": angle })))
                .unwrap();
        }
        assert_eq!(&*seen.lock().unwrap(), &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn dynamic_channel_registration() {
        let broker = broker();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        broker
            .register(
                "robot_status",
                Arc::new(PassthroughHandler::new("robot_status")),
                false,
            )
            .unwrap();
        broker
            .subscribe("robot_status", move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let result = broker
            .publish("robot_status", payload(json!({"battery": 80})))
            .unwrap();
        assert!(result.success);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(broker.registered_channels().contains(&"robot_status".into()));
    }

    #[test]
    fn stats_track_published_failed_and_subscribers() {
        let broker = broker();
        let id = broker.subscribe("angle_value", |_| {}).unwrap();
        broker
            .publish("angle_value", payload(json!({"angle": 90})))
            .unwrap();
        broker
            .publish("angle_value", payload(json!({"angle": 999})))
            .unwrap();

        assert_eq!(
            broker.stats(),
            BrokerStats {
                messages_published: 1,
                messages_failed: 1,
                subscriber_count: 1
            }
        );
        broker.unsubscribe("angle_value", id);
        assert_eq!(broker.stats().subscriber_count, 0);
    }

    #[test]
    fn shutdown_clears_registry() {
        let broker = broker();
        broker.subscribe("angle_value", |_| {}).unwrap();
        broker.shutdown();
        assert!(broker.registered_channels().is_empty());
        assert_eq!(broker.stats().subscriber_count, 0);
        assert_eq!(
            broker.publish("angle_value", payload(json!({"angle": 1}))),
            Err(PublishError::UnknownChannel("angle_value".into()))
        );
    }
}
