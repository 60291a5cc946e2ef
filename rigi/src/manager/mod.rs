use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use minfac::{Registered, ServiceCollection};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    broker::{
        Broker, Event, EventId, PassthroughHandler, SubscriptionId, AI_ALERT_CHANNEL,
        ANGLE_CHANNEL, DIRECTION_CHANNEL,
    },
    hosted_service::ServiceBuilderExtensions,
    mapper::{CameraDescriptor, CameraMapper},
    shutdown::SystemShutdown,
    value::Payload,
};

crate::uuid_wrapper::wrapped_uuid!(CallbackId);

/// How long an admitted event occupies the slot before it expires.
pub const EVENT_TTL: Duration = Duration::from_secs(3);

pub const DATA_MANAGER_CHANNEL: &str = "data_manager";

pub(crate) fn register_services(c: &mut ServiceCollection) {
    c.with::<Registered<Arc<Broker>>>().register_shared(|broker| {
        let manager = DataManager::new();
        manager
            .attach(&broker)
            .expect("Built-in channels exist on a fresh broker");
        Arc::new(manager)
    });
    c.with::<(
        Registered<Arc<DataManager>>,
        Registered<CameraMapper>,
        Registered<SystemShutdown>,
    )>()
    .register_hosted_service("Data Manager", run_data_manager);
}

async fn run_data_manager(
    (manager, mapper, shutdown): (Arc<DataManager>, CameraMapper, SystemShutdown),
) -> anyhow::Result<()> {
    manager.run(mapper, shutdown).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Direction = 1,
    Angle = 2,
    Alert = 3,
}

impl EventPriority {
    pub fn for_channel(channel: &str) -> Option<Self> {
        match channel {
            DIRECTION_CHANNEL => Some(Self::Direction),
            ANGLE_CHANNEL => Some(Self::Angle),
            AI_ALERT_CHANNEL => Some(Self::Alert),
            _ => None,
        }
    }
}

impl Serialize for EventPriority {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// The event currently occupying the slot, with its resolved cameras.
/// `cameras` holds the sorted camera ids and defines duplicate equality
/// together with the channel; `camera_details` carries the full descriptors
/// for consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedEvent {
    pub channel: String,
    pub event_id: EventId,
    pub payload: Payload,
    pub cameras: Vec<String>,
    pub camera_details: Vec<CameraDescriptor>,
    pub priority: EventPriority,
    pub received_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    deadline: tokio::time::Instant,
}

impl ManagedEvent {
    fn build(
        channel: String,
        event_id: EventId,
        payload: Payload,
        mut camera_details: Vec<CameraDescriptor>,
        priority: EventPriority,
    ) -> Self {
        camera_details.sort_by(|a, b| a.id.cmp(&b.id));
        let received_at = Utc::now();
        Self {
            cameras: camera_details.iter().map(|c| c.id.clone()).collect(),
            camera_details,
            channel,
            event_id,
            payload,
            priority,
            received_at,
            expires_at: received_at + EVENT_TTL,
            deadline: tokio::time::Instant::now() + EVENT_TTL,
        }
    }

    pub fn is_expired(&self) -> bool {
        tokio::time::Instant::now() >= self.deadline
    }

    /// Seconds until the slot expires, zero once passed.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_default()
    }

    fn is_same(&self, other: &Self) -> bool {
        self.channel == other.channel && self.cameras == other.cameras
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admit { interrupts: bool, over_expired: bool },
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    NoCameras,
    Duplicate,
    LowerPriority,
}

/// The admission rule over the single slot. Alerts are admitted even
/// without a resolved camera; everything else needs at least one.
fn decide(current: Option<&ManagedEvent>, new: &ManagedEvent) -> Admission {
    if new.cameras.is_empty() && new.channel != AI_ALERT_CHANNEL {
        return Admission::Drop(DropReason::NoCameras);
    }

    let Some(current) = current else {
        return Admission::Admit {
            interrupts: false,
            over_expired: false,
        };
    };

    if current.is_expired() {
        return Admission::Admit {
            interrupts: false,
            over_expired: true,
        };
    }

    if current.is_same(new) {
        return Admission::Drop(DropReason::Duplicate);
    }

    if new.priority >= current.priority {
        return Admission::Admit {
            interrupts: new.priority > current.priority,
            over_expired: false,
        };
    }

    Admission::Drop(DropReason::LowerPriority)
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    interrupted: AtomicU64,
    duplicated: AtomicU64,
    expired: AtomicU64,
    no_cameras: AtomicU64,
}

/// Counter snapshot plus the current slot. All counters are monotonically
/// increasing for the lifetime of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub received: u64,
    pub sent: u64,
    pub interrupted: u64,
    pub duplicated: u64,
    pub expired: u64,
    pub no_cameras: u64,
    pub has_current_event: bool,
    pub current_event: Option<ManagedEvent>,
}

struct Delivery {
    channel: String,
    event_id: EventId,
    payload: Payload,
}

struct Slot {
    current: Option<ManagedEvent>,
    /// Incremented on every admission; a timer only clears the slot when
    /// its generation still matches (guards against late firings).
    generation: u64,
    timer: Option<tokio::task::JoinHandle<()>>,
}

type EventCallback = Arc<dyn Fn(&ManagedEvent) + Send + Sync>;

struct Inner {
    slot: Mutex<Slot>,
    callbacks: Mutex<Vec<(CallbackId, EventCallback)>>,
    counters: Counters,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
    broker: Mutex<Weak<Broker>>,
}

/// Single-slot event arbiter: subscribes to the broker, applies the
/// priority/duplicate/expiry admission rule and notifies registered
/// connection callbacks on every slot transition.
///
/// Broker deliveries are forwarded from the subscriber callback into the
/// manager's own task, which performs the (async) camera resolution;
/// nothing slow runs on the publisher's thread. Connection callbacks are
/// invoked under the slot lock so observers see admissions in order; they
/// must schedule their own work and return promptly.
pub struct DataManager {
    inner: Arc<Inner>,
}

impl Default for DataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DataManager {
    pub fn new() -> Self {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    current: None,
                    generation: 0,
                    timer: None,
                }),
                callbacks: Default::default(),
                counters: Default::default(),
                delivery_tx,
                delivery_rx: Mutex::new(Some(delivery_rx)),
                subscriptions: Default::default(),
                broker: Mutex::new(Weak::new()),
            }),
        }
    }

    /// Registers the introspection channel and subscribes to the three
    /// built-in channels. Must run before [`DataManager::run`].
    pub fn attach(&self, broker: &Arc<Broker>) -> Result<(), crate::broker::SubscribeError> {
        if !broker.is_registered(DATA_MANAGER_CHANNEL) {
            broker
                .register(
                    DATA_MANAGER_CHANNEL,
                    Arc::new(PassthroughHandler::new(DATA_MANAGER_CHANNEL)),
                    false,
                )
                .expect("Checked for existence above");
        }

        let mut subscriptions = self.inner.subscriptions.lock().expect("Not poisoned");
        for channel in [DIRECTION_CHANNEL, ANGLE_CHANNEL, AI_ALERT_CHANNEL] {
            let tx = self.inner.delivery_tx.clone();
            let id = broker.subscribe(channel, move |event: &Event| {
                let _closed_during_shutdown = tx.send(Delivery {
                    channel: event.channel.clone(),
                    event_id: event.id,
                    payload: event.payload.clone(),
                });
            })?;
            subscriptions.push((channel.to_owned(), id));
            info!("Data manager subscribed to {channel}: {id}");
        }
        *self.inner.broker.lock().expect("Not poisoned") = Arc::downgrade(broker);
        Ok(())
    }

    /// Consumes broker deliveries until shutdown. Runs at most once.
    pub async fn run(&self, mapper: CameraMapper, shutdown: SystemShutdown) -> anyhow::Result<()> {
        let mut rx = self
            .inner
            .delivery_rx
            .lock()
            .expect("Not poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("Data manager is already running"))?;

        info!("Data manager started");
        while let Some(Some(delivery)) = shutdown.wrap(rx.recv()).await {
            self.handle(&mapper, delivery).await;
        }

        self.shutdown();
        Ok(())
    }

    async fn handle(&self, mapper: &CameraMapper, delivery: Delivery) {
        self.inner.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(priority) = EventPriority::for_channel(&delivery.channel) else {
            warn!(
                "Delivery on unmanaged channel '{}' ignored",
                delivery.channel
            );
            return;
        };

        // Resolve cameras before taking the slot lock
        let cameras = mapper
            .resolve_for_event(&delivery.channel, &delivery.payload)
            .await;
        let new = ManagedEvent::build(
            delivery.channel,
            delivery.event_id,
            delivery.payload,
            cameras,
            priority,
        );

        let mut slot = self.inner.slot.lock().expect("Not poisoned");
        match decide(slot.current.as_ref(), &new) {
            Admission::Drop(reason) => {
                let counter = match reason {
                    DropReason::NoCameras => &self.inner.counters.no_cameras,
                    DropReason::Duplicate => &self.inner.counters.duplicated,
                    DropReason::LowerPriority => {
                        debug!(
                            "Lower priority event ignored: {} < current",
                            new.channel
                        );
                        return;
                    }
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!("Event not admitted: type={}, reason={reason:?}", new.channel);
            }
            Admission::Admit {
                interrupts,
                over_expired,
            } => {
                if over_expired {
                    self.inner.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
                if interrupts {
                    self.inner
                        .counters
                        .interrupted
                        .fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Higher priority event interrupting: {} over {:?}",
                        new.channel,
                        slot.current.as_ref().map(|c| c.channel.as_str())
                    );
                }
                self.admit(&mut slot, new);
            }
        }
    }

    fn admit(&self, slot: &mut Slot, new: ManagedEvent) {
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            message_id = %new.event_id,
            "Dispatching event: type={}, cameras={}, priority={:?}",
            new.channel,
            new.cameras.len(),
            new.priority
        );

        slot.current = Some(new.clone());
        slot.generation += 1;

        self.dispatch(&new);
        self.restart_timer(slot);
    }

    fn dispatch(&self, event: &ManagedEvent) {
        let callbacks = self.inner.callbacks.lock().expect("Not poisoned").clone();
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Event callback {id} failed, continuing with the remaining callbacks");
            }
        }
    }

    fn restart_timer(&self, slot: &mut Slot) {
        if let Some(previous) = slot.timer.take() {
            previous.abort();
        }
        let inner = self.inner.clone();
        let generation = slot.generation;
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(EVENT_TTL).await;
            let mut slot = inner.slot.lock().expect("Not poisoned");
            if slot.generation == generation {
                if let Some(expired) = slot.current.take() {
                    inner.counters.expired.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        message_id = %expired.event_id,
                        "Event expired: type={}",
                        expired.channel
                    );
                }
            }
        }));
    }

    /// Callbacks run in registration order on every admission. A panicking
    /// callback is logged and does not affect the others.
    pub fn register_callback(
        &self,
        callback: impl Fn(&ManagedEvent) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = CallbackId::new_v4();
        self.inner
            .callbacks
            .lock()
            .expect("Not poisoned")
            .push((id, Arc::new(callback)));
        info!("Registered event callback: {id}");
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.inner.callbacks.lock().expect("Not poisoned");
        let before = callbacks.len();
        callbacks.retain(|(x, _)| *x != id);
        callbacks.len() != before
    }

    /// The active event, absent when nothing is admitted or the slot has
    /// logically expired (even if the timer has not fired yet).
    pub fn current_event(&self) -> Option<ManagedEvent> {
        self.inner
            .slot
            .lock()
            .expect("Not poisoned")
            .current
            .clone()
            .filter(|e| !e.is_expired())
    }

    pub fn stats(&self) -> ManagerStats {
        let counters = &self.inner.counters;
        let current_event = self.current_event();
        ManagerStats {
            received: counters.received.load(Ordering::Relaxed),
            sent: counters.sent.load(Ordering::Relaxed),
            interrupted: counters.interrupted.load(Ordering::Relaxed),
            duplicated: counters.duplicated.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            no_cameras: counters.no_cameras.load(Ordering::Relaxed),
            has_current_event: current_event.is_some(),
            current_event,
        }
    }

    /// Cancels the timer, removes the broker subscriptions and clears the
    /// slot and callbacks.
    pub fn shutdown(&self) {
        info!("Shutting down data manager");
        {
            let mut slot = self.inner.slot.lock().expect("Not poisoned");
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            slot.current = None;
            slot.generation += 1;
        }

        let subscriptions =
            std::mem::take(&mut *self.inner.subscriptions.lock().expect("Not poisoned"));
        if let Some(broker) = self.inner.broker.lock().expect("Not poisoned").upgrade() {
            for (channel, id) in subscriptions {
                broker.unsubscribe(&channel, id);
            }
        }

        self.inner.callbacks.lock().expect("Not poisoned").clear();
    }
}
