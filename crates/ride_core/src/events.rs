//! Lifecycle and position fan-out.
//!
//! Delivery is best-effort and at-most-once: a topic with no live subscriber
//! drops the message, and a subscriber that falls behind its channel capacity
//! loses the oldest messages. There is no replay.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{trace, warn};

use crate::geo::GeoPoint;
use crate::lifecycle::{CancellationReason, RideId, RiderId};
use crate::ports::Notifier;
use crate::pricing::VehicleType;
use crate::registry::DriverId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `ride:<id>`: everything about one ride.
    Ride(RideId),
    /// `drivers:new-requests`: rides that need a driver.
    NewRequests,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Ride(id) => write!(f, "ride:{id}"),
            Topic::NewRequests => f.write_str("drivers:new-requests"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RideEvent {
    Requested {
        ride_id: RideId,
        rider_id: RiderId,
        pickup: GeoPoint,
        drop: GeoPoint,
        vehicle_type: VehicleType,
        fare_total: f64,
        at: DateTime<Utc>,
    },
    SearchStarted {
        ride_id: RideId,
        pickup: GeoPoint,
        vehicle_type: VehicleType,
        fare_total: f64,
        at: DateTime<Utc>,
    },
    Matched {
        ride_id: RideId,
        driver_id: DriverId,
        at: DateTime<Utc>,
    },
    Accepted {
        ride_id: RideId,
        driver_id: DriverId,
        at: DateTime<Utc>,
    },
    Declined {
        ride_id: RideId,
        driver_id: DriverId,
        at: DateTime<Utc>,
    },
    Started {
        ride_id: RideId,
        driver_id: DriverId,
        at: DateTime<Utc>,
    },
    Completed {
        ride_id: RideId,
        driver_id: DriverId,
        final_fare: f64,
        at: DateTime<Utc>,
    },
    Cancelled {
        ride_id: RideId,
        reason: CancellationReason,
        driver_id: Option<DriverId>,
        at: DateTime<Utc>,
    },
}

impl RideEvent {
    pub fn ride_id(&self) -> RideId {
        match self {
            RideEvent::Requested { ride_id, .. }
            | RideEvent::SearchStarted { ride_id, .. }
            | RideEvent::Matched { ride_id, .. }
            | RideEvent::Accepted { ride_id, .. }
            | RideEvent::Declined { ride_id, .. }
            | RideEvent::Started { ride_id, .. }
            | RideEvent::Completed { ride_id, .. }
            | RideEvent::Cancelled { ride_id, .. } => *ride_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RideEvent::Requested { .. } => "requested",
            RideEvent::SearchStarted { .. } => "search-started",
            RideEvent::Matched { .. } => "matched",
            RideEvent::Accepted { .. } => "accepted",
            RideEvent::Declined { .. } => "declined",
            RideEvent::Started { .. } => "started",
            RideEvent::Completed { .. } => "completed",
            RideEvent::Cancelled { .. } => "cancelled",
        }
    }

    /// Rides going back to (or starting) a search are also offered to drivers.
    pub fn topics(&self) -> Vec<Topic> {
        let ride = Topic::Ride(self.ride_id());
        match self {
            RideEvent::SearchStarted { .. } | RideEvent::Declined { .. } => {
                vec![ride, Topic::NewRequests]
            }
            _ => vec![ride],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub position: GeoPoint,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: serde_json::Value,
}

type Channel = broadcast::Sender<Arc<Envelope>>;

/// In-process topic registry backed by one bounded broadcast channel per topic.
#[derive(Debug)]
pub struct LocalNotifier {
    channels: RwLock<HashMap<Topic, Channel>>,
    capacity: usize,
}

impl LocalNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let sender = channels
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription {
            topic,
            rx: sender.subscribe(),
        }
    }

    /// Topics that currently have a channel.
    pub fn topic_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn prune(&self, topic: &Topic) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(topic);
        }
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for LocalNotifier {
    fn notify(&self, topic: &Topic, payload: serde_json::Value) {
        let delivered = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = channels.get(topic) else {
                trace!(topic = %topic, "no subscribers, dropping");
                return;
            };
            let envelope = Arc::new(Envelope {
                topic: topic.to_string(),
                payload,
            });
            sender.send(envelope).is_ok()
        };
        if !delivered {
            self.prune(topic);
        }
    }
}

/// Receiving end for one topic.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Arc<Envelope>>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next message, skipping over anything lost to lag. `None` once the
    /// topic's channel is gone.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(missed)) => {
                    warn!(topic = %self.topic, missed, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(topic = %self.topic, missed, "subscriber lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Serializes lifecycle and position events and hands them to the notifier.
#[derive(Clone)]
pub struct EventBroadcaster {
    notifier: Arc<dyn Notifier>,
}

impl EventBroadcaster {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn lifecycle(&self, event: &RideEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(ride_id = %event.ride_id(), event = event.name(), error = %err, "event not serializable");
                return;
            }
        };
        for topic in event.topics() {
            self.notifier.notify(&topic, payload.clone());
        }
    }

    pub fn position(&self, update: &PositionUpdate) {
        let payload = match serde_json::to_value(update) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(ride_id = %update.ride_id, error = %err, "position not serializable");
                return;
            }
        };
        let mut body = serde_json::Map::new();
        body.insert("type".to_string(), serde_json::Value::from("driver-position"));
        if let serde_json::Value::Object(fields) = payload {
            body.extend(fields);
        }
        self.notifier
            .notify(&Topic::Ride(update.ride_id), serde_json::Value::Object(body));
    }
}
