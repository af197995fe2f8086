//! Subscription router: topic -> standing subscribers.
//!
//! A topic is one server-side subscription: a subject key within an index and collection.
//! Unlike pending requests, a subscription is not consumed by a delivery: every matching
//! notification is pushed to every subscriber of its topic, in frame-arrival order.
//!
//! Locks are never held across an await, so a first subscriber's `Claim` can settle its
//! topic from `Drop`.

use crate::gateway::error::GatewayError;
use crate::gateway::protocol::{Notification, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, watch};

/// Identifies one subscriber within its topic.
pub type SubscriptionId = u64;

/// Identity of a server-side subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub index: String,
    pub collection: String,
    pub subject: String,
}

impl TopicKey {
    pub fn new(index: impl Into<String>, collection: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            collection: collection.into(),
            subject: subject.into(),
        }
    }

    /// A frame without index or collection matches on the subject alone.
    fn matches(&self, subject: &str, frame: &Response) -> bool {
        self.subject == subject
            && frame.index.as_deref().map_or(true, |i| i == self.index)
            && frame.collection.as_deref().map_or(true, |c| c == self.collection)
    }
}

/// Receiving side of a standing subscription. Ends when the gateway tears down.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    key: TopicKey,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &TopicKey {
        &self.key
    }

    pub fn subject(&self) -> &str {
        &self.key.subject
    }

    /// Next notification, or `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_next(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

/// Where a topic's server-side subscription lives; used to replay it after reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub subject: String,
    pub index: String,
    pub collection: String,
    pub room_id: Option<String>,
}

impl Topic {
    pub fn key(&self) -> TopicKey {
        TopicKey::new(&self.index, &self.collection, &self.subject)
    }
}

/// Server answer to a topic's first subscribe, as seen by every subscriber of the topic.
#[derive(Debug, Clone)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(Arc<GatewayError>),
}

/// How a new subscriber joined its topic.
pub enum Arrival<'a> {
    /// First subscriber: it must subscribe on the server and settle the claim.
    First(Claim<'a>),
    /// The topic already exists; its server subscription may still be in flight.
    Joined(watch::Receiver<Readiness>),
}

impl Arrival<'_> {
    pub fn is_first(&self) -> bool {
        matches!(self, Arrival::First(_))
    }
}

/// Held by the first subscriber while the server subscription is in flight. Dropping it
/// unsettled fails the topic for everyone waiting on it.
pub struct Claim<'a> {
    router: &'a SubscriptionRouter,
    key: TopicKey,
    armed: bool,
}

impl Claim<'_> {
    /// The server accepted the subscription.
    pub fn ready(mut self, room_id: Option<String>) {
        self.armed = false;
        self.router.mark_ready(&self.key, room_id);
    }

    /// The server refused it: the topic and all its subscribers are dropped. Returns how
    /// many subscribers went with it.
    pub fn fail(mut self, error: &GatewayError) -> usize {
        self.armed = false;
        self.router.fail(&self.key, error)
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.armed {
            let dropped = self
                .router
                .fail(&self.key, &GatewayError::Closed("subscribe abandoned".to_string()));
            log::debug!("subscribe to {} abandoned, {} subscriber(s) dropped", self.key.subject, dropped);
        }
    }
}

/// Result of removing one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    NotFound,
    /// Other subscribers still watch the topic.
    Remaining,
    /// That was the last subscriber; the topic is gone.
    Last(Topic),
}

/// Result of delivering one notification frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: usize,
    /// Topics whose every subscriber had dropped its handle; their server rooms are unused.
    pub released: Vec<Topic>,
}

struct Entry {
    topic: Topic,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<Notification>)>,
    ready: watch::Sender<Readiness>,
}

impl Entry {
    fn is_ready(&self) -> bool {
        matches!(*self.ready.borrow(), Readiness::Ready)
    }
}

pub struct SubscriptionRouter {
    subject_field: String,
    inner: RwLock<HashMap<TopicKey, Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRouter {
    /// `subject_field` is the `_source` field notifications are routed by (e.g. "device_id").
    pub fn new(subject_field: impl Into<String>) -> Self {
        Self {
            subject_field: subject_field.into(),
            inner: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TopicKey, Entry>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TopicKey, Entry>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber to the topic `index/collection/subject`.
    pub fn add(&self, index: &str, collection: &str, subject: &str) -> (Subscription, Arrival<'_>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = TopicKey::new(index, collection, subject);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut g = self.write();
        let arrival = match g.get_mut(&key) {
            Some(entry) => {
                entry.subscribers.push((id, tx));
                Arrival::Joined(entry.ready.subscribe())
            }
            None => {
                let (ready, _) = watch::channel(Readiness::Pending);
                g.insert(
                    key.clone(),
                    Entry {
                        topic: Topic {
                            subject: subject.to_string(),
                            index: index.to_string(),
                            collection: collection.to_string(),
                            room_id: None,
                        },
                        subscribers: vec![(id, tx)],
                        ready,
                    },
                );
                Arrival::First(Claim {
                    router: self,
                    key: key.clone(),
                    armed: true,
                })
            }
        };
        (Subscription { id, key, rx }, arrival)
    }

    fn mark_ready(&self, key: &TopicKey, room_id: Option<String>) {
        if let Some(entry) = self.write().get_mut(key) {
            entry.topic.room_id = room_id;
            entry.ready.send_replace(Readiness::Ready);
        }
    }

    fn fail(&self, key: &TopicKey, error: &GatewayError) -> usize {
        let Some(entry) = self.write().remove(key) else {
            return 0;
        };
        entry
            .ready
            .send_replace(Readiness::Failed(Arc::new(error.replicate())));
        entry.subscribers.len()
    }

    pub fn remove(&self, key: &TopicKey, id: SubscriptionId) -> Removal {
        let mut g = self.write();
        let Some(entry) = g.get_mut(key) else {
            return Removal::NotFound;
        };
        let before = entry.subscribers.len();
        entry.subscribers.retain(|(sid, _)| *sid != id);
        if entry.subscribers.len() == before {
            return Removal::NotFound;
        }
        if !entry.subscribers.is_empty() {
            return Removal::Remaining;
        }
        match g.remove(key) {
            Some(entry) => Removal::Last(entry.topic),
            None => Removal::NotFound,
        }
    }

    /// Remember the server room of a topic (from a subscribe response).
    pub fn set_room(&self, key: &TopicKey, room_id: Option<String>) {
        if let Some(entry) = self.write().get_mut(key) {
            entry.topic.room_id = room_id;
        }
    }

    /// Forget every room: they belonged to a connection that is gone.
    pub fn forget_rooms(&self) {
        for entry in self.write().values_mut() {
            entry.topic.room_id = None;
        }
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.read().values().map(|e| e.topic.clone()).collect()
    }

    /// Topics to subscribe again on a new connection: settled ones with a live subscriber.
    /// Topics whose subscribers all dropped their handles are removed on the way.
    pub fn standing_topics(&self) -> Vec<Topic> {
        let mut g = self.write();
        g.retain(|key, entry| {
            entry.subscribers.retain(|(_, tx)| !tx.is_closed());
            if entry.subscribers.is_empty() {
                log::debug!("releasing {}: no subscriber left", key.subject);
                return false;
            }
            true
        });
        g.values()
            .filter(|e| e.is_ready())
            .map(|e| e.topic.clone())
            .collect()
    }

    pub fn subscriber_count(&self, key: &TopicKey) -> usize {
        self.read().get(key).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    /// Subject key of a frame shaped like a state notification: a create/replace action whose
    /// `result._source` carries the subject field.
    pub fn subject_of(&self, frame: &Response) -> Option<String> {
        match frame.action.as_deref() {
            Some("create") | Some("replace") => {}
            _ => return None,
        }
        frame
            .source()?
            .get(&self.subject_field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Deliver a notification frame to the subscribers of every topic it matches. Topics left
    /// without a live subscriber are removed and reported in `released`.
    pub fn dispatch(&self, frame: &Response) -> Dispatch {
        let mut out = Dispatch::default();
        let Some(subject) = self.subject_of(frame) else {
            return out;
        };
        let Some(source) = frame.source() else {
            return out;
        };
        let action = frame.action.clone().unwrap_or_default();
        let notification = Notification::from_source(subject.clone(), action, source);

        let mut g = self.write();
        let mut matched = 0;
        let mut emptied = Vec::new();
        for (key, entry) in g.iter_mut().filter(|(k, _)| k.matches(&subject, frame)) {
            matched += 1;
            entry.subscribers.retain(|(id, tx)| {
                if tx.send(notification.clone()).is_ok() {
                    out.delivered += 1;
                    true
                } else {
                    log::debug!("subscriber {} for {} dropped its receiver", id, subject);
                    false
                }
            });
            if entry.subscribers.is_empty() {
                emptied.push(key.clone());
            }
        }
        if matched == 0 {
            log::debug!("no subscriber for {}, dropping notification", subject);
        }
        for key in emptied {
            if let Some(entry) = g.remove(&key) {
                out.released.push(entry.topic);
            }
        }
        out
    }

    /// Drop every subscription; their streams end.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wait for the first subscriber of a topic to settle it.
pub(crate) async fn joined(mut ready: watch::Receiver<Readiness>) -> Result<(), GatewayError> {
    let _ = ready.wait_for(|r| !matches!(r, Readiness::Pending)).await;
    let outcome = ready.borrow().clone();
    match outcome {
        Readiness::Ready => Ok(()),
        Readiness::Failed(e) => Err(e.replicate()),
        Readiness::Pending => Err(GatewayError::Closed(
            "gateway stopped before the subscription was confirmed".to_string(),
        )),
    }
}
