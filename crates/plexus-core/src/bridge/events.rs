//! Push-event bus.
//!
//! The host publishes typed events; subscribers receive them on their own
//! unbounded channel, filtered by topic. `publish` holds the subscriber
//! lock while fanning out, so every subscriber observes events in emission
//! order.

use crate::settings::RuntimeSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Event names that may be pushed across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "download.progress")]
    DownloadProgress,
    #[serde(rename = "download.completed")]
    DownloadCompleted,
    #[serde(rename = "download.aborted")]
    DownloadAborted,
    #[serde(rename = "download.error")]
    DownloadError,
    #[serde(rename = "settings.changed")]
    SettingsChanged,
}

impl EventTopic {
    pub const ALL: [EventTopic; 5] = [
        EventTopic::DownloadProgress,
        EventTopic::DownloadCompleted,
        EventTopic::DownloadAborted,
        EventTopic::DownloadError,
        EventTopic::SettingsChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::DownloadProgress => "download.progress",
            EventTopic::DownloadCompleted => "download.completed",
            EventTopic::DownloadAborted => "download.aborted",
            EventTopic::DownloadError => "download.error",
            EventTopic::SettingsChanged => "settings.changed",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventTopic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventTopic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| format!("unknown event topic: {}", s))
    }
}

/// An event pushed from the host to UI subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename = "download.progress")]
    DownloadProgress {
        key: String,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    },
    #[serde(rename = "download.completed")]
    DownloadCompleted {
        key: String,
        destination: String,
        bytes_transferred: u64,
    },
    #[serde(rename = "download.aborted")]
    DownloadAborted { key: String, bytes_transferred: u64 },
    #[serde(rename = "download.error")]
    DownloadError {
        key: String,
        code: String,
        message: String,
    },
    #[serde(rename = "settings.changed")]
    SettingsChanged { settings: RuntimeSettings },
}

impl BridgeEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            BridgeEvent::DownloadProgress { .. } => EventTopic::DownloadProgress,
            BridgeEvent::DownloadCompleted { .. } => EventTopic::DownloadCompleted,
            BridgeEvent::DownloadAborted { .. } => EventTopic::DownloadAborted,
            BridgeEvent::DownloadError { .. } => EventTopic::DownloadError,
            BridgeEvent::SettingsChanged { .. } => EventTopic::SettingsChanged,
        }
    }

    /// Whether this event ends a download's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeEvent::DownloadCompleted { .. }
                | BridgeEvent::DownloadAborted { .. }
                | BridgeEvent::DownloadError { .. }
        )
    }

    /// Download key carried by the event, if any.
    pub fn download_key(&self) -> Option<&str> {
        match self {
            BridgeEvent::DownloadProgress { key, .. }
            | BridgeEvent::DownloadCompleted { key, .. }
            | BridgeEvent::DownloadAborted { key, .. }
            | BridgeEvent::DownloadError { key, .. } => Some(key),
            BridgeEvent::SettingsChanged { .. } => None,
        }
    }
}

struct Subscriber {
    topics: Option<HashSet<EventTopic>>,
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

/// One-to-many publisher of `BridgeEvent`s.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a set of topics. An empty slice subscribes to all.
    pub fn subscribe(&self, topics: &[EventTopic]) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = if topics.is_empty() {
            None
        } else {
            Some(topics.iter().copied().collect())
        };
        self.lock().push(Subscriber { topics, tx });
        EventSubscription { rx }
    }

    /// Deliver an event to every interested subscriber.
    ///
    /// Subscribers whose receiving side was dropped are pruned.
    pub fn publish(&self, event: BridgeEvent) {
        let topic = event.topic();
        let mut subscribers = self.lock();
        subscribers.retain(|sub| {
            let wanted = sub.topics.as_ref().map_or(true, |t| t.contains(&topic));
            if !wanted {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
        trace!("Published {} to {} subscriber(s)", topic, subscribers.len());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Receiving side of an `EventBus` subscription.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl EventSubscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(key: &str, n: u64) -> BridgeEvent {
        BridgeEvent::DownloadProgress {
            key: key.into(),
            bytes_transferred: n,
            bytes_total: Some(100),
        }
    }

    #[test]
    fn test_topic_strings() {
        for topic in EventTopic::ALL {
            assert_eq!(topic.as_str().parse::<EventTopic>().unwrap(), topic);
        }
        assert!("download.started".parse::<EventTopic>().is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(progress("model.gguf", 10)).unwrap();
        assert_eq!(json["topic"], "download.progress");
        assert_eq!(json["payload"]["bytesTransferred"], 10);
        assert_eq!(json["payload"]["bytesTotal"], 100);
    }

    #[tokio::test]
    async fn test_delivery_preserves_emission_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[]);

        for i in 0..10 {
            bus.publish(progress("k", i));
        }

        for i in 0..10 {
            match sub.recv().await.unwrap() {
                BridgeEvent::DownloadProgress {
                    bytes_transferred, ..
                } => assert_eq!(bytes_transferred, i),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_topic_filter() {
        let bus = EventBus::new();
        let mut errors_only = bus.subscribe(&[EventTopic::DownloadError]);
        let mut everything = bus.subscribe(&[]);

        bus.publish(progress("k", 1));
        bus.publish(BridgeEvent::DownloadError {
            key: "k".into(),
            code: "NETWORK".into(),
            message: "reset".into(),
        });

        assert_eq!(
            errors_only.recv().await.unwrap().topic(),
            EventTopic::DownloadError
        );
        assert!(errors_only.try_recv().is_none());

        assert_eq!(
            everything.recv().await.unwrap().topic(),
            EventTopic::DownloadProgress
        );
        assert_eq!(
            everything.recv().await.unwrap().topic(),
            EventTopic::DownloadError
        );
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[]);
        let _kept = bus.subscribe(&[]);
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        bus.publish(progress("k", 1));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
