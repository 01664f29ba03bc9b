//! # Event Bus Implementation
//!
//! The EventBus is the central messaging hub of the kernel: every component
//! lifecycle transition and registry membership change is published here as a
//! broadcast event, so observers (reference registries, monitors, tests) can
//! follow the system without direct coupling to the kernel internals.
//!
//! ## Design Decisions
//!
//! The implementation uses Tokio's broadcast channel rather than MPSC channels to:
//!
//! 1. Allow multiple subscribers to receive the same event
//! 2. Efficiently handle backpressure through the channel capacity
//! 3. Support non-blocking publish operations
//!
//! Error events travel on a separate channel so that a burst of failures can
//! never crowd lifecycle notifications out of the main channel.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::lifecycle::EventType;

/// A discrete message on the bus: a typed event plus its payload parameters.
///
/// Lifecycle events carry the component id inside the event type itself;
/// `parameters` holds any additional payload as key-value pairs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    /// The type of event, which determines how it's routed and processed
    pub event_type: EventType,
    /// Event payload data as key-value pairs
    pub parameters: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: &EventType, parameters: &HashMap<String, Value>) -> Self {
        Self {
            event_type: event_type.clone(),
            parameters: parameters.clone(),
        }
    }

    pub fn of(event_type: EventType) -> Self {
        Self {
            event_type,
            parameters: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub parameters: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ErrorSeverity {
    #[default]
    Warning, // 通知のみ
    Error,    // 処理中断
    Critical, // システム停止
}

// 値の型
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Duration(Duration),
    Map(HashMap<String, Value>),
    Null,
}

impl<T: Into<String>> From<T> for Value
where
    T: AsRef<str>,
{
    fn from(value: T) -> Self {
        Value::String(value.into())
    }
}

/// Last observed event for one component, kept by the kernel for status queries.
#[derive(Debug, Clone)]
pub struct LastStatus {
    pub last_event_type: EventType,
    pub last_event_time: DateTime<Utc>,
}

impl From<LastStatus> for Event {
    fn from(status: LastStatus) -> Self {
        Event {
            event_type: status.last_event_type,
            parameters: {
                let mut params = HashMap::new();
                params.insert(
                    "last_event_time".to_string(),
                    Value::String(status.last_event_time.to_rfc3339()),
                );
                params
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event send failed: {message}")]
    SendFailed { message: String },

    #[error("Event receive failed: {message}")]
    ReceiveFailed { message: String },

    #[error("Event receiver lagged, skipped {count} events")]
    Lagged { count: u64 },
}

pub type EventResult<T> = Result<T, EventError>;

pub struct EventBus {
    event_sender: broadcast::Sender<Event>,
    error_sender: broadcast::Sender<ErrorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_sender, _) = broadcast::channel(capacity);
        let (error_sender, _) = broadcast::channel(capacity);
        Self {
            event_sender,
            error_sender,
        }
    }

    pub fn subscribe(&self) -> (EventReceiver, ErrorReceiver) {
        let event_rx = self.event_sender.subscribe();
        let error_rx = self.error_sender.subscribe();
        (EventReceiver::new(event_rx), ErrorReceiver::new(error_rx))
    }

    pub async fn publish(&self, event: Event) -> EventResult<()> {
        trace!(event_type = %event.event_type, "publishing event");
        self.event_sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn publish_error(&self, error: ErrorEvent) -> EventResult<()> {
        self.error_sender
            .send(error)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_sender.receiver_count()
    }
}

pub struct EventReceiver {
    pub receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// イベントを受信する。Laggedエラーが発生した場合はresubscribeを試みて、エラーを返す。
    /// 利用側で、Laggedなどが発生しないようできるだけすぐに次のrecvを呼ぶようにする。
    pub async fn recv(&mut self) -> EventResult<Event> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // n個のメッセージをスキップ
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }
}

pub struct ErrorReceiver {
    pub receiver: broadcast::Receiver<ErrorEvent>,
}

impl ErrorReceiver {
    fn new(receiver: broadcast::Receiver<ErrorEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> EventResult<ErrorEvent> {
        self.receiver
            .recv()
            .await
            .map_err(|e| EventError::ReceiveFailed {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::EventType;
    use tokio;

    #[tokio::test]
    async fn test_basic_publish_subscribe() {
        let bus = EventBus::new(16);
        let (mut event_rx, _) = bus.subscribe();

        let test_event = Event {
            event_type: EventType::Custom("test".to_string()),
            parameters: Default::default(),
        };

        bus.publish(test_event.clone()).await.unwrap();

        let received = event_rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::Custom("test".to_string()));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(16);
        let (mut rx1, _) = bus.subscribe();
        let (mut rx2, _) = bus.subscribe();

        let test_event = Event {
            event_type: EventType::Custom("test".to_string()),
            parameters: Default::default(),
        };

        bus.publish(test_event.clone()).await.unwrap();

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();

        assert_eq!(received1.event_type, EventType::Custom("test".to_string()));
        assert_eq!(received2.event_type, EventType::Custom("test".to_string()));
    }

    #[tokio::test]
    async fn test_error_channel() {
        let bus = EventBus::new(16);
        let (_, mut error_rx) = bus.subscribe();

        let test_error = ErrorEvent {
            error_type: "test_error".to_string(),
            message: "test message".to_string(),
            ..Default::default()
        };

        bus.publish_error(test_error.clone()).await.unwrap();

        let received = error_rx.recv().await.unwrap();
        assert_eq!(received.error_type, "test_error");
    }

    #[tokio::test]
    async fn test_lagged_receiver_resubscribes() {
        let bus = EventBus::new(2);
        let (mut rx, _) = bus.subscribe();

        // 容量2のチャネルに4件流してラグを起こす
        for i in 0..4 {
            bus.publish(Event {
                event_type: EventType::Custom(format!("event_{}", i)),
                parameters: Default::default(),
            })
            .await
            .unwrap();
        }

        let result = rx.recv().await;
        assert!(matches!(result, Err(EventError::Lagged { .. })));

        // resubscribe後は新しいイベントを受信できる
        bus.publish(Event {
            event_type: EventType::Custom("after".to_string()),
            parameters: Default::default(),
        })
        .await
        .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::Custom("after".to_string()));
    }
}
