//! The component-management kernel.
//!
//! Owns the component table and drives every lifecycle transition, publishing
//! each one on the event bus. Reference registries consume the kernel through
//! three narrow surfaces: [`Kernel::running_ids`] for initial population,
//! [`Kernel::watch_lifecycle`] for the lifecycle feed, and
//! [`Kernel::raw_invoker`] for proxy construction.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::SelectAll;
use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::component::{ComponentId, ManagedComponent, Pattern, RawInvoker};
use crate::config::KernelConfig;
use crate::event_bus::{
    ErrorEvent, ErrorReceiver, ErrorSeverity, Event, EventBus, EventReceiver, LastStatus, Value,
};
use crate::lifecycle::{ComponentState, EventType};

/// Callback record for one component's lifecycle transitions. Every slot
/// defaults to a no-op, so a watcher implements only the transitions it
/// cares about.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn running(&self, _id: &ComponentId) {}
    async fn stopping(&self, _id: &ComponentId) {}
    async fn stopped(&self, _id: &ComponentId) {}
    async fn unloaded(&self, _id: &ComponentId) {}
}

/// Handle to one lifecycle watch. Consuming [`LifecycleSubscription::release`]
/// detaches the listener; by move semantics a subscription can only be
/// released once.
pub struct LifecycleSubscription {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl LifecycleSubscription {
    pub fn release(self) {
        let _ = self.shutdown_tx.send(());
        // dispatch taskはシグナルで終了するのでhandleは破棄するだけでよい
        drop(self.handle);
    }
}

enum FeedMessage {
    Event(Event),
    Shutdown,
}

pub struct Kernel {
    components: DashMap<ComponentId, ComponentEntry>,
    event_bus: Arc<EventBus>,
    shutdown_tx: broadcast::Sender<()>,
    config: KernelConfig,
}

struct ComponentEntry {
    component: Arc<dyn ManagedComponent>,
    state: ComponentState,
    last_status: LastStatus,
}

impl ComponentEntry {
    fn new(component: Arc<dyn ManagedComponent>, event_type: EventType) -> Self {
        Self {
            component,
            state: ComponentState::Stopped,
            last_status: LastStatus {
                last_event_type: event_type,
                last_event_time: Utc::now(),
            },
        }
    }

    fn record(&mut self, state: ComponentState, event_type: EventType) {
        self.state = state;
        self.last_status = LastStatus {
            last_event_type: event_type,
            last_event_time: Utc::now(),
        };
    }
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let (shutdown_tx, _) = broadcast::channel(1); // 容量は1で十分
        Self {
            components: DashMap::new(),
            event_bus,
            shutdown_tx,
            config,
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// The raw lifecycle feed: every event published by this kernel.
    pub fn subscribe(&self) -> (EventReceiver, ErrorReceiver) {
        self.event_bus.subscribe()
    }

    /// Watches lifecycle transitions of components matching `pattern`,
    /// routing each one to the listener's slot. The returned subscription is
    /// the only way to stop the watch.
    pub fn watch_lifecycle(
        &self,
        pattern: Pattern,
        listener: Arc<dyn LifecycleListener>,
    ) -> LifecycleSubscription {
        let (event_rx, _) = self.event_bus.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(dispatch_lifecycle(pattern, listener, event_rx, shutdown_rx));
        LifecycleSubscription {
            shutdown_tx,
            handle,
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    #[tracing::instrument(skip(self, component), level = "debug")]
    pub async fn register_component(
        &self,
        component: Arc<dyn ManagedComponent>,
    ) -> KernelResult<()> {
        let id = component.component_id();
        if self.components.contains_key(&id) {
            return Err(KernelError::ComponentAlreadyExists {
                component_id: id.to_string(),
            });
        }

        let event_type = EventType::ComponentRegistered {
            component_id: id.to_string(),
        };
        self.components
            .insert(id.clone(), ComponentEntry::new(component, event_type.clone()));

        debug!(component_id = %id, "component registered");
        self.announce(event_type).await;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn start_component(&self, id: &ComponentId) -> KernelResult<()> {
        let component = self.transition(id, ComponentState::Starting)?;
        self.announce(EventType::ComponentStarting {
            component_id: id.to_string(),
        })
        .await;

        // startフックが失敗した場合はStoppedへ戻す
        if let Err(e) = component.start().await {
            let _ = self.transition(id, ComponentState::Stopped);
            self.report_failure(id, &e.to_string()).await;
            return Err(KernelError::StartFailed {
                component_id: id.to_string(),
                message: e.to_string(),
            });
        }

        self.transition(id, ComponentState::Running)?;
        info!(component_id = %id, "component running");
        self.announce(EventType::ComponentRunning {
            component_id: id.to_string(),
        })
        .await;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn stop_component(&self, id: &ComponentId) -> KernelResult<()> {
        let component = self.transition(id, ComponentState::Stopping)?;
        self.announce(EventType::ComponentStopping {
            component_id: id.to_string(),
        })
        .await;

        let timed_out = match timeout(self.config.stop_timeout, component.stop()).await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                // stopフックの失敗は停止自体を妨げない
                warn!(component_id = %id, error = %e, "stop hook failed");
                self.report_failure(id, &e.to_string()).await;
                false
            }
            Err(_) => {
                warn!(component_id = %id, "stop hook timed out");
                true
            }
        };

        // タイムアウトしても状態はStoppedへ収束させる
        self.transition(id, ComponentState::Stopped)?;
        self.announce(EventType::ComponentStopped {
            component_id: id.to_string(),
        })
        .await;

        if timed_out {
            return Err(KernelError::StopTimeout {
                component_id: id.to_string(),
                timeout_ms: self.config.stop_timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn unload_component(&self, id: &ComponentId) -> KernelResult<()> {
        {
            let entry = self
                .components
                .get(id)
                .ok_or_else(|| KernelError::ComponentNotFound {
                    component_id: id.to_string(),
                })?;
            if !entry.state.can_transition_to(ComponentState::Unloaded) {
                return Err(KernelError::IllegalTransition {
                    component_id: id.to_string(),
                    from: entry.state.to_string(),
                    to: ComponentState::Unloaded.to_string(),
                });
            }
        }

        self.components.remove(id);
        info!(component_id = %id, "component unloaded");
        self.announce(EventType::ComponentUnloaded {
            component_id: id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Running components whose id matches `pattern`.
    pub fn running_ids(&self, pattern: &Pattern) -> Vec<ComponentId> {
        self.components
            .iter()
            .filter(|entry| entry.state == ComponentState::Running && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn component_state(&self, id: &ComponentId) -> Option<ComponentState> {
        self.components.get(id).map(|entry| entry.state)
    }

    pub fn component_status(&self, id: &ComponentId) -> Option<LastStatus> {
        self.components.get(id).map(|entry| entry.last_status.clone())
    }

    /// Introspection accessor for proxy construction. `None` when the
    /// component is unknown or does not support raw invocation.
    pub fn raw_invoker(&self, id: &ComponentId) -> Option<Arc<dyn RawInvoker>> {
        self.components.get(id).and_then(|entry| entry.component.raw_invoker())
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    // 全コンポーネントの停止とシャットダウン
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn shutdown(&self) -> KernelResult<()> {
        info!("initiating kernel shutdown");
        self.announce(EventType::KernelStopping).await;

        let running_ids: Vec<_> = self
            .components
            .iter()
            .filter(|entry| entry.state == ComponentState::Running)
            .map(|entry| entry.key().clone())
            .collect();

        // 並行して停止を実行
        let stop_futures = running_ids.iter().map(|id| self.stop_component(id));
        for result in join_all(stop_futures).await {
            if let Err(e) = result {
                warn!(error = %e, "component stop failed during shutdown");
            }
        }

        self.announce(EventType::KernelStopped).await;
        let _ = self.shutdown_tx.send(());
        info!("kernel shutdown completed");
        Ok(())
    }

    /// One state transition under the entry lock; returns the component for
    /// hook invocation. The entry guard is dropped before any await point.
    fn transition(
        &self,
        id: &ComponentId,
        next: ComponentState,
    ) -> KernelResult<Arc<dyn ManagedComponent>> {
        let mut entry = self
            .components
            .get_mut(id)
            .ok_or_else(|| KernelError::ComponentNotFound {
                component_id: id.to_string(),
            })?;

        if !entry.state.can_transition_to(next) {
            return Err(KernelError::IllegalTransition {
                component_id: id.to_string(),
                from: entry.state.to_string(),
                to: next.to_string(),
            });
        }

        let event_type = match next {
            ComponentState::Starting => EventType::ComponentStarting {
                component_id: id.to_string(),
            },
            ComponentState::Running => EventType::ComponentRunning {
                component_id: id.to_string(),
            },
            ComponentState::Stopping => EventType::ComponentStopping {
                component_id: id.to_string(),
            },
            ComponentState::Stopped => EventType::ComponentStopped {
                component_id: id.to_string(),
            },
            ComponentState::Unloaded => EventType::ComponentUnloaded {
                component_id: id.to_string(),
            },
        };
        entry.record(next, event_type);
        Ok(entry.component.clone())
    }

    /// Lifecycle progress must not depend on observers; publish failures
    /// (no subscriber) are traced and dropped.
    async fn announce(&self, event_type: EventType) {
        if let Err(e) = self.event_bus.publish(Event::of(event_type)).await {
            debug!(error = %e, "lifecycle event had no subscribers");
        }
    }

    async fn report_failure(&self, id: &ComponentId, message: &str) {
        let _ = self
            .event_bus
            .publish_error(ErrorEvent {
                error_type: "ComponentError".to_string(),
                message: message.to_string(),
                severity: ErrorSeverity::Error,
                parameters: {
                    let mut params = HashMap::new();
                    params.insert(
                        "component_id".to_string(),
                        Value::String(id.to_string()),
                    );
                    params
                },
            })
            .await;
    }
}

/// Drains the event feed for one watch, mapping lifecycle events onto the
/// listener's slots until the subscription is released.
async fn dispatch_lifecycle(
    pattern: Pattern,
    listener: Arc<dyn LifecycleListener>,
    event_rx: EventReceiver,
    shutdown_rx: broadcast::Receiver<()>,
) {
    // イベントストリームの変換
    let event_stream = BroadcastStream::new(event_rx.receiver).map(|e| match e {
        Ok(event) => Ok(FeedMessage::Event(event)),
        Err(_) => Err(()),
    });

    // シャットダウンストリームの変換
    let shutdown_stream = BroadcastStream::new(shutdown_rx).map(|e| match e {
        Ok(_) => Ok(FeedMessage::Shutdown),
        Err(_) => Err(()),
    });

    // ストリームの統合
    let mut streams: SelectAll<Pin<Box<dyn Stream<Item = Result<FeedMessage, ()>> + Send>>> =
        SelectAll::new();
    streams.push(Box::pin(event_stream));
    streams.push(Box::pin(shutdown_stream));

    while let Some(message) = streams.next().await {
        match message {
            Ok(FeedMessage::Event(event)) => match event.event_type {
                EventType::ComponentRunning { component_id } => {
                    let id = ComponentId::new(component_id);
                    if pattern.matches(&id) {
                        listener.running(&id).await;
                    }
                }
                EventType::ComponentStopping { component_id } => {
                    let id = ComponentId::new(component_id);
                    if pattern.matches(&id) {
                        listener.stopping(&id).await;
                    }
                }
                EventType::ComponentStopped { component_id } => {
                    let id = ComponentId::new(component_id);
                    if pattern.matches(&id) {
                        listener.stopped(&id).await;
                    }
                }
                EventType::ComponentUnloaded { component_id } => {
                    let id = ComponentId::new(component_id);
                    if pattern.matches(&id) {
                        listener.unloaded(&id).await;
                    }
                }
                _ => {}
            },
            Ok(FeedMessage::Shutdown) => break,
            // Laggedは読み飛ばす。取りこぼした遷移は購読側の冪等性で吸収する
            Err(()) => continue,
        }
    }
    debug!(pattern = %pattern, "lifecycle watch finished");
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Component already exists: {component_id}")]
    ComponentAlreadyExists { component_id: String },
    #[error("Component not found: {component_id}")]
    ComponentNotFound { component_id: String },
    #[error("Illegal transition for component {component_id}: {from} -> {to}")]
    IllegalTransition {
        component_id: String,
        from: String,
        to: String,
    },
    #[error("Start hook failed for component {component_id}: {message}")]
    StartFailed {
        component_id: String,
        message: String,
    },
    #[error("Stop timeout for component {component_id} exceeded: {timeout_ms}ms")]
    StopTimeout {
        component_id: String,
        timeout_ms: u64,
    },
    // event error
    #[error("Event error: {0}")]
    Event(#[from] crate::event_bus::EventError),
}

pub type KernelResult<T> = Result<T, KernelError>;
