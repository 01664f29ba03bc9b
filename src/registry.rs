//! # Reference Registry
//!
//! A live, thread-safe collection of component proxies whose membership is
//! driven entirely by the kernel's lifecycle feed. Callers observe it like a
//! read-only container; they never insert or remove members themselves:
//! `ComponentRunning` adds a proxy for the component, and any of
//! `ComponentStopping` / `ComponentStopped` / `ComponentUnloaded` evicts it.
//!
//! ## Locking discipline
//!
//! One mutex guards members, listeners and the destroyed flag together, so
//! every observable transition is linearizable. Listener callbacks are
//! arbitrary external code and run strictly *outside* the lock, against a
//! point-in-time snapshot of the listener set: a listener that re-enters the
//! registry (calls `size()`, even `destroy()`) cannot deadlock, and a slow
//! listener cannot stall the lifecycle feed's view of the lock.
//!
//! The kernel feed subscription is owned exclusively by the registry;
//! [`ReferenceRegistry::destroy`] releases it exactly once and collapses the
//! registry permanently.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::component::{ComponentId, Pattern};
use crate::event_bus::{ErrorEvent, ErrorSeverity, Event, EventBus, Value};
use crate::kernel::{Kernel, LifecycleListener, LifecycleSubscription};
use crate::lifecycle::EventType;
use crate::proxy::{ComponentProxy, InterfaceSpec, ProxyError, ProxyFactory};

/// Membership-change notification: which registry, which proxy.
#[derive(Clone)]
pub struct ReferenceEvent {
    pub registry_name: String,
    pub member: Arc<ComponentProxy>,
}

/// Observer of membership changes. Both hooks default to no-ops so a
/// listener implements only the transitions it cares about.
#[async_trait]
pub trait ReferenceListener: Send + Sync {
    async fn member_added(&self, _event: &ReferenceEvent) -> RegistryResult<()> {
        Ok(())
    }

    async fn member_removed(&self, _event: &ReferenceEvent) -> RegistryResult<()> {
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unsupported operation '{operation}': membership is derived from the lifecycle feed")]
    UnsupportedOperation { operation: String },
    #[error("Listener failed: {message}")]
    ListenerFailed { message: String },
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

struct RegistryState {
    members: HashMap<ComponentId, Arc<ComponentProxy>>,
    listeners: Vec<Arc<dyn ReferenceListener>>,
    destroyed: bool,
    /// Kernel feed subscription; taken exactly once at destroy.
    subscription: Option<LifecycleSubscription>,
}

pub struct ReferenceRegistry {
    name: String,
    factory: ProxyFactory,
    event_bus: Arc<EventBus>,
    state: Mutex<RegistryState>,
}

/// The registry's own lifecycle listener: running adds the component,
/// every stop-side transition removes it. Holds the registry weakly so an
/// abandoned registry does not keep itself alive through its watch task.
struct RegistryLifecycleListener {
    registry: Weak<ReferenceRegistry>,
    kernel: Weak<Kernel>,
}

#[async_trait]
impl LifecycleListener for RegistryLifecycleListener {
    async fn running(&self, id: &ComponentId) {
        let (Some(registry), Some(kernel)) = (self.registry.upgrade(), self.kernel.upgrade())
        else {
            return;
        };
        if let Err(e) = registry.add_target(&kernel, id).await {
            error!(
                registry = %registry.name,
                component_id = %id,
                error = %e,
                "failed to add member"
            );
            registry.report_failure(e.to_string()).await;
        }
    }

    async fn stopping(&self, id: &ComponentId) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_target(id).await;
        }
    }

    async fn stopped(&self, id: &ComponentId) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_target(id).await;
        }
    }

    async fn unloaded(&self, id: &ComponentId) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_target(id).await;
        }
    }
}

impl ReferenceRegistry {
    /// Opens a registry over every running component matching `pattern`.
    ///
    /// The feed subscription is taken before the current running set is
    /// resolved; the overlap produces duplicate running notifications which
    /// the idempotent add path absorbs, so no transition is lost. Fails if
    /// any matched component cannot be proxied.
    pub async fn open(
        name: impl Into<String>,
        interface: InterfaceSpec,
        pattern: Pattern,
        kernel: &Arc<Kernel>,
    ) -> RegistryResult<Arc<Self>> {
        let name = name.into();

        let registry = Arc::new(Self {
            name: name.clone(),
            factory: ProxyFactory::new(interface),
            event_bus: kernel.event_bus(),
            state: Mutex::new(RegistryState {
                members: HashMap::new(),
                listeners: Vec::new(),
                destroyed: false,
                subscription: None,
            }),
        });

        // 先に購読してから初期メンバーを解決する
        let listener = Arc::new(RegistryLifecycleListener {
            registry: Arc::downgrade(&registry),
            kernel: Arc::downgrade(kernel),
        });
        let subscription = kernel.watch_lifecycle(pattern.clone(), listener);

        for id in kernel.running_ids(&pattern) {
            if let Err(e) = registry.add_target(kernel, &id).await {
                subscription.release();
                return Err(e);
            }
        }

        registry.lock().subscription = Some(subscription);

        info!(registry = %name, pattern = %pattern, "reference registry opened");
        Ok(registry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Read API. Every query collapses to the empty answer once destroyed.
    // ------------------------------------------------------------------

    pub fn size(&self) -> usize {
        let state = self.lock();
        if state.destroyed {
            return 0;
        }
        state.members.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        if state.destroyed {
            return true;
        }
        state.members.is_empty()
    }

    pub fn contains(&self, proxy: &ComponentProxy) -> bool {
        let state = self.lock();
        if state.destroyed {
            return false;
        }
        state.members.values().any(|member| member.as_ref() == proxy)
    }

    pub fn contains_all<'a>(&self, proxies: impl IntoIterator<Item = &'a ComponentProxy>) -> bool {
        let state = self.lock();
        proxies.into_iter().all(|proxy| {
            !state.destroyed && state.members.values().any(|member| member.as_ref() == proxy)
        })
    }

    /// Point-in-time copy of the current members.
    pub fn snapshot(&self) -> Vec<Arc<ComponentProxy>> {
        let state = self.lock();
        if state.destroyed {
            return Vec::new();
        }
        state.members.values().cloned().collect()
    }

    /// Iterates over a point-in-time copy: the copy is taken under the lock,
    /// the iteration itself is unlocked, so concurrent membership changes
    /// are never observed mid-iteration.
    pub fn iter(&self) -> impl Iterator<Item = Arc<ComponentProxy>> {
        self.snapshot().into_iter()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    // ------------------------------------------------------------------
    // Mutating collection API: present for conformance only. Membership is
    // derived, never client-writable.
    // ------------------------------------------------------------------

    pub fn add(&self, _proxy: Arc<ComponentProxy>) -> RegistryResult<()> {
        Self::unsupported("add")
    }

    pub fn remove(&self, _proxy: &ComponentProxy) -> RegistryResult<()> {
        Self::unsupported("remove")
    }

    pub fn add_all(&self, _proxies: Vec<Arc<ComponentProxy>>) -> RegistryResult<()> {
        Self::unsupported("add_all")
    }

    pub fn remove_all(&self, _proxies: &[Arc<ComponentProxy>]) -> RegistryResult<()> {
        Self::unsupported("remove_all")
    }

    pub fn retain_all(&self, _proxies: &[Arc<ComponentProxy>]) -> RegistryResult<()> {
        Self::unsupported("retain_all")
    }

    pub fn clear(&self) -> RegistryResult<()> {
        Self::unsupported("clear")
    }

    fn unsupported(operation: &str) -> RegistryResult<()> {
        Err(RegistryError::UnsupportedOperation {
            operation: operation.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Listener API
    // ------------------------------------------------------------------

    /// Registers a listener. Registering the same `Arc` twice is a no-op, as
    /// is any registration after destroy.
    pub fn add_listener(&self, listener: Arc<dyn ReferenceListener>) {
        let mut state = self.lock();
        if state.destroyed {
            return;
        }
        if state.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        state.listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ReferenceListener>) {
        let mut state = self.lock();
        state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// One-shot terminal transition: clears membership and listeners,
    /// releases the feed subscription, and leaves the registry permanently
    /// empty. Safe to call from a listener; subsequent calls are no-ops.
    pub fn destroy(&self) {
        let subscription = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.members.clear();
            state.listeners.clear();
            state.subscription.take()
        };

        if let Some(subscription) = subscription {
            subscription.release();
        }
        info!(registry = %self.name, "reference registry destroyed");
    }

    // ------------------------------------------------------------------
    // Internal mutators: the only authorized membership writers.
    // ------------------------------------------------------------------

    async fn add_target(&self, kernel: &Kernel, id: &ComponentId) -> RegistryResult<()> {
        let (proxy, listeners) = {
            let mut state = self.lock();
            // 破棄済み、または重複running通知はno-op
            if state.destroyed || state.members.contains_key(id) {
                return Ok(());
            }

            let invoker =
                kernel
                    .raw_invoker(id)
                    .ok_or_else(|| ProxyError::IntrospectionUnsupported {
                        target: id.clone(),
                    })?;
            let proxy = Arc::new(self.factory.create_proxy(id.clone(), invoker));
            state.members.insert(id.clone(), proxy.clone());

            // リスナーのスナップショットを取る
            (proxy, state.listeners.clone())
        };

        debug!(registry = %self.name, component_id = %id, "member added");
        let event = ReferenceEvent {
            registry_name: self.name.clone(),
            member: proxy,
        };
        self.deliver(&listeners, &event, Membership::Added).await;
        self.announce(EventType::MemberAdded {
            registry: self.name.clone(),
            component_id: id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn remove_target(&self, id: &ComponentId) {
        let (proxy, listeners) = {
            let mut state = self.lock();
            // membershipに無ければ重複stop通知なのでno-op
            let Some(proxy) = state.members.remove(id) else {
                return;
            };
            (proxy, state.listeners.clone())
        };

        debug!(registry = %self.name, component_id = %id, "member removed");
        let event = ReferenceEvent {
            registry_name: self.name.clone(),
            member: proxy,
        };
        self.deliver(&listeners, &event, Membership::Removed).await;
        self.announce(EventType::MemberRemoved {
            registry: self.name.clone(),
            component_id: id.to_string(),
        })
        .await;
    }

    /// Delivers one event to a listener snapshot, outside the lock. A
    /// listener that fails or panics is reported and skipped; delivery to
    /// the remaining listeners continues and the membership change stands.
    async fn deliver(
        &self,
        listeners: &[Arc<dyn ReferenceListener>],
        event: &ReferenceEvent,
        membership: Membership,
    ) {
        for listener in listeners {
            let delivery = async {
                match membership {
                    Membership::Added => listener.member_added(event).await,
                    Membership::Removed => listener.member_removed(event).await,
                }
            };
            match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(registry = %self.name, error = %e, "listener failed");
                    self.report_failure(e.to_string()).await;
                }
                Err(_) => {
                    error!(registry = %self.name, "listener panicked");
                    self.report_failure("listener panicked".to_string())
                        .await;
                }
            }
        }
    }

    async fn announce(&self, event_type: EventType) {
        if let Err(e) = self.event_bus.publish(Event::of(event_type)).await {
            debug!(registry = %self.name, error = %e, "membership event had no subscribers");
        }
    }

    async fn report_failure(&self, message: String) {
        let _ = self
            .event_bus
            .publish_error(ErrorEvent {
                error_type: "RegistryError".to_string(),
                message,
                severity: ErrorSeverity::Error,
                parameters: {
                    let mut params = HashMap::new();
                    params.insert(
                        "registry".to_string(),
                        Value::String(self.name.clone()),
                    );
                    params
                },
            })
            .await;
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("registry lock poisoned")
    }
}

#[derive(Clone, Copy)]
enum Membership {
    Added,
    Removed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ManagedComponent, OperationSignature, RawInvoker};
    use crate::config::KernelConfig;
    use crate::{InvokeError, InvokeResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    struct EchoInvoker {
        id: ComponentId,
    }

    #[async_trait]
    impl RawInvoker for EchoInvoker {
        fn operation_index(&self) -> HashMap<OperationSignature, usize> {
            let mut index = HashMap::new();
            index.insert(OperationSignature::new("describe", 0), 0);
            index
        }

        async fn invoke(&self, index: usize, _args: Vec<Value>) -> InvokeResult<Value> {
            match index {
                0 => Ok(Value::String(self.id.to_string())),
                _ => Err(InvokeError::UnknownOperation { index }),
            }
        }
    }

    struct TestComponent {
        id: ComponentId,
        proxyable: bool,
    }

    impl TestComponent {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: ComponentId::new(id),
                proxyable: true,
            })
        }

        fn opaque(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: ComponentId::new(id),
                proxyable: false,
            })
        }
    }

    #[async_trait]
    impl ManagedComponent for TestComponent {
        fn component_id(&self) -> ComponentId {
            self.id.clone()
        }

        fn raw_invoker(&self) -> Option<Arc<dyn RawInvoker>> {
            if self.proxyable {
                Some(Arc::new(EchoInvoker {
                    id: self.id.clone(),
                }))
            } else {
                None
            }
        }
    }

    // イベントを数えるリスナー
    #[derive(Default)]
    struct CountingListener {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl ReferenceListener for CountingListener {
        async fn member_added(&self, _event: &ReferenceEvent) -> RegistryResult<()> {
            self.added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn member_removed(&self, _event: &ReferenceEvent) -> RegistryResult<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl ReferenceListener for FailingListener {
        async fn member_added(&self, _event: &ReferenceEvent) -> RegistryResult<()> {
            Err(RegistryError::ListenerFailed {
                message: "boom".to_string(),
            })
        }
    }

    struct PanickingListener;

    #[async_trait]
    impl ReferenceListener for PanickingListener {
        async fn member_added(&self, _event: &ReferenceEvent) -> RegistryResult<()> {
            panic!("listener exploded");
        }
    }

    async fn kernel_with_running(names: &[&str]) -> Arc<Kernel> {
        let kernel = Arc::new(Kernel::new(KernelConfig::default()));
        for name in names {
            kernel
                .register_component(TestComponent::new(name))
                .await
                .unwrap();
            kernel
                .start_component(&ComponentId::new(*name))
                .await
                .unwrap();
        }
        kernel
    }

    fn worker_interface() -> InterfaceSpec {
        InterfaceSpec::new("Worker").operation("describe", 0)
    }

    #[tokio::test]
    async fn test_initial_population() {
        let kernel = kernel_with_running(&["worker.1", "worker.2", "db.main"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        assert_eq!(registry.size(), 2);
        assert!(!registry.is_empty());
    }

    #[tokio::test]
    async fn test_member_added_on_running() {
        let kernel = kernel_with_running(&[]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        let listener = Arc::new(CountingListener::default());
        registry.add_listener(listener.clone());

        kernel
            .register_component(TestComponent::new("worker.1"))
            .await
            .unwrap();
        kernel
            .start_component(&ComponentId::new("worker.1"))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(registry.size(), 1);
        assert_eq!(listener.added.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_member_removed_on_stopping() {
        let kernel = kernel_with_running(&["worker.1"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();
        assert_eq!(registry.size(), 1);

        let listener = Arc::new(CountingListener::default());
        registry.add_listener(listener.clone());

        kernel
            .stop_component(&ComponentId::new("worker.1"))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(registry.size(), 0);
        // stopping/stoppedの両方が届くが除去イベントは一度だけ
        assert_eq!(listener.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_transitions_are_noops() {
        let kernel = kernel_with_running(&["worker.1"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        let listener = Arc::new(CountingListener::default());
        registry.add_listener(listener.clone());

        let id = ComponentId::new("worker.1");
        // 重複add
        registry.add_target(&kernel, &id).await.unwrap();
        registry.add_target(&kernel, &id).await.unwrap();
        assert_eq!(registry.size(), 1);
        assert_eq!(listener.added.load(Ordering::SeqCst), 0);

        // removeは一度だけ効く
        registry.remove_target(&id).await;
        registry.remove_target(&id).await;
        assert_eq!(registry.size(), 0);
        assert_eq!(listener.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let kernel = kernel_with_running(&[]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        let counting = Arc::new(CountingListener::default());
        registry.add_listener(Arc::new(FailingListener));
        registry.add_listener(Arc::new(PanickingListener));
        registry.add_listener(counting.clone());

        registry
            .add_target(&kernel_with_component("worker.1").await, &ComponentId::new("worker.1"))
            .await
            .unwrap();

        // 失敗したリスナーがいても他のリスナーには届き、メンバーも残る
        assert_eq!(counting.added.load(Ordering::SeqCst), 1);
        assert_eq!(registry.size(), 1);
    }

    async fn kernel_with_component(name: &str) -> Kernel {
        let kernel = Kernel::new(KernelConfig::default());
        kernel
            .register_component(TestComponent::new(name))
            .await
            .unwrap();
        kernel
    }

    #[tokio::test]
    async fn test_mutators_always_rejected() {
        let kernel = kernel_with_running(&["worker.1"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        let member = registry.snapshot().pop().unwrap();
        assert!(matches!(
            registry.add(member.clone()),
            Err(RegistryError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            registry.remove(&member),
            Err(RegistryError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            registry.add_all(vec![member.clone()]),
            Err(RegistryError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            registry.remove_all(&[member.clone()]),
            Err(RegistryError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            registry.retain_all(&[member.clone()]),
            Err(RegistryError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            registry.clear(),
            Err(RegistryError::UnsupportedOperation { .. })
        ));

        // 破棄後も同じ
        registry.destroy();
        assert!(matches!(
            registry.clear(),
            Err(RegistryError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            registry.add(member),
            Err(RegistryError::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_collapses_registry() {
        let kernel = kernel_with_running(&["worker.1", "worker.2"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();
        let member = registry.snapshot().pop().unwrap();
        assert_eq!(registry.size(), 2);

        registry.destroy();

        assert!(registry.is_destroyed());
        assert_eq!(registry.size(), 0);
        assert!(registry.is_empty());
        assert!(!registry.contains(&member));
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.iter().count(), 0);

        // 破棄後のrunning通知はno-op
        registry
            .add_target(&kernel, &ComponentId::new("worker.3"))
            .await
            .unwrap();
        assert_eq!(registry.size(), 0);

        // 二度目のdestroyはno-op
        registry.destroy();
    }

    #[tokio::test]
    async fn test_contains_all_after_destroy() {
        let kernel = kernel_with_running(&["worker.1"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();
        let member = registry.snapshot().pop().unwrap();

        assert!(registry.contains_all([member.as_ref()]));
        registry.destroy();
        assert!(!registry.contains_all([member.as_ref()]));
        // 空集合は常に含まれる
        assert!(registry.contains_all(std::iter::empty()));
    }

    #[tokio::test]
    async fn test_open_fails_without_raw_invoker() {
        let kernel = Arc::new(Kernel::new(KernelConfig::default()));
        kernel
            .register_component(TestComponent::opaque("worker.1"))
            .await
            .unwrap();
        kernel
            .start_component(&ComponentId::new("worker.1"))
            .await
            .unwrap();

        let result = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await;
        assert!(matches!(
            result,
            Err(RegistryError::Proxy(
                ProxyError::IntrospectionUnsupported { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_listener_registration_ignored() {
        let kernel = kernel_with_running(&[]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        let listener = Arc::new(CountingListener::default());
        registry.add_listener(listener.clone());
        registry.add_listener(listener.clone());

        let helper = kernel_with_component("worker.1").await;
        registry
            .add_target(&helper, &ComponentId::new("worker.1"))
            .await
            .unwrap();
        assert_eq!(listener.added.load(Ordering::SeqCst), 1);

        // 解除後は届かない
        let as_dyn: Arc<dyn ReferenceListener> = listener.clone();
        registry.remove_listener(&as_dyn);
        registry
            .add_target(&helper, &ComponentId::new("worker.2"))
            .await
            .unwrap_err(); // worker.2は登録されていないのでinvokerが無い
        assert_eq!(listener.added.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_iteration_sees_consistent_snapshot() {
        let kernel = kernel_with_running(&["worker.1", "worker.2"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        let iter = registry.iter();

        // スナップショット取得後の追加は反映されない
        kernel
            .register_component(TestComponent::new("worker.3"))
            .await
            .unwrap();
        kernel
            .start_component(&ComponentId::new("worker.3"))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(iter.count(), 2);
        assert_eq!(registry.size(), 3);
    }

    #[tokio::test]
    async fn test_proxy_member_is_invocable() {
        let kernel = kernel_with_running(&["worker.1"]).await;
        let registry = ReferenceRegistry::open(
            "workers",
            worker_interface(),
            Pattern::new("worker.*").unwrap(),
            &kernel,
        )
        .await
        .unwrap();

        let member = registry.snapshot().pop().unwrap();
        let described = member.call("describe", vec![]).await.unwrap();
        assert_eq!(described, Value::String("worker.1".to_string()));
        assert_eq!(member.to_string(), "[Worker: worker.1]");
    }
}
