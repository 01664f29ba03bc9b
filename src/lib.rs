//! # KAGAMI: Live Proxy Reference Registries for Managed Components
//!
//! KAGAMI is a component-management kernel whose centerpiece is the
//! *reference registry*: a thread-safe collection of proxy handles that is
//! populated and pruned automatically as the components it tracks move
//! through their lifecycle. Callers obtain the collection once and read it
//! like an ordinary container; its membership is never client-writable.
//!
//! ## Architecture
//!
//! ### 1. Event-Driven Kernel
//! The [`kernel`] module owns the component table and drives every lifecycle
//! transition (`Stopped -> Starting -> Running -> Stopping -> Stopped ->
//! Unloaded`), publishing each one on the broadcast [`event_bus`]. The legal
//! transitions live in [`lifecycle`].
//!
//! ### 2. Reference Registries
//! The [`registry`] module consumes the kernel's lifecycle feed: a
//! `ComponentRunning` event adds a proxy for the component, and any of the
//! stop-side events evicts it. Membership changes are delivered to
//! registered listeners outside the registry lock, with per-listener fault
//! isolation, and `destroy()` collapses a registry permanently.
//!
//! ### 3. Proxy Dispatch
//! The [`proxy`] module manufactures the member handles: each proxy carries
//! an immutable dispatch table, resolved once at construction, that routes
//! interface operations to the component's indexed [`component::RawInvoker`]
//! and binds the identity operations (`equals`, `hash_code`, `to_string`) to
//! the proxy instance itself.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use kagami::{InterfaceSpec, Kernel, KernelConfig, Pattern, ReferenceRegistry};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kernel = Arc::new(Kernel::new(KernelConfig::default()));
//!
//! let workers = ReferenceRegistry::open(
//!     "workers",
//!     InterfaceSpec::new("Worker").operation("describe", 0),
//!     Pattern::new("worker.*")?,
//!     &kernel,
//! )
//! .await?;
//!
//! for proxy in workers.iter() {
//!     let description = proxy.call("describe", vec![]).await?;
//!     println!("{}: {:?}", proxy, description);
//! }
//! # Ok(())
//! # }
//! ```

pub mod component;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod kernel;
pub mod lifecycle;
pub mod proxy;
pub mod registry;

// Re-exports
pub use component::*;
pub use config::KernelConfig;
pub use error::*;
pub use event_bus::{ErrorEvent, ErrorSeverity, Event, EventBus, LastStatus, Value};
pub use kernel::{Kernel, KernelError, KernelResult, LifecycleListener, LifecycleSubscription};
pub use lifecycle::{ComponentState, EventType};
pub use proxy::{ComponentProxy, InterfaceSpec, ProxyError, ProxyFactory, ProxyResult};
pub use registry::{
    ReferenceEvent, ReferenceListener, ReferenceRegistry, RegistryError, RegistryResult,
};
