//! # Proxy Dispatch
//!
//! Builds synthetic proxies for managed components. A proxy implements one
//! [`InterfaceSpec`] and forwards calls to the component's [`RawInvoker`]
//! through a dispatch table resolved once at construction:
//!
//! ```text
//! call(name, args) -> signature lookup -> slot -> raw invoke(index, args)
//! ```
//!
//! The identity-sensitive operations `equals/1`, `hash_code/0` and
//! `to_string/0` never reach the component. They are bound to the proxy
//! instance itself, so equality reflects proxy identity, the hash is stable
//! per instance, and rendering shows `[<interface>: <target>]`. The same
//! semantics surface as the std `PartialEq`/`Hash`/`Display` impls.
//!
//! A proxy is immutable after construction and can be shared across tasks
//! without locking; only the target component behind the raw invoker decides
//! how concurrent invocations behave.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::component::{ComponentId, InvokeError, OperationSignature, RawInvoker};
use crate::event_bus::Value;

/// Description of the interface a proxy implements: a named set of
/// operation signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    name: String,
    operations: Vec<OperationSignature>,
}

impl InterfaceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
        }
    }

    pub fn operation(mut self, name: &str, arity: usize) -> Self {
        self.operations.push(OperationSignature::new(name, arity));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[OperationSignature] {
        &self.operations
    }
}

/// One entry in a proxy's dispatch table.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DispatchSlot {
    /// Forward to the raw invoker at this operation index.
    Forward(usize),
    /// Compare the argument against this proxy instance's identity token.
    InstanceEquality,
    /// Stable per-instance hash.
    InstanceHash,
    /// Render `[<interface>: <target>]`.
    Render,
    /// Declared on the interface but not offered by the component.
    Unresolved,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Component {target} does not expose a raw invoker")]
    IntrospectionUnsupported { target: ComponentId },

    #[error("No implementation operation: target={target}, method={method}")]
    UnsupportedOperation { target: ComponentId, method: String },

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvokeError),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Manufactures proxies for one interface.
pub struct ProxyFactory {
    interface: Arc<InterfaceSpec>,
}

impl ProxyFactory {
    pub fn new(interface: InterfaceSpec) -> Self {
        Self {
            interface: Arc::new(interface),
        }
    }

    pub fn interface(&self) -> &Arc<InterfaceSpec> {
        &self.interface
    }

    /// Builds the dispatch table for `target` and returns the finished proxy.
    ///
    /// Interface operations found in the component's operation index become
    /// forwarding slots; missing ones stay unresolved and fail at call time.
    /// The identity operations are bound last so they always win over a
    /// same-named raw operation.
    pub fn create_proxy(
        &self,
        target: ComponentId,
        invoker: Arc<dyn RawInvoker>,
    ) -> ComponentProxy {
        let operations = invoker.operation_index();

        let mut slots = Vec::new();
        let mut slot_index = HashMap::new();
        for signature in self.interface.operations() {
            let slot = match operations.get(signature) {
                Some(index) => DispatchSlot::Forward(*index),
                None => DispatchSlot::Unresolved,
            };
            slot_index.insert(signature.clone(), slots.len());
            slots.push(slot);
        }

        // equals/hash_code/to_stringはここで直接処理する
        for (signature, slot) in [
            (OperationSignature::new("equals", 1), DispatchSlot::InstanceEquality),
            (OperationSignature::new("hash_code", 0), DispatchSlot::InstanceHash),
            (OperationSignature::new("to_string", 0), DispatchSlot::Render),
        ] {
            match slot_index.get(&signature) {
                Some(position) => slots[*position] = slot,
                None => {
                    slot_index.insert(signature, slots.len());
                    slots.push(slot);
                }
            }
        }

        debug!(
            interface = self.interface.name(),
            target = %target,
            slots = slots.len(),
            "proxy dispatch table resolved"
        );

        ComponentProxy {
            interface: self.interface.clone(),
            target,
            invoker,
            slots,
            slot_index,
            instance_id: Uuid::new_v4(),
        }
    }
}

/// A synthetic handle implementing one interface against one component.
pub struct ComponentProxy {
    interface: Arc<InterfaceSpec>,
    target: ComponentId,
    invoker: Arc<dyn RawInvoker>,
    slots: Vec<DispatchSlot>,
    slot_index: HashMap<OperationSignature, usize>,
    instance_id: Uuid,
}

impl ComponentProxy {
    /// Dispatches one call through the table.
    ///
    /// Downstream invocation failures propagate unchanged; this layer adds
    /// nothing but the table lookup.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> ProxyResult<Value> {
        let signature = OperationSignature::new(method, args.len());
        let slot = self
            .slot_index
            .get(&signature)
            .map(|position| &self.slots[*position]);

        match slot {
            Some(DispatchSlot::Forward(index)) => Ok(self.invoker.invoke(*index, args).await?),
            Some(DispatchSlot::InstanceEquality) => {
                Ok(Value::Boolean(args.first() == Some(&self.identity_token())))
            }
            Some(DispatchSlot::InstanceHash) => Ok(Value::Integer(self.instance_hash())),
            Some(DispatchSlot::Render) => Ok(Value::String(self.to_string())),
            Some(DispatchSlot::Unresolved) | None => Err(ProxyError::UnsupportedOperation {
                target: self.target.clone(),
                method: signature.to_string(),
            }),
        }
    }

    pub fn target(&self) -> &ComponentId {
        &self.target
    }

    pub fn interface_name(&self) -> &str {
        self.interface.name()
    }

    /// Value-level identity of this proxy instance, the argument convention
    /// for `equals/1`.
    pub fn identity_token(&self) -> Value {
        Value::String(self.instance_id.to_string())
    }

    fn instance_hash(&self) -> i64 {
        i64::from_le_bytes(self.instance_id.as_bytes()[..8].try_into().unwrap_or([0; 8]))
    }
}

impl PartialEq for ComponentProxy {
    fn eq(&self, other: &Self) -> bool {
        // 同一インスタンスのみ等しい。同じtargetでも別proxyは等しくない
        self.instance_id == other.instance_id
    }
}

impl Eq for ComponentProxy {}

impl Hash for ComponentProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_id.hash(state);
    }
}

impl fmt::Display for ComponentProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {}]", self.interface.name(), self.target)
    }
}

impl fmt::Debug for ComponentProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentProxy")
            .field("interface", &self.interface.name())
            .field("target", &self.target)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}
