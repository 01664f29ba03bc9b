//! Component identity, selection patterns, and the managed-component traits.
//!
//! A [`ComponentId`] names one component instance inside the kernel. A
//! [`Pattern`] selects zero or more ids with glob syntax (`"worker.*"`,
//! `"db"`), which is how reference registries scope the components they
//! track. [`RawInvoker`] is the indexed dispatch accessor a component exposes
//! for proxying: a signature-to-slot table resolved once at proxy
//! construction, and a generic `invoke(index, args)` entry point so that no
//! per-call signature lookup is needed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::event_bus::Value;

/// Unique name of one managed component instance within the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<T: Into<String>> From<T> for ComponentId
where
    T: AsRef<str>,
{
    fn from(value: T) -> Self {
        Self(value.into())
    }
}

/// Glob selector over component ids.
#[derive(Debug, Clone)]
pub struct Pattern {
    pattern: glob::Pattern,
}

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, ComponentError> {
        let pattern = glob::Pattern::new(pattern).map_err(|e| ComponentError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { pattern })
    }

    pub fn matches(&self, id: &ComponentId) -> bool {
        self.pattern.matches(id.as_str())
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern.as_str())
    }
}

/// Signature key of one raw operation: name plus argument count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationSignature {
    pub name: String,
    pub arity: usize,
}

impl OperationSignature {
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        Self {
            name: name.into(),
            arity,
        }
    }
}

impl fmt::Display for OperationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.arity)
    }
}

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("No operation at index {index}")]
    UnknownOperation { index: usize },

    #[error("Invocation failed: {message}")]
    Failed { message: String },
}

pub type InvokeResult<T> = Result<T, InvokeError>;

/// Indexed dispatch accessor for one component.
///
/// The operation index is resolved once per proxy; after that every call
/// goes through `invoke` with a plain slot index.
#[async_trait]
pub trait RawInvoker: Send + Sync {
    /// Signature-to-slot table. Stable for the lifetime of the component.
    fn operation_index(&self) -> HashMap<OperationSignature, usize>;

    async fn invoke(&self, index: usize, args: Vec<Value>) -> InvokeResult<Value>;
}

/// A component instance managed by the kernel.
#[async_trait]
pub trait ManagedComponent: Send + Sync {
    fn component_id(&self) -> ComponentId;

    /// The introspection accessor used for proxying. Components that return
    /// `None` cannot be placed behind a proxy; a registry add for such a
    /// component fails.
    fn raw_invoker(&self) -> Option<Arc<dyn RawInvoker>>;

    async fn start(&self) -> InvokeResult<()> {
        Ok(())
    }

    async fn stop(&self) -> InvokeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        let pattern = Pattern::new("worker.*").unwrap();
        assert!(pattern.matches(&ComponentId::new("worker.1")));
        assert!(pattern.matches(&ComponentId::new("worker.backup")));
        assert!(!pattern.matches(&ComponentId::new("db.main")));
    }

    #[test]
    fn test_exact_pattern() {
        let pattern = Pattern::new("db").unwrap();
        assert!(pattern.matches(&ComponentId::new("db")));
        assert!(!pattern.matches(&ComponentId::new("db.main")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(Pattern::new("worker.[").is_err());
    }

    #[test]
    fn test_signature_display() {
        let sig = OperationSignature::new("resize", 2);
        assert_eq!(sig.to_string(), "resize/2");
    }
}
