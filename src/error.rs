use thiserror::Error;

use crate::component::{ComponentError, InvokeError};
use crate::event_bus::EventError;
use crate::kernel::KernelError;
use crate::proxy::ProxyError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Component error: {0}")]
    Component(#[from] ComponentError),
    #[error("Invoke error: {0}")]
    Invoke(#[from] InvokeError),
    // event error
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
