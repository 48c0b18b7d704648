use thiserror::Error;

use crate::config::ConfigError;
use crate::coordinator::RequestError;
use crate::event::event_bus::EventError;
use crate::registry::RegistryError;
use crate::system::SystemError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("System error: {0}")]
    System(#[from] SystemError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    // event error
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

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
