use rpc::ServerAddress;
use thiserror::Error;

use crate::backend::BackendError;
use crate::history::HistoryError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool '{name}' is provided by both {first} and {second}")]
    NameCollision {
        name: String,
        first: ServerAddress,
        second: ServerAddress,
    },

    #[error("unknown server: {0}")]
    UnknownServer(ServerAddress),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Rpc(#[from] rpc::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
