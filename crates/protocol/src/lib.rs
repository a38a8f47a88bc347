pub mod config;
pub mod error;
pub mod line;
pub mod resp;

pub use config::{FileServerConfig, ListenConfig, RouterConfig, StorageBackend, UserServerConfig};
pub use error::ServiceError;
pub use resp::{RespClient, RespValue};
