pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod id;
pub mod server;

pub use client::{ConnHandle, Dialer, VirtualConn, is_virtual_conn};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ClientError, ClientResult, ServerError, ServerResult};
pub use id::ConnectionId;
pub use server::{ServerHandler, serve};
