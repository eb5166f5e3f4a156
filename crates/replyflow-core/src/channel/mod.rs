//! Push channel transport.

mod backoff;
mod connection;

pub use backoff::ReconnectPolicy;
pub use connection::{
    ConnectionConfig, ConnectionListener, ConnectionManager, ConnectionState, UpdateListener,
};
