//! Request forwarding: per-backend transports and the retrying proxy engine.

mod body;
mod engine;
mod transport;

pub use body::RelayBody;
pub use engine::{
    ProxyBody, ProxyEngine, ProxyEngineConfig, client_ip, error_response, forwarded_for_chain,
};
pub use transport::{Transport, TransportError};
