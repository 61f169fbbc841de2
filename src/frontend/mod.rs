//! Frontend listener.
//!
//! Accepts client connections and hands every HTTP request to the proxy engine.

mod listener;

pub use listener::FrontendListener;
