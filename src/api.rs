//! HTTP and WebSocket surface.

pub mod routers;
pub mod server;
pub mod system;
pub mod ws;

pub use server::start_http_server;
