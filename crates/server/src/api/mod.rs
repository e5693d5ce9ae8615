//! HTTP and RPC surface of the server.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod rpc;
pub mod server;

pub use server::routes;
pub use server::ApiServer;
