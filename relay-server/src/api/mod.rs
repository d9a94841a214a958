mod error;
mod handlers;
mod routes;
mod server;
mod sse;
mod upload;

pub use handlers::AppState;
pub use server::HttpServer;
