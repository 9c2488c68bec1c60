pub mod logs;
pub mod metrics;
pub mod metrics_http;
pub mod registry;
pub mod server;
pub mod state;
