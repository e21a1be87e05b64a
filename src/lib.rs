pub mod batch;
pub mod config;
pub mod ctrlseq;
pub mod error;
pub mod http;
pub mod network;
pub mod pty;
pub mod rate_limit;
pub mod session;
pub mod sse;
pub mod telemetry;
pub mod validate;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use http::AppState;
