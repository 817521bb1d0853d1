pub mod config;
pub mod http;

pub use config::CliConfig;
pub use http::{router, run_server, AppState};
