pub mod error;
pub mod types;
pub mod config;
pub mod store;
pub mod provider;
pub mod service;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
