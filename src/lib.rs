#[cfg(not(unix))]
compile_error!("fwdkeeper supports Unix platforms only");

pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;

pub use config::Config;
pub use error::{DaemonError, Result};
