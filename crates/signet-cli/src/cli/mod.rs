pub mod commands;
pub mod config;

pub use commands::Session;
pub use config::CliConfig;
