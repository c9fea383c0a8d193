pub mod bots;
pub mod config;
pub mod gate;
pub mod logging;
pub mod queue;
pub mod recorder;
pub mod request;
pub mod statement;
pub mod store;
pub mod uniqueness;
