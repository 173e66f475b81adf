pub mod config;
pub mod discovery;
pub mod prompt;
pub mod scheduler;
pub mod task;
pub mod telemetry;
