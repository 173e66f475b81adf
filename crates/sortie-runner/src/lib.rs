pub mod context;
pub mod daemon;
pub mod discovery;
pub mod dispatcher;
pub mod docker;
pub mod once;
pub mod repo;
pub mod runtime;
pub mod subprocess;
pub mod tracker;
pub mod watchdog;
pub mod workspace;
