pub mod accounting;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod glob;
pub mod keys;
pub mod lifecycle;
pub mod limits;
pub mod metrics;
pub mod pool;
pub mod queue_status;
pub mod reaper;
pub mod reporting;
pub mod sender;
pub mod settings;
pub mod state;
pub mod tracking;
pub mod upstream;
pub mod warmup;
