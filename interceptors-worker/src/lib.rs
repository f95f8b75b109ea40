pub mod activity;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod error_tracking;
pub mod exporter;
pub mod health;
pub mod identity;
pub mod interceptor;
pub mod logging;
pub mod metrics_server;
pub mod pipeline;
pub mod queue;
pub mod sample;
pub mod signals;
pub mod worker;
pub mod workflow;
