pub mod backoff;
pub mod bitflyer;
pub mod config;
pub mod error;
pub mod event;
pub mod ingest;
pub mod model;
pub mod queue;
pub mod server;
pub mod store;
