pub mod config;
pub mod consumer;
pub mod events;
pub mod metrics;
pub mod models;
pub mod repos;
pub mod routes;
pub mod search;
pub mod services;

pub use consumer::sync_handler::SyncHandler;
pub use services::reindex_service::{ReindexError, ReindexReport, ReindexService};
pub use services::startup::catch_up_then_consume;
