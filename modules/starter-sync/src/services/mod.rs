pub mod reindex_service;
pub mod startup;
