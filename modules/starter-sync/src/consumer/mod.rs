pub mod sync_handler;
