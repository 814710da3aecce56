pub mod archive_handlers;
pub mod health_handlers;
