pub mod api;
pub mod config;
pub mod event;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
pub mod track;
