pub mod api;
pub mod chat;
pub mod config;
pub mod models;

pub use config::ChatConfig;
