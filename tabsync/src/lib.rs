pub mod alerts;
pub mod api;
mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod draft;
pub mod logging;
pub mod navigation;
pub mod settings;
pub mod storage;

pub use app::App;

// Always expose testing module (integration tests need it)
pub mod testing;
