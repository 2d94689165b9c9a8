pub mod api;
pub mod api_key;
pub mod args;
pub mod config;
pub mod error;
pub mod history;
pub mod image;
pub mod progress;
pub mod render;
pub mod repl;
