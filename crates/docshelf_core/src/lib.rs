pub mod acquire;
pub mod config;
pub mod error;
pub mod http;
pub mod library;
pub mod manifest;
pub mod reader;
pub mod runtime;
pub mod store;
pub mod sync;
