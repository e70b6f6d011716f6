pub mod chain;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod store;
